mod accounts;
mod file_servers;
mod mappings;
mod oauth2_pending;
mod organizations;
mod sessions;
mod users;
mod util;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RepositoryError {
    #[snafu(display("{} not found", what))]
    NotFound { what: String },

    #[snafu(display("{} already exists", what))]
    AlreadyExists { what: String },

    #[snafu(display("database error: {}", source))]
    Db { source: ::sled::Error },

    #[snafu(display("corrupted record: {}", source))]
    Encoding { source: bincode::Error },
}

impl RepositoryError {
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn already_exists<S: Into<String>>(what: S) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T, E = RepositoryError> = std::result::Result<T, E>;

pub mod iface {
    use std::sync::Arc;

    use async_trait::async_trait;

    #[async_trait]
    pub trait Flush {
        async fn flush(&self) -> anyhow::Result<()>;
    }

    pub use super::users::UserStore;
    pub type DynUserStore = Arc<dyn UserStore + Send + Sync>;

    pub use super::sessions::SessionStore;
    pub type DynSessionStore = Arc<dyn SessionStore + Send + Sync>;

    pub use super::organizations::OrganizationStore;
    pub type DynOrganizationStore = Arc<dyn OrganizationStore + Send + Sync>;

    pub use super::file_servers::FileServerStore;
    pub type DynFileServerStore = Arc<dyn FileServerStore + Send + Sync>;

    pub use super::accounts::UserAccountStore;
    pub type DynUserAccountStore = Arc<dyn UserAccountStore + Send + Sync>;

    pub use super::oauth2_pending::PendingOAuth2Store;
    pub type DynPendingOAuth2Store = Arc<dyn PendingOAuth2Store + Send + Sync>;

    pub use super::mappings::MappingStore;
    pub type DynMappingStore = Arc<dyn MappingStore + Send + Sync>;
}

pub mod sled {
    pub use super::accounts::SledUserAccountStore;
    pub use super::file_servers::SledFileServerStore;
    pub use super::mappings::SledMappingStore;
    pub use super::oauth2_pending::SledPendingOAuth2Store;
    pub use super::organizations::SledOrganizationStore;
    pub use super::sessions::SledSessionStore;
    pub use super::users::SledUserStore;
}
