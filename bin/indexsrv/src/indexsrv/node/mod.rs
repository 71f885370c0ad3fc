pub mod model;
mod service;
mod store;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use tokio::time::Instant;

use crate::sync::{ConnTracker, MultiSyncError, Shared, SyncEngine};
use crate::Config;

pub use service::{
    DynTokenClient, HttpTokenClient, MappingError, MappingService, Registrar, RegistrarError,
    ServerStatus, TokenClient, TokenError, UserError, UserService,
};
pub use store::RepositoryError;

use store::iface::{
    DynFileServerStore, DynMappingStore, DynOrganizationStore, DynPendingOAuth2Store,
    DynSessionStore, DynUserAccountStore, DynUserStore,
};
use store::sled::{
    SledFileServerStore, SledMappingStore, SledOrganizationStore, SledPendingOAuth2Store,
    SledSessionStore, SledUserAccountStore, SledUserStore,
};

/// The backing stores of an index node.
pub struct Stores {
    pub users: DynUserStore,
    pub sessions: DynSessionStore,
    pub organizations: DynOrganizationStore,
    pub servers: DynFileServerStore,
    pub accounts: DynUserAccountStore,
    pub pending: DynPendingOAuth2Store,
    pub mappings: DynMappingStore,
}

/// Everything the HTTP layer serves from.
pub struct IndexNode {
    users: Arc<UserService>,
    registrar: Arc<Registrar>,
    mappings: Arc<MappingService>,
    sync: Arc<SyncEngine>,
}

impl IndexNode {
    pub fn users(&self) -> Arc<UserService> {
        self.users.clone()
    }

    pub fn registrar(&self) -> Arc<Registrar> {
        self.registrar.clone()
    }

    pub fn mappings(&self) -> Arc<MappingService> {
        self.mappings.clone()
    }

    pub fn sync(&self) -> Arc<SyncEngine> {
        self.sync.clone()
    }

    pub async fn flush(&self) -> Result<()> {
        self.users.flush().await?;
        self.registrar.flush().await?;
        self.mappings.flush().await?;
        Ok(())
    }
}

#[tracing::instrument]
fn init_sled(path: &Path) -> Result<sled::Db> {
    let start = Instant::now();
    let db = sled::open(path)?;
    let load_duration = Instant::now().duration_since(start);
    tracing::debug!(time=?load_duration, "complete");
    Ok(db)
}

/// Wires services and the sync engine over `stores`.
pub fn assemble(c: &Config, stores: Stores, tokens: DynTokenClient) -> Result<IndexNode> {
    let users = Arc::new(UserService::new(
        stores.users,
        stores.sessions,
        c.node.session_ttl_seconds,
        &c.node.admin_users,
    ));

    let registrar = Arc::new(Registrar::new(
        stores.organizations,
        stores.servers.clone(),
        stores.accounts,
        stores.pending,
        tokens,
        c.oauth2.clone(),
        c.node.redirect_uri(),
    ));

    let mappings = Arc::new(MappingService::new(stores.mappings, stores.servers));

    let sync = Arc::new(SyncEngine::new(Shared {
        users: users.clone(),
        registrar: registrar.clone(),
        mappings: mappings.clone(),
        conns: ConnTracker::new(&c.sync)?,
        errors: Arc::new(MultiSyncError::new()),
        settings: c.sync.clone(),
    }));

    Ok(IndexNode {
        users,
        registrar,
        mappings,
        sync,
    })
}

#[tracing::instrument(skip(c))]
pub fn make_node(c: &Config) -> Result<IndexNode> {
    tracing::debug!("begin node init");
    let db = init_sled(&c.node.db_path)?;

    let stores = Stores {
        users: Arc::new(SledUserStore::new(&db)?),
        sessions: Arc::new(SledSessionStore::new(&db)?),
        organizations: Arc::new(SledOrganizationStore::new(&db)?),
        servers: Arc::new(SledFileServerStore::new(&db)?),
        accounts: Arc::new(SledUserAccountStore::new(&db)?),
        pending: Arc::new(SledPendingOAuth2Store::new(&db)?),
        mappings: Arc::new(SledMappingStore::new(&db)?),
    };

    let tokens: DynTokenClient = Arc::new(HttpTokenClient::new(&c.sync)?);
    let node = assemble(c, stores, tokens)?;

    let purged = node.users.purge_expired_sessions()?;
    tracing::debug!(purged, "node init complete");
    Ok(node)
}

#[cfg(test)]
pub(crate) mod test;
