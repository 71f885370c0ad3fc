mod mappings;
mod registrar;
pub(crate) mod totp;
mod users;

pub use mappings::{MappingError, MappingService};
pub use registrar::{
    DynTokenClient, HttpTokenClient, Registrar, RegistrarError, ServerStatus, TokenClient,
    TokenError,
};
pub use users::{UserError, UserService};
