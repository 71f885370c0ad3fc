//! MIFS authentication library.
//!
//! Provides signed, expiring tokens (branca) and the axum extractors that turn an incoming
//! request into a caller identity.
mod identity;
mod token;
pub mod tls;

pub use identity::{ClientIdentity, TrustedCnHeader};
pub use token::{decode_token, make_token, make_token_with_ttl, EncryptionKey, TOKEN_TTL_SECONDS};

use serde::{Deserialize, Serialize};

/// The kind of an OAuth2 token minted by a file server.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Body of the OAuth2 tokens minted by a file server.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileServerClaims {
    pub user: String,
    pub client_id: String,
    pub kind: TokenKind,
}
