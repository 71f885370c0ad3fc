//! OAuth2 authorization-code flow payloads (RFC 6749).
use serde::{Deserialize, Serialize};

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";
pub const RESPONSE_TYPE_CODE: &str = "code";

pub const ERROR_INVALID_CLIENT: &str = "invalid_client";
pub const ERROR_INVALID_GRANT: &str = "invalid_grant";
pub const ERROR_INVALID_REQUEST: &str = "invalid_request";
pub const ERROR_UNSUPPORTED_GRANT_TYPE: &str = "unsupported_grant_type";

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuthorizeQuery {
    pub client_id: String,
    pub state: String,
    pub response_type: String,
    pub redirect_uri: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct TokenRequest {
    pub grant_type: String,
    pub code: Option<String>,
    pub refresh_token: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the access token, in seconds.
    pub expires_in: u64,
    pub token_type: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    pub fn new<S: Into<String>>(error: S) -> Self {
        Self {
            error: error.into(),
            error_description: None,
        }
    }
}
