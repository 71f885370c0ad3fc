//! Payloads of the index server user API.
use serde::{Deserialize, Serialize};

pub mod auth {
    use super::*;

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    #[serde(deny_unknown_fields)]
    pub struct SignupRequest {
        pub name: String,
        pub email: String,
        pub password: String,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct SignupResponse {
        pub id: String,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    #[serde(deny_unknown_fields)]
    pub struct LoginRequest {
        pub email: String,
        pub password: String,
        #[serde(default)]
        pub otp: Option<String>,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct LoginResponse {
        pub token: String,
    }

    /// The provisioning URI of a freshly generated TOTP secret.
    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct TwoFactorResponse {
        pub uri: String,
    }
}

pub mod organizations {
    use super::*;

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct Organization {
        pub id: String,
        pub name: String,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    #[serde(deny_unknown_fields)]
    pub struct NewOrganizationRequest {
        pub name: String,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct FileServer {
        pub id: String,
        #[serde(rename = "orgID")]
        pub org_id: String,
        pub name: String,
        #[serde(rename = "authURL")]
        pub auth_url: String,
        #[serde(rename = "tokenURL")]
        pub token_url: String,
        #[serde(rename = "fetchURL")]
        pub fetch_url: String,
        #[serde(rename = "controlEndpoint")]
        pub control_endpoint: String,
        pub healthy: bool,
    }
}

pub mod accounts {
    use super::*;

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    #[serde(deny_unknown_fields)]
    pub struct LinkAccountRequest {
        #[serde(rename = "orgName")]
        pub org_name: String,
        #[serde(rename = "serverName")]
        pub server_name: String,
        #[serde(default)]
        pub force: bool,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct LinkAccountResponse {
        pub redirect: String,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct AccountInfo {
        #[serde(rename = "serverID")]
        pub server_id: String,
        pub checkpoint: i64,
        #[serde(rename = "needsRelink")]
        pub needs_relink: bool,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct AuthCallbackQuery {
        pub state: String,
        pub code: String,
    }
}

pub mod mappings {
    use super::*;

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct Mapping {
        pub id: String,
        #[serde(rename = "serverID")]
        pub server_id: String,
        #[serde(rename = "fileRef")]
        pub file_ref: String,
        pub path: String,
        #[serde(rename = "patientID")]
        pub patient_id: Option<String>,
        #[serde(rename = "sizeBytes")]
        pub size_bytes: i64,
        pub deleted: bool,
        #[serde(rename = "updatedNs")]
        pub updated_ns: i64,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    #[serde(deny_unknown_fields)]
    pub struct NewMappingRequest {
        #[serde(rename = "serverID")]
        pub server_id: String,
        #[serde(rename = "fileRef")]
        pub file_ref: String,
        pub path: String,
        #[serde(rename = "patientID", default)]
        pub patient_id: Option<String>,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
    #[serde(deny_unknown_fields)]
    pub struct UpdateMappingRequest {
        #[serde(default)]
        pub path: Option<String>,
        #[serde(rename = "patientID", default)]
        pub patient_id: Option<String>,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
    pub struct ListMappingsQuery {
        /// Path prefix.
        pub path: Option<String>,
        pub id: Option<String>,
        pub file_id: Option<String>,
        pub patient_id: Option<String>,
        pub updated_after: Option<i64>,
        pub updated_before: Option<i64>,
        #[serde(default)]
        pub force_update: bool,
    }

    #[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
    pub struct ListMappingsResponse {
        pub mappings: Vec<Mapping>,
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub message: String,
    pub failing_servers: usize,
}
