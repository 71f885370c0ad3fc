//! Payloads exchanged between a file server and the index server over HTTP.
use serde::{Deserialize, Serialize};

/// What a file server announces about itself when registering.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerInfo {
    #[serde(rename = "orgName")]
    pub org_name: String,
    pub name: String,
    #[serde(rename = "authURL")]
    pub auth_url: String,
    #[serde(rename = "tokenURL")]
    pub token_url: String,
    #[serde(rename = "fetchURL")]
    pub fetch_url: String,
    #[serde(rename = "controlEndpoint")]
    pub control_endpoint: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum RegistrationResult {
    #[serde(rename = "OK")]
    Ok,
    AlreadyRegistered,
    Fail,
}

impl RegistrationResult {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RegistrationResult::Ok | RegistrationResult::AlreadyRegistered
        )
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RegisterResponse {
    pub result: RegistrationResult,
    #[serde(rename = "serverID")]
    pub server_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct StatusRequest {
    #[serde(rename = "serverID")]
    pub server_id: String,
    pub healthy: bool,
    /// Seconds since the file server started.
    pub uptime: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SyncErrorEntry {
    #[serde(rename = "orgName")]
    pub org_name: String,
    #[serde(rename = "serverName")]
    pub server_name: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SyncErrorsResponse {
    pub errors: Vec<SyncErrorEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_result_wire_names() {
        assert_eq!(
            serde_json::to_string(&RegistrationResult::Ok).unwrap(),
            "\"OK\""
        );
        assert_eq!(
            serde_json::from_str::<RegistrationResult>("\"AlreadyRegistered\"").unwrap(),
            RegistrationResult::AlreadyRegistered
        );
        assert!(!RegistrationResult::Fail.is_success());
    }
}
