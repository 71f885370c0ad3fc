//! Records owned by the index server.
use protocol::index::{mappings, organizations};
use protocol::is2fs::{self, ChangeType};

use serde::{Deserialize, Serialize};

/// Prefix of the path given to a mapping before its user places it.
pub const UNASSIGNED_PREFIX: &str = "unassigned/";

pub fn unassigned_path(server_id: &str, file_ref: &str) -> String {
    format!("{}{}/{}", UNASSIGNED_PREFIX, server_id, file_ref)
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub totp_secret: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    /// Unix seconds.
    pub expires_at: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Organization {
    pub id: String,
    pub name: String,
}

impl From<Organization> for organizations::Organization {
    fn from(o: Organization) -> Self {
        Self {
            id: o.id,
            name: o.name,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct FileServer {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub auth_url: String,
    pub token_url: String,
    pub fetch_url: String,
    pub control_endpoint: String,

    /// Common name of the certificate the server registered with.
    pub common_name: String,
}

impl FileServer {
    pub fn to_dto(&self, healthy: bool) -> organizations::FileServer {
        organizations::FileServer {
            id: self.id.clone(),
            org_id: self.org_id.clone(),
            name: self.name.clone(),
            auth_url: self.auth_url.clone(),
            token_url: self.token_url.clone(),
            fetch_url: self.fetch_url.clone(),
            control_endpoint: self.control_endpoint.clone(),
            healthy,
        }
    }
}

/// A user's link to one file server.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserAccount {
    pub user_id: String,
    pub server_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub token_expires_at: i64,
    pub checkpoint_ns: i64,
    pub needs_relink: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PendingOAuth2 {
    pub state: String,
    pub user_id: String,
    pub server_id: String,
    /// Unix seconds.
    pub created_at: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Mapping {
    pub id: String,
    pub user_id: String,
    pub server_id: String,
    pub file_ref: String,
    pub path: String,
    pub patient_id: Option<String>,
    pub size_bytes: i64,
    pub deleted: bool,
    pub updated_ns: i64,
}

impl From<Mapping> for mappings::Mapping {
    fn from(m: Mapping) -> Self {
        Self {
            id: m.id,
            server_id: m.server_id,
            file_ref: m.file_ref,
            path: m.path,
            patient_id: m.patient_id,
            size_bytes: m.size_bytes,
            deleted: m.deleted,
            updated_ns: m.updated_ns,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MappingQuery {
    pub id: Option<String>,
    pub file_ref: Option<String>,
    pub patient_id: Option<String>,
    pub path_prefix: Option<String>,
    pub updated_after: Option<i64>,
    pub updated_before: Option<i64>,
}

impl MappingQuery {
    pub fn matches(&self, m: &Mapping) -> bool {
        self.id.as_ref().map_or(true, |id| &m.id == id)
            && self.file_ref.as_ref().map_or(true, |r| &m.file_ref == r)
            && self
                .patient_id
                .as_ref()
                .map_or(true, |p| m.patient_id.as_ref() == Some(p))
            && self
                .path_prefix
                .as_ref()
                .map_or(true, |p| m.path.starts_with(p.as_str()))
            && self.updated_after.map_or(true, |t| m.updated_ns > t)
            && self.updated_before.map_or(true, |t| m.updated_ns < t)
    }
}

/// Changes a user makes to one of their mappings. Only the user-owned columns can change;
/// size, tombstone and stamp belong to the file server.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MappingEdit {
    pub path: Option<String>,
    /// `Some(None)` clears the patient.
    pub patient_id: Option<Option<String>>,
}

impl MappingEdit {
    pub fn apply(&self, m: &mut Mapping) {
        if let Some(path) = &self.path {
            m.path = path.clone();
        }
        if let Some(patient_id) = &self.patient_id {
            m.patient_id = patient_id.clone();
        }
    }
}

impl From<mappings::ListMappingsQuery> for MappingQuery {
    fn from(q: mappings::ListMappingsQuery) -> Self {
        Self {
            id: q.id,
            file_ref: q.file_id,
            patient_id: q.patient_id,
            path_prefix: q.path,
            updated_after: q.updated_after,
            updated_before: q.updated_before,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

/// One change received from a file server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerUpdate {
    pub file_ref: String,
    pub kind: ChangeKind,
    pub checkpoint: i64,
    pub size_bytes: i64,
}

impl From<is2fs::Update> for ServerUpdate {
    fn from(u: is2fs::Update) -> Self {
        let kind = match u.change_type() {
            ChangeType::Add => ChangeKind::Add,
            ChangeType::Update => ChangeKind::Update,
            ChangeType::Delete => ChangeKind::Delete,
        };
        Self {
            file_ref: u.file_reference,
            kind,
            checkpoint: u.checkpoint,
            size_bytes: u.size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(path: &str, updated_ns: i64) -> Mapping {
        Mapping {
            id: "m1".into(),
            user_id: "u1".into(),
            server_id: "s1".into(),
            file_ref: "f1".into(),
            path: path.into(),
            patient_id: Some("p1".into()),
            size_bytes: 0,
            deleted: false,
            updated_ns,
        }
    }

    #[test]
    fn query_bounds_are_strict() {
        let m = mapping("scans/a.dcm", 100);
        let q = MappingQuery {
            updated_after: Some(100),
            ..Default::default()
        };
        assert!(!q.matches(&m));

        let q = MappingQuery {
            updated_after: Some(99),
            updated_before: Some(101),
            path_prefix: Some("scans/".into()),
            patient_id: Some("p1".into()),
            ..Default::default()
        };
        assert!(q.matches(&m));
    }

    #[test]
    fn unknown_change_type_reads_as_add() {
        let update = is2fs::Update {
            file_reference: "f1".into(),
            change_type: 42,
            checkpoint: 7,
            size_bytes: 3,
        };
        assert_eq!(ServerUpdate::from(update).kind, ChangeKind::Add);
    }
}
