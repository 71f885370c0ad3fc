use serde::{Deserialize, Serialize};

/// A file record held by a file server.
///
/// A tombstone keeps `deleted = true` and `size_bytes = 0`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub notes: String,
    #[serde(rename = "patientID")]
    pub patient_id: String,
    #[serde(rename = "type")]
    pub file_type: String,
    #[serde(rename = "contentID")]
    pub content_id: String,
    pub size_bytes: u64,
    pub last_updated_ns: i64,
    pub deleted: bool,
}

/// The user-editable part of a file record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadataRequest {
    pub name: String,
    #[serde(default)]
    pub notes: String,
    #[serde(rename = "patientID", default)]
    pub patient_id: String,
    #[serde(rename = "type", default)]
    pub file_type: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListFilesQuery {
    pub updated_after: Option<i64>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListFilesResponse {
    pub files: Vec<FileMetadata>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Grant,
    Revoke,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PermissionRequest {
    pub subject: String,
    pub object: String,
    /// One of `read`, `write`, `create` or `admin`.
    pub operation: String,
    pub action: PermissionAction,
}
