//! File content and metadata contracts.
use std::io;
use std::sync::Arc;

use anyhow::Result;

use async_trait::async_trait;

use bytes::Bytes;

use protocol::files::FileMetadata;

use snafu::Snafu;

#[async_trait]
pub trait Flush {
    async fn flush(&self) -> Result<()>;
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("file '{}' already exists", id))]
    FileExists { id: String },

    #[snafu(display("file '{}' not found", id))]
    NotFound { id: String },

    #[snafu(display("file '{}' still has contents", id))]
    NotEmpty { id: String },

    #[snafu(display("invalid file id '{}'", id))]
    InvalidId { id: String },

    #[snafu(display("i/o error: {}", source))]
    Io { source: io::Error },

    #[snafu(display("database error: {}", source))]
    Db { source: sled::Error },

    #[snafu(display("corrupted record: {}", source))]
    Encoding { source: bincode::Error },
}

/// Selects metadata records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Filter {
    /// Restrict to these ids. `None` selects every record.
    pub ids: Option<Vec<String>>,

    /// Only records with `last_updated_ns` strictly greater than this value.
    pub updated_after_ns: Option<i64>,
}

impl Filter {
    pub fn matches(&self, meta: &FileMetadata) -> bool {
        let id_ok = match &self.ids {
            Some(ids) => ids.iter().any(|id| id == &meta.id),
            None => true,
        };
        let time_ok = match self.updated_after_ns {
            Some(after) => after < meta.last_updated_ns,
            None => true,
        };
        id_ok && time_ok
    }
}

/// The fields a caller supplies when creating or editing a record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataFields {
    pub name: String,
    pub notes: String,
    pub patient_id: String,
    pub file_type: String,
}

impl From<protocol::files::FileMetadataRequest> for MetadataFields {
    fn from(r: protocol::files::FileMetadataRequest) -> Self {
        Self {
            name: r.name,
            notes: r.notes,
            patient_id: r.patient_id,
            file_type: r.file_type,
        }
    }
}

pub trait FileStorage: Flush + Send + Sync {
    fn read(&self, id: &str) -> Result<Bytes, StorageError>;

    /// Fails with `FileExists` when `force` is false and the file exists.
    fn write(&self, id: &str, data: &[u8], force: bool) -> Result<(), StorageError>;

    /// Truncates the file to zero bytes. The file itself is kept.
    fn del(&self, id: &str) -> Result<(), StorageError>;
}

/// Every mutation stamps the record with `when_ns`, or with the next nanosecond after the
/// record's previous stamp if `when_ns` is not newer.
pub trait MetadataStorage: Flush + Send + Sync {
    fn create(&self, fields: MetadataFields, when_ns: i64) -> Result<FileMetadata, StorageError>;

    fn get(&self, id: &str) -> Result<FileMetadata, StorageError>;

    /// Matching records, ordered by `(last_updated_ns, id)`.
    fn get_many(&self, filter: &Filter) -> Result<Vec<FileMetadata>, StorageError>;

    /// Replaces the editable fields, size and content id of a live record.
    fn update(&self, meta: FileMetadata, when_ns: i64) -> Result<FileMetadata, StorageError>;

    /// Turns the record into a tombstone. Rejected with `NotEmpty` while it has contents.
    fn remove(&self, id: &str, when_ns: i64) -> Result<FileMetadata, StorageError>;
}

pub type DynFileStorage = Arc<dyn FileStorage>;
pub type DynMetadataStorage = Arc<dyn MetadataStorage>;

/// The stamp a record receives when mutated at `when_ns`.
pub fn next_stamp(previous: i64, when_ns: i64) -> i64 {
    when_ns.max(previous + 1)
}

/// File ids double as file names, so they are restricted to a safe alphabet.
pub fn validate_id(id: &str) -> Result<(), StorageError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    snafu::ensure!(valid, InvalidIdSnafu { id });
    Ok(())
}

/// A fresh live record.
pub fn new_record(fields: MetadataFields, when_ns: i64) -> FileMetadata {
    FileMetadata {
        id: uuid::Uuid::new_v4().to_string(),
        name: fields.name,
        notes: fields.notes,
        patient_id: fields.patient_id,
        file_type: fields.file_type,
        content_id: String::new(),
        size_bytes: 0,
        last_updated_ns: when_ns,
        deleted: false,
    }
}

/// The record `previous` becomes once edited into `meta` at `when_ns`.
pub fn apply_update(
    previous: &FileMetadata,
    meta: FileMetadata,
    when_ns: i64,
) -> Result<FileMetadata, StorageError> {
    snafu::ensure!(!previous.deleted, NotFoundSnafu { id: &previous.id });
    Ok(FileMetadata {
        id: previous.id.clone(),
        last_updated_ns: next_stamp(previous.last_updated_ns, when_ns),
        deleted: false,
        ..meta
    })
}

/// The tombstone of `previous` at `when_ns`.
pub fn apply_remove(previous: &FileMetadata, when_ns: i64) -> Result<FileMetadata, StorageError> {
    snafu::ensure!(!previous.deleted, NotFoundSnafu { id: &previous.id });
    snafu::ensure!(previous.size_bytes == 0, NotEmptySnafu { id: &previous.id });
    Ok(FileMetadata {
        size_bytes: 0,
        content_id: String::new(),
        last_updated_ns: next_stamp(previous.last_updated_ns, when_ns),
        deleted: true,
        ..previous.clone()
    })
}

pub(crate) fn sort_by_stamp(records: &mut [FileMetadata]) {
    records.sort_by(|a, b| {
        a.last_updated_ns
            .cmp(&b.last_updated_ns)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, ns: i64) -> FileMetadata {
        FileMetadata {
            id: id.into(),
            last_updated_ns: ns,
            ..Default::default()
        }
    }

    #[test]
    fn updated_after_is_strict() {
        let filter = Filter {
            ids: None,
            updated_after_ns: Some(100),
        };
        assert!(!filter.matches(&meta("a", 100)));
        assert!(filter.matches(&meta("a", 101)));
    }

    #[test]
    fn empty_id_list_matches_nothing() {
        let filter = Filter {
            ids: Some(Vec::new()),
            updated_after_ns: None,
        };
        assert!(!filter.matches(&meta("a", 1)));
    }

    #[test]
    fn ids_reject_path_traversal() {
        assert!(validate_id("5f0c-aa_01").is_ok());
        assert!(validate_id("../etc/passwd").is_err());
        assert!(validate_id("").is_err());
    }

    #[test]
    fn remove_requires_empty_contents() {
        let mut record = meta("a", 10);
        record.size_bytes = 4;
        assert!(matches!(
            apply_remove(&record, 20),
            Err(StorageError::NotEmpty { .. })
        ));

        record.size_bytes = 0;
        let tombstone = apply_remove(&record, 20).unwrap();
        assert!(tombstone.deleted);
        assert_eq!(tombstone.last_updated_ns, 20);
        assert!(apply_update(&tombstone, record, 30).is_err());
    }

    #[test]
    fn stamps_only_move_forward() {
        assert_eq!(next_stamp(100, 200), 200);
        assert_eq!(next_stamp(100, 100), 101);
        assert_eq!(next_stamp(100, 50), 101);
    }
}
