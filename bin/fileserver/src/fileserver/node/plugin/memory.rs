//! Volatile plugin used when no plugin is configured, and by tests.
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use async_trait::async_trait;

use bytes::Bytes;

use parking_lot::RwLock;

use protocol::files::FileMetadata;

use super::{v1, PluginError, PluginModule};
use crate::node::storage::{apply_remove, apply_update, new_record, sort_by_stamp, validate_id};

use v1::{AuthzError, FileStorage, Filter, Flush, MetadataFields, MetadataStorage, StorageError};

pub const MEMORY_PLUGIN_NAME: &str = "memory";

pub const MEMORY_PLUGIN: PluginModule = PluginModule {
    name: MEMORY_PLUGIN_NAME,
    api_version,
    create,
};

fn api_version() -> u32 {
    v1::API_VERSION
}

fn create(_args: &v1::Args) -> Result<Box<dyn Any + Send>, PluginError> {
    let plugin = v1::Plugin {
        files: Arc::new(MemoryFileStorage::default()),
        metadata: Arc::new(MemoryMetadataStorage::default()),
        authorization: Arc::new(MemoryAuthorization::default()),
    };
    Ok(Box::new(plugin))
}

#[derive(Default)]
pub struct MemoryFileStorage {
    files: RwLock<HashMap<String, Bytes>>,
}

#[async_trait]
impl Flush for MemoryFileStorage {
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl FileStorage for MemoryFileStorage {
    fn read(&self, id: &str) -> Result<Bytes, StorageError> {
        self.files
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound { id: id.into() })
    }

    fn write(&self, id: &str, data: &[u8], force: bool) -> Result<(), StorageError> {
        validate_id(id)?;
        let mut files = self.files.write();
        if !force && files.contains_key(id) {
            return Err(StorageError::FileExists { id: id.into() });
        }
        files.insert(id.into(), Bytes::copy_from_slice(data));
        Ok(())
    }

    fn del(&self, id: &str) -> Result<(), StorageError> {
        match self.files.write().get_mut(id) {
            Some(data) => {
                *data = Bytes::new();
                Ok(())
            }
            None => Err(StorageError::NotFound { id: id.into() }),
        }
    }
}

#[derive(Default)]
pub struct MemoryMetadataStorage {
    records: RwLock<HashMap<String, FileMetadata>>,
}

impl MemoryMetadataStorage {
    fn mutate<F>(&self, id: &str, f: F) -> Result<FileMetadata, StorageError>
    where
        F: FnOnce(&FileMetadata) -> Result<FileMetadata, StorageError>,
    {
        let mut records = self.records.write();
        let previous = records
            .get(id)
            .ok_or_else(|| StorageError::NotFound { id: id.into() })?;
        let next = f(previous)?;
        records.insert(id.into(), next.clone());
        Ok(next)
    }
}

#[async_trait]
impl Flush for MemoryMetadataStorage {
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl MetadataStorage for MemoryMetadataStorage {
    fn create(&self, fields: MetadataFields, when_ns: i64) -> Result<FileMetadata, StorageError> {
        let record = new_record(fields, when_ns);
        self.records.write().insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn get(&self, id: &str) -> Result<FileMetadata, StorageError> {
        self.records
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound { id: id.into() })
    }

    fn get_many(&self, filter: &Filter) -> Result<Vec<FileMetadata>, StorageError> {
        let mut records: Vec<_> = self
            .records
            .read()
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        sort_by_stamp(&mut records);
        Ok(records)
    }

    fn update(&self, meta: FileMetadata, when_ns: i64) -> Result<FileMetadata, StorageError> {
        let id = meta.id.clone();
        self.mutate(&id, |prev| apply_update(prev, meta, when_ns))
    }

    fn remove(&self, id: &str, when_ns: i64) -> Result<FileMetadata, StorageError> {
        self.mutate(id, |prev| apply_remove(prev, when_ns))
    }
}

#[derive(Default)]
pub struct MemoryAuthorization {
    masks: RwLock<HashMap<(String, String), u32>>,
}

#[async_trait]
impl Flush for MemoryAuthorization {
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl v1::Authorization for MemoryAuthorization {
    fn can(&self, subject: &str, op: u32, object: &str) -> Result<bool, AuthzError> {
        let op = v1::check_op(op)?;
        let mask = self
            .masks
            .read()
            .get(&(subject.to_string(), object.to_string()))
            .copied()
            .unwrap_or_default();
        Ok(mask & op != 0)
    }

    fn grant(&self, subject: &str, op: u32, object: &str) -> Result<(), AuthzError> {
        let op = v1::check_op(op)?;
        *self
            .masks
            .write()
            .entry((subject.into(), object.into()))
            .or_default() |= op;
        Ok(())
    }

    fn revoke(&self, subject: &str, op: u32, object: &str) -> Result<(), AuthzError> {
        let op = v1::check_op(op)?;
        let key = (subject.to_string(), object.to_string());
        let mut masks = self.masks.write();
        if let Some(mask) = masks.get_mut(&key) {
            *mask &= !op;
            if *mask == 0 {
                masks.remove(&key);
            }
        }
        Ok(())
    }

    fn all_for_subject(&self, subject: &str) -> Result<HashMap<String, u32>, AuthzError> {
        Ok(self
            .masks
            .read()
            .iter()
            .filter(|((s, _), _)| s == subject)
            .map(|((_, o), m)| (o.clone(), *m))
            .collect())
    }

    fn all_for_object(&self, object: &str) -> Result<HashMap<String, u32>, AuthzError> {
        Ok(self
            .masks
            .read()
            .iter()
            .filter(|((_, o), _)| o == object)
            .map(|((s, _), m)| (s.clone(), *m))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v1::Authorization;

    #[test]
    fn revoke_only_clears_its_bit() -> Result<()> {
        let authz = MemoryAuthorization::default();
        authz.grant("alice", v1::OP_READ, "f1")?;
        authz.grant("alice", v1::OP_WRITE, "f1")?;
        authz.revoke("alice", v1::OP_READ, "f1")?;

        assert!(!authz.can("alice", v1::OP_READ, "f1")?);
        assert!(authz.can("alice", v1::OP_WRITE, "f1")?);
        assert_eq!(authz.all_for_object("f1")?.get("alice"), Some(&v1::OP_WRITE));
        Ok(())
    }

    #[test]
    fn combined_bits_are_rejected() {
        let authz = MemoryAuthorization::default();
        assert!(authz.grant("alice", v1::OP_READ | v1::OP_WRITE, "f1").is_err());
        assert!(authz.can("alice", 0, "f1").is_err());
    }

    #[test]
    fn update_of_unknown_record_fails() {
        let store = MemoryMetadataStorage::default();
        let r = store.update(
            FileMetadata {
                id: "ghost".into(),
                ..Default::default()
            },
            1,
        );
        assert!(matches!(r, Err(StorageError::NotFound { .. })));
    }
}
