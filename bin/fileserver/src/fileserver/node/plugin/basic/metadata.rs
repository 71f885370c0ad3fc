use anyhow::Result;

use async_trait::async_trait;

use protocol::files::FileMetadata;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use snafu::ResultExt;

use crate::node::plugin::v1::{Filter, Flush, MetadataFields, MetadataStorage, StorageError};
use crate::node::storage::{
    apply_remove, apply_update, new_record, sort_by_stamp, DbSnafu, EncodingSnafu,
};

const RECORDS_TREE: &str = "metadata";
const STAMP_INDEX_TREE: &str = "metadata_by_stamp";

/// Index key ordering records by stamp, then id.
fn stamp_key(stamp: i64, id: &str) -> Vec<u8> {
    let mut key = (stamp.max(0) as u64).to_be_bytes().to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn decode(value: &[u8]) -> Result<FileMetadata, StorageError> {
    bincode::deserialize(value).context(EncodingSnafu)
}

fn encode(meta: &FileMetadata) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(meta).context(EncodingSnafu)
}

/// Records keyed by id, plus a stamp-ordered index so changes since a checkpoint are a range
/// scan.
pub struct SledMetadataStorage {
    records: sled::Tree,
    by_stamp: sled::Tree,
}

impl SledMetadataStorage {
    pub fn new(db: &sled::Db) -> Result<Self, StorageError> {
        Ok(Self {
            records: db.open_tree(RECORDS_TREE).context(DbSnafu)?,
            by_stamp: db.open_tree(STAMP_INDEX_TREE).context(DbSnafu)?,
        })
    }

    /// Replaces a record (or inserts a new one) together with its index entry.
    fn mutate<F>(&self, id: &str, f: F) -> Result<FileMetadata, StorageError>
    where
        F: Fn(Option<FileMetadata>) -> Result<FileMetadata, StorageError>,
    {
        let result: Result<FileMetadata, TransactionError<StorageError>> =
            (&self.records, &self.by_stamp).transaction(|(records, by_stamp)| {
                let previous = match records.get(id.as_bytes())? {
                    Some(v) => Some(decode(&v).map_err(ConflictableTransactionError::Abort)?),
                    None => None,
                };

                let next = f(previous.clone()).map_err(ConflictableTransactionError::Abort)?;
                let encoded = encode(&next).map_err(ConflictableTransactionError::Abort)?;

                if let Some(prev) = &previous {
                    by_stamp.remove(stamp_key(prev.last_updated_ns, &prev.id))?;
                }
                records.insert(next.id.as_bytes(), encoded)?;
                by_stamp.insert(stamp_key(next.last_updated_ns, &next.id), next.id.as_bytes())?;

                Ok(next)
            });

        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(source) => StorageError::Db { source },
        })
    }

    fn scan_all(&self) -> Result<Vec<FileMetadata>, StorageError> {
        self.records
            .iter()
            .values()
            .map(|v| decode(&v.context(DbSnafu)?))
            .collect()
    }

    fn scan_since(&self, after_ns: i64) -> Result<Vec<FileMetadata>, StorageError> {
        let start = stamp_key(after_ns.saturating_add(1), "");
        let mut out = Vec::new();
        for id in self.by_stamp.range(start..).values() {
            let id = id.context(DbSnafu)?;
            if let Some(v) = self.records.get(&id).context(DbSnafu)? {
                out.push(decode(&v)?);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Flush for SledMetadataStorage {
    async fn flush(&self) -> Result<()> {
        self.records.flush_async().await?;
        self.by_stamp.flush_async().await?;
        Ok(())
    }
}

impl MetadataStorage for SledMetadataStorage {
    #[tracing::instrument(name = "metadata.create", level = "debug", skip(self))]
    fn create(&self, fields: MetadataFields, when_ns: i64) -> Result<FileMetadata, StorageError> {
        let record = new_record(fields, when_ns);
        let id = record.id.clone();
        self.mutate(&id, |_| Ok(record.clone()))
    }

    #[tracing::instrument(name = "metadata.get", level = "debug", skip(self))]
    fn get(&self, id: &str) -> Result<FileMetadata, StorageError> {
        match self.records.get(id.as_bytes()).context(DbSnafu)? {
            Some(v) => decode(&v),
            None => Err(StorageError::NotFound { id: id.into() }),
        }
    }

    #[tracing::instrument(name = "metadata.get_many", level = "debug", skip(self))]
    fn get_many(&self, filter: &Filter) -> Result<Vec<FileMetadata>, StorageError> {
        let mut records = match (&filter.ids, filter.updated_after_ns) {
            (_, Some(after)) => self.scan_since(after)?,
            (Some(ids), None) => {
                let mut out = Vec::with_capacity(ids.len());
                for id in ids {
                    match self.get(id) {
                        Ok(m) => out.push(m),
                        Err(StorageError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                out
            }
            (None, None) => self.scan_all()?,
        };

        records.retain(|m| filter.matches(m));
        sort_by_stamp(&mut records);
        Ok(records)
    }

    #[tracing::instrument(name = "metadata.update", level = "debug", skip(self, meta), fields(id = %meta.id))]
    fn update(&self, meta: FileMetadata, when_ns: i64) -> Result<FileMetadata, StorageError> {
        let id = meta.id.clone();
        self.mutate(&id, |previous| match previous {
            Some(prev) => apply_update(&prev, meta.clone(), when_ns),
            None => Err(StorageError::NotFound { id: id.clone() }),
        })
    }

    #[tracing::instrument(name = "metadata.remove", level = "debug", skip(self))]
    fn remove(&self, id: &str, when_ns: i64) -> Result<FileMetadata, StorageError> {
        self.mutate(id, |previous| match previous {
            Some(prev) => apply_remove(&prev, when_ns),
            None => Err(StorageError::NotFound { id: id.into() }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Result<SledMetadataStorage> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(SledMetadataStorage::new(&db)?)
    }

    fn fields(name: &str) -> MetadataFields {
        MetadataFields {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn create_and_get() -> Result<()> {
        let store = store()?;
        let created = store.create(fields("scan.dcm"), 100)?;
        let fetched = store.get(&created.id)?;
        assert_eq!(created, fetched);
        assert_eq!(fetched.last_updated_ns, 100);
        assert!(!fetched.deleted);
        Ok(())
    }

    #[test]
    fn get_many_since_is_ordered_and_strict() -> Result<()> {
        let store = store()?;
        let a = store.create(fields("a"), 100)?;
        let b = store.create(fields("b"), 200)?;
        let c = store.create(fields("c"), 300)?;

        let since = store.get_many(&Filter {
            ids: None,
            updated_after_ns: Some(200),
        })?;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, c.id);

        // Moving `a` forward reorders it behind `c`.
        store.update(a.clone(), 400)?;
        let all = store.get_many(&Filter {
            ids: None,
            updated_after_ns: Some(150),
        })?;
        let ids: Vec<_> = all.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, vec![b.id, c.id, a.id]);
        Ok(())
    }

    #[test]
    fn no_ids_lists_everything() -> Result<()> {
        let store = store()?;
        store.create(fields("a"), 1)?;
        store.create(fields("b"), 2)?;
        assert_eq!(store.get_many(&Filter::default())?.len(), 2);
        Ok(())
    }

    #[test]
    fn remove_leaves_a_tombstone() -> Result<()> {
        let store = store()?;
        let mut a = store.create(fields("a"), 10)?;

        a.size_bytes = 3;
        let a = store.update(a, 20)?;
        assert!(matches!(
            store.remove(&a.id, 30),
            Err(StorageError::NotEmpty { .. })
        ));

        let mut a = a;
        a.size_bytes = 0;
        store.update(a.clone(), 40)?;
        let tombstone = store.remove(&a.id, 50)?;
        assert!(tombstone.deleted);
        assert_eq!(store.get(&a.id)?.last_updated_ns, 50);

        // The index holds a single entry per record.
        let since = store.get_many(&Filter {
            ids: None,
            updated_after_ns: Some(0),
        })?;
        assert_eq!(since.len(), 1);
        Ok(())
    }
}
