use anyhow::Result as AnyResult;

use async_trait::async_trait;

use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::Transactional;

use snafu::ResultExt;

use crate::node::model::{
    new_id, unassigned_path, ChangeKind, Mapping, MappingEdit, MappingQuery, ServerUpdate,
};

use super::iface::Flush;
use super::util::{abort, decode, encode, from_tx, get, key, prefix, scan_prefix};
use super::{DbSnafu, RepositoryError, Result};

const MAPPINGS_TREE: &str = "mappings";
const MAPPINGS_BY_REF_TREE: &str = "mappings_by_ref";

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<RepositoryError>>;

pub trait MappingStore: Flush {
    /// Mappings of `user_id` matching `query`, ordered by path.
    fn list(&self, user_id: &str, query: &MappingQuery) -> Result<Vec<Mapping>>;
    fn get(&self, user_id: &str, id: &str) -> Result<Mapping>;

    /// Fails with `AlreadyExists` if the user already maps this `(server_id, file_ref)`.
    fn add(&self, mapping: &Mapping) -> Result<()>;

    /// Applies `edit` to the stored row and returns the result. Columns owned by the file
    /// server keep whatever the latest sync wrote.
    fn edit(&self, user_id: &str, id: &str, edit: &MappingEdit) -> Result<Mapping>;
    fn remove(&self, user_id: &str, id: &str) -> Result<()>;

    /// Applies a batch of changes received from `server_id` in one transaction.
    ///
    /// Applying the same batch twice leaves the store unchanged. User-assigned paths are
    /// never touched, and a change older than the stored row is ignored.
    fn handle_server_updates(
        &self,
        user_id: &str,
        server_id: &str,
        updates: &[ServerUpdate],
    ) -> Result<()>;
}

pub struct SledMappingStore {
    mappings: sled::Tree,
    by_ref: sled::Tree,
}

impl SledMappingStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            mappings: db.open_tree(MAPPINGS_TREE).context(DbSnafu)?,
            by_ref: db.open_tree(MAPPINGS_BY_REF_TREE).context(DbSnafu)?,
        })
    }
}

fn tx_get(tree: &TransactionalTree, k: &[u8]) -> TxResult<Option<Mapping>> {
    match tree.get(k)? {
        Some(v) => Ok(Some(abort(decode(&v))?)),
        None => Ok(None),
    }
}

fn apply_update(
    mappings: &TransactionalTree,
    by_ref: &TransactionalTree,
    user_id: &str,
    server_id: &str,
    update: &ServerUpdate,
) -> TxResult<()> {
    let ref_key = key(&[user_id, server_id, &update.file_ref]);

    let existing = match by_ref.get(&ref_key)? {
        Some(id) => tx_get(mappings, &key(&[user_id, &String::from_utf8_lossy(&id)]))?,
        None => None,
    };

    let mapping = match existing {
        Some(m) if update.checkpoint < m.updated_ns => return Ok(()),
        Some(mut m) => {
            m.updated_ns = update.checkpoint;
            m.deleted = update.kind == ChangeKind::Delete;
            m.size_bytes = update.size_bytes;
            m
        }
        None => Mapping {
            id: new_id(),
            user_id: user_id.to_string(),
            server_id: server_id.to_string(),
            file_ref: update.file_ref.clone(),
            path: unassigned_path(server_id, &update.file_ref),
            patient_id: None,
            size_bytes: update.size_bytes,
            deleted: update.kind == ChangeKind::Delete,
            updated_ns: update.checkpoint,
        },
    };

    mappings.insert(key(&[user_id, &mapping.id]), abort(encode(&mapping))?)?;
    by_ref.insert(ref_key, mapping.id.as_bytes())?;
    Ok(())
}

#[async_trait]
impl Flush for SledMappingStore {
    async fn flush(&self) -> AnyResult<()> {
        self.mappings.flush_async().await?;
        self.by_ref.flush_async().await?;
        Ok(())
    }
}

impl MappingStore for SledMappingStore {
    #[tracing::instrument(name = "mappings.list", level = "debug", skip(self))]
    fn list(&self, user_id: &str, query: &MappingQuery) -> Result<Vec<Mapping>> {
        let mut mappings: Vec<Mapping> = scan_prefix(&self.mappings, &prefix(&[user_id]))?
            .into_iter()
            .filter(|m| query.matches(m))
            .collect();
        mappings.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(mappings)
    }

    #[tracing::instrument(name = "mappings.get", level = "debug", skip(self))]
    fn get(&self, user_id: &str, id: &str) -> Result<Mapping> {
        get(&self.mappings, &key(&[user_id, id]))?
            .ok_or_else(|| RepositoryError::not_found(format!("mapping '{}'", id)))
    }

    #[tracing::instrument(name = "mappings.add", level = "debug", skip_all, fields(user = %mapping.user_id, file_ref = %mapping.file_ref))]
    fn add(&self, mapping: &Mapping) -> Result<()> {
        let encoded = encode(mapping)?;
        let ref_key = key(&[&mapping.user_id, &mapping.server_id, &mapping.file_ref]);

        tokio::task::block_in_place(|| {
            (&self.mappings, &self.by_ref).transaction(|(mappings, by_ref)| {
                if by_ref.get(&ref_key)?.is_some() {
                    return abort(Err(RepositoryError::already_exists(format!(
                        "mapping for '{}'",
                        mapping.file_ref
                    ))));
                }
                mappings.insert(key(&[&mapping.user_id, &mapping.id]), encoded.as_slice())?;
                by_ref.insert(ref_key.as_slice(), mapping.id.as_bytes())?;
                Ok(())
            })
        })
        .map_err(from_tx)
    }

    #[tracing::instrument(name = "mappings.edit", level = "debug", skip(self, edit))]
    fn edit(&self, user_id: &str, id: &str, edit: &MappingEdit) -> Result<Mapping> {
        let k = key(&[user_id, id]);

        tokio::task::block_in_place(|| {
            self.mappings.transaction(|mappings| {
                let mut current = tx_get(mappings, &k)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(RepositoryError::not_found(format!(
                        "mapping '{}'",
                        id
                    )))
                })?;
                edit.apply(&mut current);
                mappings.insert(k.as_slice(), abort(encode(&current))?)?;
                Ok(current)
            })
        })
        .map_err(from_tx)
    }

    #[tracing::instrument(name = "mappings.remove", level = "debug", skip(self))]
    fn remove(&self, user_id: &str, id: &str) -> Result<()> {
        let k = key(&[user_id, id]);

        tokio::task::block_in_place(|| {
            (&self.mappings, &self.by_ref).transaction(|(mappings, by_ref)| {
                let current = tx_get(mappings, &k)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(RepositoryError::not_found(format!(
                        "mapping '{}'",
                        id
                    )))
                })?;
                mappings.remove(k.as_slice())?;
                by_ref.remove(key(&[user_id, &current.server_id, &current.file_ref]))?;
                Ok(())
            })
        })
        .map_err(from_tx)
    }

    #[tracing::instrument(name = "mappings.handle_updates", level = "debug", skip(self, updates), fields(count = updates.len()))]
    fn handle_server_updates(
        &self,
        user_id: &str,
        server_id: &str,
        updates: &[ServerUpdate],
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        tokio::task::block_in_place(|| {
            (&self.mappings, &self.by_ref).transaction(|(mappings, by_ref)| {
                for update in updates {
                    apply_update(mappings, by_ref, user_id, server_id, update)?;
                }
                Ok(())
            })
        })
        .map_err(from_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> anyhow::Result<SledMappingStore> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(SledMappingStore::new(&db)?)
    }

    fn update(file_ref: &str, kind: ChangeKind, checkpoint: i64) -> ServerUpdate {
        ServerUpdate {
            file_ref: file_ref.into(),
            kind,
            checkpoint,
            size_bytes: 10,
        }
    }

    fn rename(path: &str) -> MappingEdit {
        MappingEdit {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    fn by_ref(store: &SledMappingStore, file_ref: &str) -> anyhow::Result<Mapping> {
        let query = MappingQuery {
            file_ref: Some(file_ref.into()),
            ..Default::default()
        };
        let mut found = store.list("u1", &query)?;
        anyhow::ensure!(found.len() == 1, "expected one mapping for {}", file_ref);
        Ok(found.remove(0))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_observation_is_unassigned() -> anyhow::Result<()> {
        let store = store()?;
        store.handle_server_updates("u1", "s1", &[update("f1", ChangeKind::Add, 100)])?;

        let m = by_ref(&store, "f1")?;
        assert_eq!(m.path, "unassigned/s1/f1");
        assert_eq!(m.updated_ns, 100);
        assert!(!m.deleted);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn user_path_survives_updates_and_tombstones() -> anyhow::Result<()> {
        let store = store()?;
        store.handle_server_updates("u1", "s1", &[update("f1", ChangeKind::Add, 100)])?;

        let m = by_ref(&store, "f1")?;
        store.edit("u1", &m.id, &rename("scans/knee.dcm"))?;

        store.handle_server_updates(
            "u1",
            "s1",
            &[
                update("f1", ChangeKind::Update, 200),
                update("f1", ChangeKind::Delete, 300),
            ],
        )?;
        let m = by_ref(&store, "f1")?;
        assert_eq!(m.path, "scans/knee.dcm");
        assert!(m.deleted);
        assert_eq!(m.updated_ns, 300);

        store.handle_server_updates("u1", "s1", &[update("f1", ChangeKind::Add, 400)])?;
        let m = by_ref(&store, "f1")?;
        assert_eq!(m.path, "scans/knee.dcm");
        assert!(!m.deleted);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edits_keep_changes_synced_after_the_read() -> anyhow::Result<()> {
        let store = store()?;
        store.handle_server_updates("u1", "s1", &[update("f1", ChangeKind::Add, 100)])?;
        let seen = by_ref(&store, "f1")?;

        // The delete lands between the user's read and their rename.
        store.handle_server_updates("u1", "s1", &[update("f1", ChangeKind::Delete, 300)])?;
        let edited = store.edit(
            "u1",
            &seen.id,
            &MappingEdit {
                path: Some("renamed".into()),
                patient_id: Some(Some("p1".into())),
            },
        )?;

        assert_eq!(edited, by_ref(&store, "f1")?);
        assert_eq!(edited.path, "renamed");
        assert_eq!(edited.patient_id.as_deref(), Some("p1"));
        assert!(edited.deleted);
        assert_eq!(edited.updated_ns, 300);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn editing_a_missing_mapping_fails() -> anyhow::Result<()> {
        let store = store()?;
        assert!(store.edit("u1", "nope", &rename("x")).unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replaying_a_batch_is_a_no_op() -> anyhow::Result<()> {
        let store = store()?;
        let batch = vec![
            update("f1", ChangeKind::Add, 100),
            update("f2", ChangeKind::Update, 200),
            update("f3", ChangeKind::Delete, 300),
        ];

        store.handle_server_updates("u1", "s1", &batch)?;
        let first = store.list("u1", &MappingQuery::default())?;

        store.handle_server_updates("u1", "s1", &batch)?;
        assert_eq!(store.list("u1", &MappingQuery::default())?, first);
        assert_eq!(first.len(), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_changes_are_ignored() -> anyhow::Result<()> {
        let store = store()?;
        store.handle_server_updates("u1", "s1", &[update("f1", ChangeKind::Delete, 300)])?;
        store.handle_server_updates("u1", "s1", &[update("f1", ChangeKind::Update, 200)])?;

        let m = by_ref(&store, "f1")?;
        assert!(m.deleted);
        assert_eq!(m.updated_ns, 300);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn add_remove_and_uniqueness() -> anyhow::Result<()> {
        let store = store()?;
        let mapping = Mapping {
            id: "m1".into(),
            user_id: "u1".into(),
            server_id: "s1".into(),
            file_ref: "f1".into(),
            path: "notes/a.txt".into(),
            patient_id: Some("p1".into()),
            size_bytes: 0,
            deleted: false,
            updated_ns: 0,
        };
        store.add(&mapping)?;

        let dup = Mapping {
            id: "m2".into(),
            ..mapping.clone()
        };
        assert!(matches!(
            store.add(&dup),
            Err(RepositoryError::AlreadyExists { .. })
        ));

        assert!(store.get("u2", "m1").unwrap_err().is_not_found());

        store.remove("u1", "m1")?;
        assert!(store.get("u1", "m1").unwrap_err().is_not_found());
        store.add(&dup)?;
        Ok(())
    }
}
