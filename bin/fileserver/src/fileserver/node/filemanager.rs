//! Authorization-checked access to the plugin stores.
use std::sync::Arc;

use bytes::Bytes;

use mifs_std::sync::ShardedMutex;
use mifs_std::time::MonotonicClock;
use mifs_std::tx;

use protocol::files::FileMetadata;

use ring::digest;

use snafu::{ResultExt, Snafu};

use tokio::sync::RwLock;
use tokio::task::block_in_place;

use super::authz::{
    Authorization, AuthzError, DynAuthorization, Operation, EVERYONE_SUBJECT, GLOBAL_OBJECT,
};
use super::broker::{Broker, Change, EventType, Subscription};
use super::plugin::LoadedPlugin;
use super::storage::{DynFileStorage, DynMetadataStorage, Filter, MetadataFields, StorageError};

const EXPECTED_CONCURRENT_WRITERS: usize = 64;
const LOCK_COLLISION_PROBABILITY: f64 = 0.01;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FileManagerError {
    #[snafu(display("'{}' is not allowed to {} '{}'", user, op, object))]
    Unauthorized {
        user: String,
        op: Operation,
        object: String,
    },

    #[snafu(display("{}", source))]
    Storage { source: StorageError },

    #[snafu(display("{}", source))]
    Authz { source: AuthzError },
}

pub type Result<T, E = FileManagerError> = std::result::Result<T, E>;

fn content_id(data: &[u8]) -> String {
    base64::encode_config(
        digest::digest(&digest::SHA256, data).as_ref(),
        base64::URL_SAFE_NO_PAD,
    )
}

pub struct FileManager {
    files: DynFileStorage,
    metadata: DynMetadataStorage,
    authz: DynAuthorization,
    broker: Broker,
    clock: Arc<MonotonicClock>,
    locks: ShardedMutex,

    /// Held exclusively from taking a stamp until the change is stored and published, and shared
    /// while scanning. Stamps therefore commit in order, and a scan never sees a stamp while an
    /// older one is still in flight.
    commits: RwLock<()>,
}

impl FileManager {
    pub fn new(plugin: LoadedPlugin, broker: Broker, clock: Arc<MonotonicClock>) -> Self {
        Self {
            files: plugin.files,
            metadata: plugin.metadata,
            authz: plugin.authorization,
            broker,
            clock,
            locks: ShardedMutex::new(EXPECTED_CONCURRENT_WRITERS, LOCK_COLLISION_PROBABILITY),
            commits: RwLock::new(()),
        }
    }

    fn check(&self, user: &str, op: Operation, object: &str) -> Result<()> {
        let allowed = block_in_place(|| self.authz.can(user, op, object)).context(AuthzSnafu)?;
        snafu::ensure!(allowed, UnauthorizedSnafu { user, op, object });
        Ok(())
    }

    fn notify(&self, event_type: EventType, file_ref: &str, user: &str) {
        self.broker.publish(Change {
            event_type,
            file_ref: file_ref.into(),
            user: user.into(),
        });
    }

    fn live_record(&self, id: &str) -> Result<FileMetadata> {
        let meta = block_in_place(|| self.metadata.get(id)).context(StorageSnafu)?;
        if meta.deleted {
            return Err(FileManagerError::Storage {
                source: StorageError::NotFound { id: id.into() },
            });
        }
        Ok(meta)
    }

    /// Files the user can read, tombstones included, ordered by stamp.
    #[tracing::instrument(skip(self))]
    pub async fn list_file_metadata(
        &self,
        user: &str,
        updated_after: Option<i64>,
    ) -> Result<Vec<FileMetadata>> {
        let ids: Vec<String> = block_in_place(|| self.authz.all_for_subject(user))
            .context(AuthzSnafu)?
            .into_iter()
            .filter(|(object, mask)| object != GLOBAL_OBJECT && Operation::Read.is_set(*mask))
            .map(|(object, _)| object)
            .collect();

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let _scan = self.commits.read().await;
        block_in_place(|| {
            self.metadata.get_many(&Filter {
                ids: Some(ids),
                updated_after_ns: updated_after,
            })
        })
        .context(StorageSnafu)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_file_metadata(&self, user: &str, id: &str) -> Result<FileMetadata> {
        self.check(user, Operation::Read, id)?;
        block_in_place(|| self.metadata.get(id)).context(StorageSnafu)
    }

    #[tracing::instrument(skip(self, fields))]
    pub async fn create_file_metadata(
        &self,
        user: &str,
        fields: MetadataFields,
    ) -> Result<FileMetadata> {
        self.check(user, Operation::Create, GLOBAL_OBJECT)?;

        let _commit = self.commits.write().await;
        let meta = tx::try_rollback(|tx| async move {
            let meta = block_in_place(|| self.metadata.create(fields, self.clock.now_ns()))
                .context(StorageSnafu)?;

            let (metadata, clock, id) = (self.metadata.clone(), self.clock.clone(), meta.id.clone());
            tx.complete(Box::pin(async move {
                block_in_place(|| metadata.remove(&id, clock.now_ns()))
                    .map(|_| ())
                    .context(StorageSnafu)
            }))
            .await;

            for op in [Operation::Read, Operation::Write, Operation::Admin] {
                block_in_place(|| self.authz.grant(user, op, &meta.id)).context(AuthzSnafu)?;

                let (authz, subject, id) =
                    (self.authz.clone(), user.to_string(), meta.id.clone());
                tx.complete(Box::pin(async move {
                    block_in_place(|| authz.revoke(&subject, op, &id)).context(AuthzSnafu)
                }))
                .await;
            }

            Ok::<_, FileManagerError>(meta)
        })
        .await?;

        tracing::debug!(id = %meta.id, "created");
        self.notify(EventType::Available, &meta.id, user);
        Ok(meta)
    }

    #[tracing::instrument(skip(self, fields))]
    pub async fn update_file_metadata(
        &self,
        user: &str,
        id: &str,
        fields: MetadataFields,
    ) -> Result<FileMetadata> {
        self.check(user, Operation::Write, id)?;

        let _guard = self.locks.lock(id).await;
        let current = self.live_record(id)?;

        let _commit = self.commits.write().await;
        let meta = block_in_place(|| {
            self.metadata.update(
                FileMetadata {
                    name: fields.name,
                    notes: fields.notes,
                    patient_id: fields.patient_id,
                    file_type: fields.file_type,
                    ..current
                },
                self.clock.now_ns(),
            )
        })
        .context(StorageSnafu)?;

        self.notify(EventType::Available, id, EVERYONE_SUBJECT);
        Ok(meta)
    }

    /// Contents must be deleted first.
    #[tracing::instrument(skip(self))]
    pub async fn delete_file_metadata(&self, user: &str, id: &str) -> Result<FileMetadata> {
        self.check(user, Operation::Write, id)?;

        let _guard = self.locks.lock(id).await;
        let _commit = self.commits.write().await;
        let tombstone = block_in_place(|| self.metadata.remove(id, self.clock.now_ns()))
            .context(StorageSnafu)?;

        self.notify(EventType::NotAvailable, id, EVERYONE_SUBJECT);
        Ok(tombstone)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_file_contents(&self, user: &str, id: &str) -> Result<Bytes> {
        self.check(user, Operation::Read, id)?;
        block_in_place(|| self.files.read(id)).context(StorageSnafu)
    }

    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn update_file_contents(
        &self,
        user: &str,
        id: &str,
        data: Bytes,
    ) -> Result<FileMetadata> {
        self.check(user, Operation::Write, id)?;

        let _guard = self.locks.lock(id).await;
        let current = self.live_record(id)?;

        let _commit = self.commits.write().await;
        let meta = block_in_place(|| {
            self.files.write(id, &data, true)?;
            self.metadata.update(
                FileMetadata {
                    size_bytes: data.len() as u64,
                    content_id: content_id(&data),
                    ..current
                },
                self.clock.now_ns(),
            )
        })
        .context(StorageSnafu)?;

        self.notify(EventType::Available, id, EVERYONE_SUBJECT);
        Ok(meta)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_file_contents(&self, user: &str, id: &str) -> Result<FileMetadata> {
        self.check(user, Operation::Write, id)?;

        let _guard = self.locks.lock(id).await;
        let current = self.live_record(id)?;

        let _commit = self.commits.write().await;
        let meta = block_in_place(|| {
            match self.files.del(id) {
                // Contents were never uploaded.
                Ok(()) | Err(StorageError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            self.metadata.update(
                FileMetadata {
                    size_bytes: 0,
                    content_id: String::new(),
                    ..current
                },
                self.clock.now_ns(),
            )
        })
        .context(StorageSnafu)?;

        self.notify(EventType::NotAvailable, id, EVERYONE_SUBJECT);
        Ok(meta)
    }

    /// Granting read bumps the file's stamp so the new reader's catchup picks it up.
    #[tracing::instrument(skip(self))]
    pub async fn grant(&self, user: &str, subject: &str, op: Operation, object: &str) -> Result<()> {
        self.check(user, Operation::Admin, object)?;
        block_in_place(|| self.authz.grant(subject, op, object)).context(AuthzSnafu)?;

        if op == Operation::Read && object != GLOBAL_OBJECT {
            let _guard = self.locks.lock(object).await;
            let _commit = self.commits.write().await;
            match block_in_place(|| self.metadata.get(object)) {
                Ok(meta) if !meta.deleted => {
                    block_in_place(|| self.metadata.update(meta, self.clock.now_ns()))
                        .context(StorageSnafu)?;
                }
                Ok(_) | Err(StorageError::NotFound { .. }) => {}
                Err(source) => return Err(FileManagerError::Storage { source }),
            }
            self.notify(EventType::Available, object, subject);
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn revoke(
        &self,
        user: &str,
        subject: &str,
        op: Operation,
        object: &str,
    ) -> Result<()> {
        self.check(user, Operation::Admin, object)?;
        block_in_place(|| self.authz.revoke(subject, op, object)).context(AuthzSnafu)?;

        if op == Operation::Read && object != GLOBAL_OBJECT {
            self.notify(EventType::NotAvailable, object, subject);
        }
        Ok(())
    }

    /// Grants made by the operator rather than by a user, such as the configured creators.
    pub fn bootstrap_grant(&self, subject: &str, op: Operation, object: &str) -> Result<()> {
        self.authz.grant(subject, op, object).context(AuthzSnafu)
    }

    pub fn add_listener(&self) -> Subscription {
        self.broker.subscribe()
    }

    pub async fn can_read(&self, user: &str, id: &str) -> Result<bool> {
        block_in_place(|| self.authz.can(user, Operation::Read, id)).context(AuthzSnafu)
    }

    /// Unchecked lookup for the sync feed. Callers check permissions themselves.
    pub async fn lookup(&self, id: &str) -> Result<Option<FileMetadata>> {
        match block_in_place(|| self.metadata.get(id)) {
            Ok(meta) => Ok(Some(meta)),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(source) => Err(FileManagerError::Storage { source }),
        }
    }

    /// The highest stamp in the store.
    pub fn latest_stamp(&self) -> Result<i64> {
        let records = self.metadata.get_many(&Filter::default()).context(StorageSnafu)?;
        Ok(records.last().map(|m| m.last_updated_ns).unwrap_or_default())
    }

    pub async fn flush(&self) -> anyhow::Result<()> {
        self.files.flush().await?;
        self.metadata.flush().await?;
        self.authz.flush().await?;
        Ok(())
    }
}
