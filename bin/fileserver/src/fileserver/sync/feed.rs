use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use protocol::files::FileMetadata;
use protocol::is2fs::{ChangeType, Update};
use protocol::{CHECKPOINT_METADATA_KEY, RESUMABLE_MESSAGE};

use tokio::sync::{mpsc, watch};

use tonic::metadata::MetadataValue;
use tonic::{Code, Status};

use crate::node::{Change, EventType, FileManager, Subscription};

pub type Outbound = mpsc::Sender<Result<Update, Status>>;

/// Why a feed stopped before its natural end.
enum Stop {
    /// The caller went away. Nothing left to tell it.
    ClientGone,
    Status(Status),
}

fn status_with_checkpoint(code: Code, message: &str, checkpoint: i64) -> Status {
    let mut status = Status::new(code, message);
    status
        .metadata_mut()
        .insert(CHECKPOINT_METADATA_KEY, MetadataValue::from(checkpoint));
    status
}

/// One `SyncUser` call: a catchup scan, then optionally a live tail of the broker.
///
/// Checkpoints sent on a feed never decrease, and a file is only re-sent when its stamp moved
/// past the one already sent for it.
pub struct Feed {
    files: Arc<FileManager>,
    user: String,
    last: i64,
    emitted: HashMap<String, i64>,
    tx: Outbound,
}

impl Feed {
    pub fn new(files: Arc<FileManager>, user: String, checkpoint: i64, tx: Outbound) -> Self {
        Self {
            files,
            user,
            last: checkpoint,
            emitted: HashMap::new(),
            tx,
        }
    }

    fn resumable(&self) -> Stop {
        Stop::Status(status_with_checkpoint(
            Code::Unavailable,
            RESUMABLE_MESSAGE,
            self.last,
        ))
    }

    fn internal<E: std::fmt::Display>(&self, e: E) -> Stop {
        tracing::error!(error = %e, checkpoint = self.last, "change feed failed");
        Stop::Status(status_with_checkpoint(
            Code::Internal,
            &e.to_string(),
            self.last,
        ))
    }

    async fn emit(&mut self, meta: &FileMetadata, change_type: ChangeType) -> Result<(), Stop> {
        let checkpoint = meta.last_updated_ns.max(self.last);
        let size_bytes = match change_type {
            ChangeType::Delete => 0,
            _ => meta.size_bytes as i64,
        };

        let mut update = Update {
            file_reference: meta.id.clone(),
            checkpoint,
            size_bytes,
            ..Default::default()
        };
        update.set_change_type(change_type);

        self.tx
            .send(Ok(update))
            .await
            .map_err(|_| Stop::ClientGone)?;

        self.last = checkpoint;
        self.emitted.insert(meta.id.clone(), meta.last_updated_ns);
        Ok(())
    }

    async fn catchup(&mut self) -> Result<(), Stop> {
        let records = match self.files.list_file_metadata(&self.user, Some(self.last)).await {
            Ok(r) => r,
            Err(e) => return Err(self.internal(e)),
        };
        tracing::debug!(count = records.len(), "catchup");

        for meta in records.iter() {
            let change_type = if meta.deleted {
                ChangeType::Delete
            } else {
                ChangeType::Update
            };
            self.emit(meta, change_type).await?;
        }
        Ok(())
    }

    async fn forward(&mut self, change: Change) -> Result<(), Stop> {
        let readable = match self.files.can_read(&self.user, &change.file_ref).await {
            Ok(r) => r,
            Err(e) => return Err(self.internal(e)),
        };
        let meta = match self.files.lookup(&change.file_ref).await {
            Ok(Some(m)) => m,
            Ok(None) => return Ok(()),
            Err(e) => return Err(self.internal(e)),
        };

        if readable {
            let seen = self.emitted.get(&meta.id).copied();
            if matches!(seen, Some(stamp) if meta.last_updated_ns <= stamp) {
                return Ok(());
            }

            let change_type = match (meta.deleted, seen) {
                (true, _) => ChangeType::Delete,
                (false, None) => ChangeType::Add,
                (false, Some(_)) => ChangeType::Update,
            };
            self.emit(&meta, change_type).await
        } else if change.user == self.user && change.event_type == EventType::NotAvailable {
            // Read access was revoked.
            self.emit(&meta, ChangeType::Delete).await?;
            self.emitted.remove(&meta.id);
            Ok(())
        } else {
            Ok(())
        }
    }

    async fn drive(
        &mut self,
        subscription: Option<Subscription>,
        idle_timeout: Duration,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), Stop> {
        self.catchup().await?;

        let mut subscription = match subscription {
            Some(s) => s,
            None => return Ok(()),
        };

        loop {
            if *shutdown.borrow() {
                return Err(self.resumable());
            }

            let tx = self.tx.clone();
            tokio::select! {
                _ = tx.closed() => return Err(Stop::ClientGone),
                _ = shutdown.changed() => return Err(self.resumable()),
                next = tokio::time::timeout(idle_timeout, subscription.recv()) => match next {
                    Err(_) => {
                        tracing::debug!("stream idle");
                        return Err(self.resumable());
                    }
                    Ok(None) => {
                        if subscription.is_lagging() {
                            tracing::warn!(checkpoint = self.last, "subscriber lagged behind");
                        }
                        return Err(self.resumable());
                    }
                    Ok(Some(change)) => self.forward(change).await?,
                }
            }
        }
    }

    pub async fn run(
        mut self,
        subscription: Option<Subscription>,
        idle_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        match self.drive(subscription, idle_timeout, &mut shutdown).await {
            Ok(()) => tracing::debug!(checkpoint = self.last, "feed complete"),
            Err(Stop::ClientGone) => tracing::debug!(checkpoint = self.last, "client went away"),
            Err(Stop::Status(status)) => {
                tracing::debug!(code = ?status.code(), checkpoint = self.last, "closing feed");
                let _ = self.tx.send(Err(status)).await;
            }
        }
    }
}
