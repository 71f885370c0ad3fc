use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use futures::future::join_all;

use mifs_std::time::Backoff;

use parking_lot::Mutex;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use tracing::Instrument;

use super::errors::{MultiSyncError, SyncError};
use super::worker::{self, Shared};

type WorkerKey = (String, String);

struct WorkerHandle {
    kick: Arc<Notify>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Runs one sync worker per linked `(user, server)` pair.
pub struct SyncEngine {
    shared: Arc<Shared>,
    workers: Mutex<HashMap<WorkerKey, WorkerHandle>>,
}

/// Aborts the task it wraps when dropped, so an aborted supervisor takes its worker down too.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Restarts a worker that panicked, backing off between restarts.
async fn supervise(
    shared: Arc<Shared>,
    user_id: String,
    server_id: String,
    kick: Arc<Notify>,
    cancel: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(
        shared.settings.backoff_base(),
        shared.settings.backoff_cap(),
        0.2,
    );

    loop {
        let mut task = AbortOnDrop(tokio::spawn(
            worker::run(
                shared.clone(),
                user_id.clone(),
                server_id.clone(),
                kick.clone(),
                cancel.clone(),
            )
            .in_current_span(),
        ));

        match (&mut task.0).await {
            Ok(()) => return,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::error!(error = %e, ?delay, "sync worker crashed, restarting");
                shared.record_error(&server_id, &SyncError::internal("worker crashed"));

                let mut cancel = cancel.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = worker::cancelled(&mut cancel) => return,
                }
            }
        }
    }
}

impl SyncEngine {
    pub fn new(shared: Shared) -> Self {
        Self {
            shared: Arc::new(shared),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn errors(&self) -> Arc<MultiSyncError> {
        self.shared.errors.clone()
    }

    /// Starts a worker for every linked account.
    #[tracing::instrument(skip(self))]
    pub fn start_all(&self) -> Result<()> {
        let accounts = self.shared.registrar.all_accounts()?;
        tracing::info!(count = accounts.len(), "starting sync workers");
        for account in accounts {
            self.start(&account.user_id, &account.server_id);
        }
        Ok(())
    }

    /// Starts the workers of every account `user_id` linked.
    pub fn start_user(&self, user_id: &str) -> Result<()> {
        for account in self.shared.registrar.list_accounts(user_id)? {
            self.start(&account.user_id, &account.server_id);
        }
        Ok(())
    }

    /// Starts the worker for `(user_id, server_id)`, or kicks it if it is already running.
    pub fn start(&self, user_id: &str, server_id: &str) {
        let key = (user_id.to_string(), server_id.to_string());
        let mut workers = self.workers.lock();

        if let Some(handle) = workers.get(&key) {
            if !handle.task.is_finished() {
                handle.kick.notify_one();
                return;
            }
        }

        let kick = Arc::new(Notify::new());
        let (cancel, cancel_rx) = watch::channel(false);
        let span = tracing::info_span!("sync_worker", user = user_id, server = server_id);
        let task = tokio::spawn(
            supervise(
                self.shared.clone(),
                key.0.clone(),
                key.1.clone(),
                kick.clone(),
                cancel_rx,
            )
            .instrument(span),
        );

        tracing::debug!(user = user_id, server = server_id, "sync worker started");
        workers.insert(key, WorkerHandle { kick, cancel, task });
    }

    /// Restarts every worker of `server_id` without waiting for its backoff.
    pub fn kick_server(&self, server_id: &str) {
        let workers = self.workers.lock();
        let mut kicked = 0;
        for ((_, sid), handle) in workers.iter() {
            if sid == server_id {
                handle.kick.notify_one();
                kicked += 1;
            }
        }
        tracing::debug!(server = server_id, kicked, "kicked sync workers");
    }

    async fn stop_handle(&self, handle: WorkerHandle) {
        let _ = handle.cancel.send(true);

        let mut task = handle.task;
        let grace = self.shared.settings.cancel_grace();
        if tokio::time::timeout(grace, &mut task).await.is_err() {
            tracing::warn!(?grace, "sync worker did not stop in time, aborting");
            task.abort();
        }
    }

    /// Stops the worker of `(user_id, server_id)` within the cancellation grace period.
    pub async fn stop(&self, user_id: &str, server_id: &str) {
        let handle = self
            .workers
            .lock()
            .remove(&(user_id.to_string(), server_id.to_string()));

        if let Some(handle) = handle {
            self.stop_handle(handle).await;
        }
    }

    pub async fn stop_user(&self, user_id: &str) {
        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock();
            let keys: Vec<WorkerKey> = workers
                .keys()
                .filter(|(uid, _)| uid == user_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| workers.remove(k)).collect()
        };

        join_all(handles.into_iter().map(|h| self.stop_handle(h))).await;
    }

    /// Runs a one-shot catchup of every account of `user_id`, in parallel.
    ///
    /// Failures are recorded like worker failures and do not fail the call.
    #[tracing::instrument(skip(self))]
    pub async fn sync_once(&self, user_id: &str) -> Result<()> {
        let accounts = self.shared.registrar.list_accounts(user_id)?;

        let passes = accounts
            .into_iter()
            .filter(|a| !a.needs_relink)
            .map(|account| {
                let shared = self.shared.clone();
                async move {
                    // Nobody cancels a one-shot pass; the sender only keeps the channel open.
                    let (_cancel, mut cancel_rx) = watch::channel(false);
                    let mut committed = false;
                    let r = worker::sync_pass(
                        &shared,
                        &account.user_id,
                        &account.server_id,
                        false,
                        &mut cancel_rx,
                        &mut committed,
                    )
                    .await;
                    if let Err(e) = r {
                        tracing::warn!(server = %account.server_id, error = %e, "one-shot sync failed");
                        shared.record_error(&account.server_id, &e);
                    }
                }
            });

        join_all(passes).await;
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let handles: Vec<WorkerHandle> = self.workers.lock().drain().map(|(_, h)| h).collect();
        tracing::debug!(count = handles.len(), "stopping sync workers");
        join_all(handles.into_iter().map(|h| self.stop_handle(h))).await;
    }
}
