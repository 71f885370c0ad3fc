use std::sync::Arc;

use mifs_std::time::Backoff;

use protocol::is2fs::file_ref_sync_client::FileRefSyncClient;
use protocol::is2fs::{SyncUserRequest, Update};

use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use tonic::metadata::{Ascii, MetadataValue};
use tonic::{Request, Streaming};

use crate::config::SyncSetting;
use crate::node::model::{FileServer, ServerUpdate};
use crate::node::{MappingService, Registrar, RegistrarError, UserService};

use super::conn::ConnTracker;
use super::errors::{MultiSyncError, SyncError};

const JITTER: f64 = 0.2;

/// Everything a worker reaches for.
pub struct Shared {
    pub users: Arc<UserService>,
    pub registrar: Arc<Registrar>,
    pub mappings: Arc<MappingService>,
    pub conns: ConnTracker,
    pub errors: Arc<MultiSyncError>,
    pub settings: SyncSetting,
}

impl Shared {
    /// The `(organization, server)` names failures are reported under.
    fn error_key(&self, server_id: &str) -> (String, String) {
        match self.registrar.get_server(server_id) {
            Ok(server) => {
                let org = self
                    .registrar
                    .get_organization(&server.org_id)
                    .map(|o| o.name)
                    .unwrap_or(server.org_id);
                (org, server.name)
            }
            Err(_) => (String::new(), server_id.to_string()),
        }
    }

    pub(super) fn record_error(&self, server_id: &str, e: &SyncError) {
        let (org, server) = self.error_key(server_id);
        self.errors.record(&org, &server, e);
    }

    fn clear_error(&self, server_id: &str) {
        let (org, server) = self.error_key(server_id);
        self.errors.clear(&org, &server);
    }
}

fn registrar_error(e: RegistrarError) -> SyncError {
    match e {
        RegistrarError::NeedsRelink => SyncError::NeedsRelink,
        RegistrarError::TokenExchange { reason } => SyncError::Transport { reason },
        e => SyncError::internal(e),
    }
}

/// Resolves once `cancel` flips to true. Never resolves if the sender is gone.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// How a batch collection ended.
enum BatchEnd {
    /// The batch is full or its window elapsed.
    Open,
    /// The stream ended without an error.
    Closed,
    Failed(SyncError),
}

async fn next_batch(
    stream: &mut Streaming<Update>,
    cancel: &mut watch::Receiver<bool>,
    settings: &SyncSetting,
) -> (Vec<ServerUpdate>, BatchEnd) {
    let mut batch = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let message = match deadline {
            None => {
                tokio::select! {
                    m = stream.message() => m,
                    _ = cancelled(cancel) => return (batch, BatchEnd::Failed(SyncError::Cancelled)),
                }
            }
            Some(at) => {
                tokio::select! {
                    m = tokio::time::timeout_at(at, stream.message()) => match m {
                        Ok(m) => m,
                        Err(_) => return (batch, BatchEnd::Open),
                    },
                    _ = cancelled(cancel) => return (batch, BatchEnd::Failed(SyncError::Cancelled)),
                }
            }
        };

        match message {
            Ok(Some(update)) => {
                batch.push(ServerUpdate::from(update));
                if batch.len() >= settings.batch_size {
                    return (batch, BatchEnd::Open);
                }
                if deadline.is_none() {
                    deadline = Some(Instant::now() + settings.batch_window());
                }
            }
            Ok(None) => return (batch, BatchEnd::Closed),
            Err(status) => return (batch, BatchEnd::Failed(status.into())),
        }
    }
}

/// Opens one `SyncUser` call and applies what it sends until it ends.
///
/// Each batch commits before the account checkpoint moves past it, so a pass interrupted at any
/// point replays from the last committed batch. `committed` is set once any batch commits.
#[tracing::instrument(level = "debug", skip(shared, cancel, committed))]
pub async fn sync_pass(
    shared: &Shared,
    user_id: &str,
    server_id: &str,
    keep_alive: bool,
    cancel: &mut watch::Receiver<bool>,
    committed: &mut bool,
) -> Result<(), SyncError> {
    let server: FileServer = shared
        .registrar
        .get_server(server_id)
        .map_err(registrar_error)?;
    let user = shared.users.get(user_id).map_err(SyncError::internal)?;
    let account = shared
        .registrar
        .get_account(user_id, server_id)
        .map_err(registrar_error)?;
    if account.needs_relink {
        return Err(SyncError::NeedsRelink);
    }

    let token = shared
        .registrar
        .valid_token(
            user_id,
            server_id,
            std::time::Duration::from_secs(shared.settings.token_refresh_margin_seconds),
        )
        .await
        .map_err(registrar_error)?;

    let channel = shared.conns.get(&server).await?;
    let mut client = FileRefSyncClient::new(channel);

    // File servers know the user by the name their certificates carry.
    let mut request = Request::new(SyncUserRequest {
        user_id: user.name.clone(),
        checkpoint: account.checkpoint_ns,
        keep_alive,
    });
    let auth: MetadataValue<Ascii> = format!("Bearer {}", token)
        .parse()
        .map_err(SyncError::internal)?;
    request.metadata_mut().insert("authorization", auth);

    let open = tokio::time::timeout(shared.settings.unary_timeout(), client.sync_user(request));
    let mut stream = tokio::select! {
        r = open => match r {
            Ok(r) => r?.into_inner(),
            Err(_) => return Err(SyncError::transport("timed out opening the change stream")),
        },
        _ = cancelled(cancel) => return Err(SyncError::Cancelled),
    };

    let mut last = account.checkpoint_ns;
    loop {
        let (batch, end) = next_batch(&mut stream, cancel, &shared.settings).await;

        if !batch.is_empty() {
            for update in batch.iter() {
                if update.checkpoint < last {
                    return Err(SyncError::InvalidCheckpoint {
                        received: update.checkpoint,
                        expected: last,
                    });
                }
                last = update.checkpoint;
            }

            shared
                .mappings
                .apply_updates(user_id, server_id, &batch)
                .map_err(SyncError::internal)?;
            shared
                .registrar
                .update_checkpoint(user_id, server_id, last)
                .map_err(registrar_error)?;

            tracing::debug!(count = batch.len(), checkpoint = last, "batch applied");
            shared.clear_error(server_id);
            *committed = true;
        }

        match end {
            BatchEnd::Open => continue,
            BatchEnd::Closed => return Ok(()),
            BatchEnd::Failed(e) => return Err(e),
        }
    }
}

/// What a worker does after a failed pass.
enum Next {
    Retry,
    Backoff,
    Pause,
    Exit,
}

/// Keeps one `(user, server)` pair in sync until cancelled.
///
/// Transient failures back off exponentially. Failures only a new link or a kick can clear pause
/// the worker until it is kicked.
pub async fn run(
    shared: Arc<Shared>,
    user_id: String,
    server_id: String,
    kick: Arc<Notify>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(
        shared.settings.backoff_base(),
        shared.settings.backoff_cap(),
        JITTER,
    );
    // One token refresh per stretch without progress.
    let mut refreshed = false;

    loop {
        let mut committed = false;
        let pass = sync_pass(&shared, &user_id, &server_id, true, &mut cancel, &mut committed).await;
        if committed {
            refreshed = false;
        }

        let next = match pass {
            Ok(()) => {
                backoff.reset();
                refreshed = false;
                Next::Retry
            }
            Err(SyncError::Cancelled) => Next::Exit,
            Err(SyncError::Resumable { checkpoint }) => {
                tracing::debug!(?checkpoint, "stream ended, resuming");
                backoff.reset();
                refreshed = false;
                Next::Retry
            }
            Err(e @ SyncError::InvalidCheckpoint { .. }) => {
                tracing::warn!(error = %e, "discarding checkpoint, syncing from scratch");
                match shared.registrar.reset_checkpoint(&user_id, &server_id) {
                    Ok(()) => Next::Retry,
                    Err(err) => {
                        shared.record_error(&server_id, &SyncError::internal(err));
                        Next::Backoff
                    }
                }
            }
            Err(e @ (SyncError::Unauthenticated | SyncError::PermissionDenied)) => {
                if refreshed {
                    shared.record_error(&server_id, &e);
                    Next::Pause
                } else {
                    refreshed = true;
                    match shared.registrar.refresh(&user_id, &server_id).await {
                        Ok(_) => Next::Retry,
                        Err(err) => {
                            shared.record_error(&server_id, &registrar_error(err));
                            Next::Pause
                        }
                    }
                }
            }
            Err(e @ SyncError::NeedsRelink) => {
                shared.record_error(&server_id, &e);
                Next::Pause
            }
            Err(e @ SyncError::Transport { .. }) => {
                shared.conns.mark_broken(&server_id).await;
                shared.record_error(&server_id, &e);
                Next::Backoff
            }
            Err(e) => {
                shared.record_error(&server_id, &e);
                Next::Backoff
            }
        };

        match next {
            Next::Exit => return,
            Next::Retry => {}
            Next::Backoff => {
                let delay = backoff.next_delay();
                tracing::debug!(?delay, attempt = backoff.attempt(), "backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = kick.notified() => {
                        backoff.reset();
                        refreshed = false;
                    }
                    _ = cancelled(&mut cancel) => return,
                }
            }
            Next::Pause => {
                tracing::info!("sync paused until kicked");
                tokio::select! {
                    _ = kick.notified() => {
                        backoff.reset();
                        refreshed = false;
                    }
                    _ = cancelled(&mut cancel) => return,
                }
            }
        }
    }
}
