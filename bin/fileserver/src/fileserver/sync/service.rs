use std::sync::Arc;
use std::time::Duration;

use protocol::is2fs::file_ref_sync_server::FileRefSync;
use protocol::is2fs::{SyncUserRequest, Update};

use tokio::sync::{mpsc, watch};

use tokio_stream::wrappers::ReceiverStream;

use tonic::{Request, Response, Status};

use tracing::Instrument;

use crate::node::{FileManager, OAuth2Provider};

use super::feed::Feed;

const OUTBOUND_BUFFER: usize = 128;

pub struct SyncService {
    files: Arc<FileManager>,
    oauth2: Arc<OAuth2Provider>,
    idle_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl SyncService {
    pub fn new(
        files: Arc<FileManager>,
        oauth2: Arc<OAuth2Provider>,
        idle_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            files,
            oauth2,
            idle_timeout,
            shutdown,
        }
    }

    /// The user behind the access token in the `authorization` metadata.
    fn authenticate<T>(&self, request: &Request<T>) -> Result<String, Status> {
        let header = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization"))?
            .to_str()
            .map_err(|_| Status::unauthenticated("malformed authorization"))?;

        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();

        self.oauth2.validate_access_token(token).map_err(|e| {
            tracing::debug!(error = %e, "rejected access token");
            Status::unauthenticated("invalid access token")
        })
    }
}

#[tonic::async_trait]
impl FileRefSync for SyncService {
    type SyncUserStream = ReceiverStream<Result<Update, Status>>;

    async fn sync_user(
        &self,
        request: Request<SyncUserRequest>,
    ) -> Result<Response<Self::SyncUserStream>, Status> {
        let user = self.authenticate(&request)?;
        let req = request.into_inner();
        if user != req.user_id {
            return Err(Status::unauthenticated("token was not issued to this user"));
        }

        let span = tracing::info_span!(
            "sync_user",
            user = %req.user_id,
            checkpoint = req.checkpoint,
            keep_alive = req.keep_alive
        );

        // Subscribing before the catchup scan leaves no gap between the two phases.
        let subscription = req.keep_alive.then(|| self.files.add_listener());

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let feed = Feed::new(self.files.clone(), user, req.checkpoint, tx);
        tokio::spawn(
            feed.run(subscription, self.idle_timeout, self.shutdown.clone())
                .instrument(span),
        );

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
