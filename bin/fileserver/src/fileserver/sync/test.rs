use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use mifs_auth::{FileServerClaims, TokenKind};

use protocol::files::FileMetadata;
use protocol::is2fs::file_ref_sync_server::FileRefSync;
use protocol::is2fs::{ChangeType, SyncUserRequest, Update};
use protocol::{CHECKPOINT_METADATA_KEY, RESUMABLE_MESSAGE};

use tokio::sync::watch;

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use tonic::{Code, Request, Status};

use crate::node::{FileManager, MetadataFields};
use crate::{make_node, Config};

use super::SyncService;

const KEY: &str = "0123456789abcdef0123456789abcdef";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type UpdateStream = ReceiverStream<Result<Update, Status>>;

fn config(broker_buffer_size: usize, idle_seconds: u64) -> Result<Config> {
    Config::from_toml_string(format!(
        r#"
        [node]
        name = "fs-alpha"
        org_name = "st-mary"
        public_host = "localhost"
        encryption_key = "{}"
        creators = ["alice"]
        broker_buffer_size = {}
        stream_idle_timeout_seconds = {}

        [server]
        type = "http"
        port = 9000

        [control]
        port = 9001
        "#,
        KEY, broker_buffer_size, idle_seconds
    ))
}

fn token_for(user: &str) -> Result<String> {
    mifs_auth::make_token(
        KEY,
        FileServerClaims {
            user: user.into(),
            client_id: "indexsrv".into(),
            kind: TokenKind::Access,
        },
    )
}

struct Fixture {
    files: Arc<FileManager>,
    service: SyncService,
    shutdown: watch::Sender<bool>,
}

impl Fixture {
    fn new(broker_buffer_size: usize, idle_seconds: u64) -> Result<Self> {
        let node = make_node(&config(broker_buffer_size, idle_seconds)?)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let service = SyncService::new(
            node.files(),
            node.oauth2(),
            Duration::from_secs(idle_seconds),
            shutdown_rx,
        );
        Ok(Self {
            files: node.files(),
            service,
            shutdown,
        })
    }

    async fn create(&self, name: &str) -> Result<FileMetadata> {
        Ok(self
            .files
            .create_file_metadata(
                "alice",
                MetadataFields {
                    name: name.into(),
                    ..Default::default()
                },
            )
            .await?)
    }

    async fn sync_as(
        &self,
        token_user: &str,
        user: &str,
        checkpoint: i64,
        keep_alive: bool,
    ) -> Result<UpdateStream, Status> {
        let mut request = Request::new(SyncUserRequest {
            user_id: user.into(),
            checkpoint,
            keep_alive,
        });
        let token = token_for(token_user).map_err(|e| Status::internal(e.to_string()))?;
        request.metadata_mut().insert(
            "authorization",
            format!("Bearer {}", token).parse().unwrap(),
        );
        Ok(self.service.sync_user(request).await?.into_inner())
    }

    async fn sync(&self, checkpoint: i64, keep_alive: bool) -> Result<UpdateStream> {
        Ok(self.sync_as("alice", "alice", checkpoint, keep_alive).await?)
    }
}

async fn next(stream: &mut UpdateStream) -> Option<Result<Update, Status>> {
    tokio::time::timeout(RECV_TIMEOUT, stream.next())
        .await
        .expect("timed out waiting for the feed")
}

async fn next_update(stream: &mut UpdateStream) -> Result<Update> {
    match next(stream).await {
        Some(Ok(u)) => Ok(u),
        other => Err(anyhow::anyhow!("expected an update, got {:?}", other)),
    }
}

fn checkpoint_of(status: &Status) -> Option<i64> {
    status
        .metadata()
        .get(CHECKPOINT_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Three files, the last one deleted.
async fn seed(f: &Fixture) -> Result<(FileMetadata, FileMetadata, FileMetadata)> {
    let f1 = f.create("f1").await?;
    let f2 = f.create("f2").await?;
    let f3 = f.create("f3").await?;
    let f3 = f.files.delete_file_metadata("alice", &f3.id).await?;
    Ok((f1, f2, f3))
}

#[tokio::test(flavor = "multi_thread")]
async fn catchup_then_live() -> Result<()> {
    let f = Fixture::new(100, 60)?;
    let (f1, f2, f3) = seed(&f).await?;

    let mut stream = f.sync(f1.last_updated_ns, true).await?;

    let u = next_update(&mut stream).await?;
    assert_eq!(u.file_reference, f2.id);
    assert_eq!(u.change_type(), ChangeType::Update);
    assert_eq!(u.checkpoint, f2.last_updated_ns);

    let u = next_update(&mut stream).await?;
    assert_eq!(u.file_reference, f3.id);
    assert_eq!(u.change_type(), ChangeType::Delete);
    assert_eq!(u.checkpoint, f3.last_updated_ns);
    assert_eq!(u.size_bytes, 0);

    let f4 = f.create("f4").await?;
    let u = next_update(&mut stream).await?;
    assert_eq!(u.file_reference, f4.id);
    assert_eq!(u.change_type(), ChangeType::Add);
    assert_eq!(u.checkpoint, f4.last_updated_ns);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_skips_what_was_received() -> Result<()> {
    let f = Fixture::new(100, 60)?;
    let (_f1, f2, f3) = seed(&f).await?;

    let mut stream = f.sync(f2.last_updated_ns, false).await?;
    let u = next_update(&mut stream).await?;
    assert_eq!(u.file_reference, f3.id);
    assert_eq!(u.change_type(), ChangeType::Delete);

    // Without keep-alive the stream ends after the catchup.
    assert!(next(&mut stream).await.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoints_never_decrease() -> Result<()> {
    let f = Fixture::new(1000, 60)?;
    let mut stream = f.sync(0, true).await?;

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(f.create(&format!("file-{}", i)).await?.id);
    }
    for id in ids.iter().take(5) {
        f.files
            .update_file_metadata(
                "alice",
                id,
                MetadataFields {
                    name: "renamed".into(),
                    ..Default::default()
                },
            )
            .await?;
    }

    // Collect until the feed goes quiet.
    let mut updates = Vec::new();
    while let Ok(Some(Ok(u))) =
        tokio::time::timeout(Duration::from_millis(500), stream.next()).await
    {
        updates.push(u);
    }

    let mut last = 0;
    let mut per_file = std::collections::HashMap::new();
    for u in updates.iter() {
        assert!(u.checkpoint >= last);
        last = u.checkpoint;

        let previous = per_file.insert(u.file_reference.clone(), u.checkpoint);
        assert!(previous.map(|p| p < u.checkpoint).unwrap_or(true));
    }
    assert_eq!(per_file.len(), ids.len());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn token_must_match_user() -> Result<()> {
    let f = Fixture::new(100, 60)?;
    let r = f.sync_as("mallory", "alice", 0, false).await;
    assert_eq!(r.err().map(|s| s.code()), Some(Code::Unauthenticated));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_token_is_unauthenticated() -> Result<()> {
    let f = Fixture::new(100, 60)?;
    let r = f
        .service
        .sync_user(Request::new(SyncUserRequest {
            user_id: "alice".into(),
            checkpoint: 0,
            keep_alive: false,
        }))
        .await;
    assert_eq!(r.err().map(|s| s.code()), Some(Code::Unauthenticated));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn only_readable_files_are_sent() -> Result<()> {
    let f = Fixture::new(100, 60)?;
    let shared = f.create("shared").await?;
    f.create("private").await?;
    f.files
        .grant("alice", "bob", crate::node::Operation::Read, &shared.id)
        .await?;

    let mut stream = f.sync_as("bob", "bob", 0, false).await?;
    let u = next_update(&mut stream).await?;
    assert_eq!(u.file_reference, shared.id);
    assert!(next(&mut stream).await.is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn lagging_subscriber_gets_a_resumable_status() -> Result<()> {
    let f = Fixture::new(2, 60)?;
    let mut stream = f.sync(0, true).await?;

    // Nobody reads while the outbound queue and the subscriber queue fill up.
    for i in 0..300 {
        f.create(&format!("file-{}", i)).await?;
    }

    let mut last = 0;
    let status = loop {
        match next(&mut stream).await {
            Some(Ok(u)) => last = u.checkpoint,
            Some(Err(status)) => break status,
            None => anyhow::bail!("stream ended without a status"),
        }
    };

    assert_eq!(status.code(), Code::Unavailable);
    assert_eq!(status.message(), RESUMABLE_MESSAGE);
    assert_eq!(checkpoint_of(&status), Some(last));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_stream_is_closed_resumably() -> Result<()> {
    let f = Fixture::new(100, 1)?;
    let created = f.create("only").await?;
    let mut stream = f.sync(0, true).await?;
    next_update(&mut stream).await?;

    match next(&mut stream).await {
        Some(Err(status)) => {
            assert_eq!(status.code(), Code::Unavailable);
            assert_eq!(checkpoint_of(&status), Some(created.last_updated_ns));
        }
        other => anyhow::bail!("expected a status, got {:?}", other),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_live_streams() -> Result<()> {
    let f = Fixture::new(100, 60)?;
    let mut stream = f.sync(0, true).await?;

    f.shutdown.send(true)?;
    match next(&mut stream).await {
        Some(Err(status)) => assert_eq!(status.message(), RESUMABLE_MESSAGE),
        other => anyhow::bail!("expected a status, got {:?}", other),
    }
    Ok(())
}
