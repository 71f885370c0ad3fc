use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use axum::Router;

use axum_server::Handle;

use futures::future::{AbortHandle, Abortable};

use mifs_auth::tls::{self, ClientCertAcceptor};

use protocol::is2fs::file_ref_sync_server::FileRefSyncServer;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{spawn, JoinHandle};

use tokio_stream::wrappers::TcpListenerStream;

use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::config::{Config, ControlSetting, ServerSetting};
use crate::node::{FileNode, Registration};
use crate::sync::SyncService;

use super::{layer, router};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

/// Resolves once the stop flag is raised or its sender is gone.
async fn stopped(mut stop: watch::Receiver<bool>) {
    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn graceful_shutdown(handle: Handle, stop: watch::Receiver<bool>) {
    stopped(stop).await;
    tracing::info!("https layer stop signal received");
    handle.graceful_shutdown(Some(STOP_TIMEOUT))
}

async fn join_with_timeout(dur: Duration, handle: JoinHandle<()>) -> bool {
    let (abort_handle, abort_registration) = AbortHandle::new_pair();
    let future = Abortable::new(handle, abort_registration);

    spawn(async move {
        tokio::time::sleep(dur).await;
        abort_handle.abort();
    });

    matches!(future.await, Ok(Ok(())))
}

fn log_exit(layer: &'static str, r: Result<()>) {
    match r {
        Ok(_) => tracing::info!("{} layer stopped", layer),
        Err(e) => tracing::error!("{} layer error: {:#}", layer, e),
    }
}

fn start_user_api(
    setting: &ServerSetting,
    router: Router,
    stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let listener = StdTcpListener::bind(any_addr(setting.port()))
        .with_context(|| format!("failed to bind user api port {}", setting.port()))?;
    listener.set_nonblocking(true)?;

    let handle = match setting {
        ServerSetting::Http(_) => {
            tracing::info!("starting http layer");
            let server = axum::Server::from_tcp(listener)?
                .serve(router.into_make_service())
                .with_graceful_shutdown(stopped(stop));
            spawn(async move { log_exit("http", server.await.map_err(anyhow::Error::from)) })
        }
        ServerSetting::Https(p) => {
            tracing::info!("starting https layer");
            let tls_config =
                tls::server_config(&p.certificate, &p.private_key, p.client_ca.as_ref())?;

            let handle = Handle::new();
            spawn(graceful_shutdown(handle.clone(), stop));

            let server = axum_server::from_tcp(listener)
                .acceptor(ClientCertAcceptor::new(tls_config))
                .handle(handle)
                .serve(router.into_make_service());
            spawn(async move { log_exit("https", server.await.map_err(anyhow::Error::from)) })
        }
    };

    Ok(handle)
}

async fn control_tls(setting: &ControlSetting) -> Result<Option<ServerTlsConfig>> {
    let tls = match &setting.tls {
        Some(t) => t,
        None => return Ok(None),
    };

    let cert = tokio::fs::read(&tls.certificate).await?;
    let key = tokio::fs::read(&tls.private_key).await?;
    let mut config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));

    if let Some(ca) = &tls.client_ca {
        let ca = tokio::fs::read(ca).await?;
        config = config
            .client_ca_root(Certificate::from_pem(ca))
            .client_auth_optional(true);
    }

    Ok(Some(config))
}

async fn start_control(
    setting: &ControlSetting,
    service: SyncService,
    stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(any_addr(setting.port))
        .await
        .with_context(|| format!("failed to bind control port {}", setting.port))?;

    let mut builder = tonic::transport::Server::builder();
    if let Some(tls_config) = control_tls(setting).await? {
        builder = builder.tls_config(tls_config)?;
    }

    tracing::info!(port = setting.port, "starting control layer");
    let server = builder
        .add_service(FileRefSyncServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), stopped(stop));

    Ok(spawn(async move {
        log_exit("control", server.await.map_err(anyhow::Error::from))
    }))
}

fn start_checkin(
    registration: Arc<Registration>,
    frequency: Duration,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    spawn(async move {
        loop {
            match registration.checkin().await {
                Ok(_) => tracing::debug!("index server checkin complete"),
                Err(e) => tracing::warn!("failed to check in with the index server: {:#}", e),
            }

            let delay = tokio::time::sleep(frequency);
            tokio::pin!(delay);

            let should_stop = tokio::select! {
                _ = &mut delay => false,
                _ = stopped(stop.clone()) => true,
            };

            if should_stop {
                break;
            }
        }
    })
}

/// The user API, the change feed and the registration loop of one file server.
pub struct Server {
    node: Arc<FileNode>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Server {
    pub async fn new(cfg: Config, node: FileNode) -> Result<Server> {
        let node = Arc::new(node);
        let (stop_tx, stop_rx) = watch::channel(false);

        let trusted_cn_header = cfg.identity.trusted_cn_header.clone();
        let router = layer::wrap(
            router::new(trusted_cn_header.as_deref()),
            node.clone(),
            trusted_cn_header,
        );

        let mut handles = vec![(
            "user api",
            start_user_api(&cfg.server, router, stop_rx.clone())?,
        )];

        let sync_service = SyncService::new(
            node.files(),
            node.oauth2(),
            Duration::from_secs(cfg.node.stream_idle_timeout_seconds),
            stop_rx.clone(),
        );
        handles.push((
            "control",
            start_control(&cfg.control, sync_service, stop_rx.clone()).await?,
        ));

        if let (Some(registration), Some(is_cfg)) = (node.registration(), &cfg.index_server) {
            let frequency = Duration::from_secs(is_cfg.checkin_frequency_seconds);
            handles.push(("checkin", start_checkin(registration, frequency, stop_rx)));
        }

        Ok(Server {
            node,
            stop_tx,
            handles,
        })
    }

    pub async fn stop(self) -> Result<()> {
        tracing::info!("requesting to quit");
        // Live change streams watch the same flag and close resumably.
        self.stop_tx.send_replace(true);

        for (name, handle) in self.handles {
            if !join_with_timeout(STOP_TIMEOUT, handle).await {
                tracing::error!("{} failed to stop in time and was killed", name);
            }
        }

        self.node.flush().await?;
        tracing::info!("exited");

        Ok(())
    }
}
