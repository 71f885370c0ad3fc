use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use axum::Router;

use axum_server::Handle;

use futures::future::{AbortHandle, Abortable};

use mifs_auth::tls::{self, ClientCertAcceptor};

use tokio::sync::watch;
use tokio::task::{spawn, JoinHandle};

use crate::config::{Config, ServerSetting};
use crate::node::IndexNode;

use super::{layer, router};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 10);

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

fn start_api(
    setting: &ServerSetting,
    router: Router,
    stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], setting.port()));
    let listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind port {}", setting.port()))?;
    listener.set_nonblocking(true)?;

    let handle = match setting {
        ServerSetting::Http(_) => {
            tracing::info!(port = setting.port(), "starting http layer");
            let server = axum::Server::from_tcp(listener)?
                .serve(router.into_make_service())
                .with_graceful_shutdown(stopped(stop));
            spawn(async move {
                match server.await {
                    Ok(_) => tracing::info!("http layer stopped"),
                    Err(e) => tracing::error!("http layer error: {}", e),
                }
            })
        }
        ServerSetting::Https(p) => {
            tracing::info!(port = setting.port(), "starting https layer");
            // File servers register with client certificates verified against `client_ca`.
            let tls_config =
                tls::server_config(&p.certificate, &p.private_key, p.client_ca.as_ref())?;

            let handle = Handle::new();
            spawn(graceful_shutdown(handle.clone(), stop));

            let server = axum_server::from_tcp(listener)
                .acceptor(ClientCertAcceptor::new(tls_config))
                .handle(handle)
                .serve(router.into_make_service());
            spawn(async move {
                match server.await {
                    Ok(_) => tracing::info!("https layer stopped"),
                    Err(e) => tracing::error!("https layer error: {}", e),
                }
            })
        }
    };

    Ok(handle)
}

fn start_purge(node: Arc<IndexNode>, stop: watch::Receiver<bool>) -> JoinHandle<()> {
    spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(PURGE_INTERVAL) => {}
                _ = stopped(stop.clone()) => break,
            }

            match node.users().purge_expired_sessions() {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "expired sessions purged"),
                Err(e) => tracing::warn!("failed to purge sessions: {:#}", e),
            }
            match node.registrar().purge_stale_states() {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "stale authorization states purged"),
                Err(e) => tracing::warn!("failed to purge authorization states: {:#}", e),
            }
        }
    })
}

/// The HTTP API of the index server and the sync workers behind it.
pub struct Server {
    node: Arc<IndexNode>,
    stop_tx: watch::Sender<bool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Server {
    pub async fn new(cfg: Config, node: IndexNode) -> Result<Server> {
        let node = Arc::new(node);
        let (stop_tx, stop_rx) = watch::channel(false);

        let trusted_cn_header = cfg.identity.trusted_cn_header.clone();
        let router = layer::wrap(
            router::new(trusted_cn_header.as_deref()),
            node.clone(),
            trusted_cn_header,
        );

        let handles = vec![
            ("api", start_api(&cfg.server, router, stop_rx.clone())?),
            ("purge", start_purge(node.clone(), stop_rx)),
        ];

        node.sync().start_all()?;

        Ok(Server {
            node,
            stop_tx,
            handles,
        })
    }

    pub async fn stop(self) -> Result<()> {
        tracing::info!("requesting to quit");
        self.stop_tx.send_replace(true);

        for (name, handle) in self.handles {
            if !join_with_timeout(STOP_TIMEOUT, handle).await {
                tracing::error!("{} failed to stop in time and was killed", name);
            }
        }

        self.node.sync().shutdown().await;
        self.node.flush().await?;
        tracing::info!("exited");

        Ok(())
    }
}
