use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use mifs_std::collections::ConcurrentHashMap;

use tokio::sync::Mutex;

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};

use crate::config::SyncSetting;
use crate::node::model::FileServer;

use super::errors::SyncError;

struct Tracked {
    endpoint: String,
    channel: Channel,
}

type Slot = Arc<Mutex<Option<Tracked>>>;

/// One gRPC channel per file server control endpoint.
///
/// Concurrent callers for the same server share a single dial. A channel marked broken is
/// dropped and the next caller dials again.
pub struct ConnTracker {
    slots: ConcurrentHashMap<String, Slot>,
    tls: Option<ClientTlsConfig>,
    dial_timeout: Duration,
}

impl ConnTracker {
    pub fn new(cfg: &SyncSetting) -> Result<Self> {
        let tls = match &cfg.root_ca {
            Some(root_ca) => {
                let pem = fs::read(root_ca)
                    .with_context(|| format!("failed to read root CA {:?}", root_ca))?;
                let mut tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem));

                match (&cfg.client_certificate, &cfg.client_key) {
                    (Some(cert), Some(key)) => {
                        let cert = fs::read(cert).with_context(|| {
                            format!("failed to read client certificate {:?}", cert)
                        })?;
                        let key = fs::read(key)
                            .with_context(|| format!("failed to read client key {:?}", key))?;
                        tls = tls.identity(Identity::from_pem(cert, key));
                    }
                    (None, None) => {}
                    _ => {
                        return Err(anyhow!(
                            "sync client certificate and key must be set together"
                        ))
                    }
                }
                Some(tls)
            }
            None => None,
        };

        Ok(Self {
            slots: ConcurrentHashMap::new(),
            tls,
            dial_timeout: cfg.dial_timeout(),
        })
    }

    fn uri(&self, control_endpoint: &str) -> String {
        if control_endpoint.contains("://") {
            control_endpoint.to_string()
        } else if self.tls.is_some() {
            format!("https://{}", control_endpoint)
        } else {
            format!("http://{}", control_endpoint)
        }
    }

    async fn dial(&self, uri: &str) -> Result<Channel, SyncError> {
        let mut endpoint = Endpoint::from_shared(uri.to_string())
            .map_err(SyncError::internal)?
            .connect_timeout(self.dial_timeout);

        if let Some(tls) = &self.tls {
            endpoint = endpoint
                .tls_config(tls.clone())
                .map_err(SyncError::internal)?;
        }

        endpoint.connect().await.map_err(SyncError::transport)
    }

    /// Returns the channel to `server`, dialing it if there is none yet.
    #[tracing::instrument(name = "conn.get", level = "debug", skip(self, server), fields(server = %server.name))]
    pub async fn get(&self, server: &FileServer) -> Result<Channel, SyncError> {
        let slot = self
            .slots
            .get_or_insert_with(server.id.clone(), || Arc::new(Mutex::new(None)));
        let mut guard = slot.lock().await;

        let uri = self.uri(&server.control_endpoint);
        if let Some(tracked) = guard.as_ref() {
            // A re-registration may move the server.
            if tracked.endpoint == uri {
                return Ok(tracked.channel.clone());
            }
        }

        tracing::debug!(%uri, "dialing");
        let channel = self.dial(&uri).await?;
        *guard = Some(Tracked {
            endpoint: uri,
            channel: channel.clone(),
        });
        Ok(channel)
    }

    /// Drops the channel to `server_id` so the next `get` dials again.
    pub async fn mark_broken(&self, server_id: &str) {
        if let Some(slot) = self.slots.get(server_id) {
            if slot.lock().await.take().is_some() {
                tracing::debug!(server = server_id, "channel recycled");
            }
        }
    }

    pub fn forget(&self, server_id: &str) {
        self.slots.remove(server_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> SyncSetting {
        SyncSetting {
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            batch_size: 100,
            batch_window_ms: 100,
            dial_timeout_seconds: 1,
            unary_timeout_seconds: 10,
            token_refresh_margin_seconds: 60,
            cancel_grace_ms: 2_000,
            root_ca: None,
            client_certificate: None,
            client_key: None,
        }
    }

    fn server(endpoint: &str) -> FileServer {
        FileServer {
            id: "s1".into(),
            org_id: "o1".into(),
            name: "fs".into(),
            auth_url: String::new(),
            token_url: String::new(),
            fetch_url: String::new(),
            control_endpoint: endpoint.into(),
            common_name: "fs".into(),
        }
    }

    #[test]
    fn plain_endpoints_get_a_scheme() -> Result<()> {
        let tracker = ConnTracker::new(&settings())?;
        assert_eq!(tracker.uri("localhost:4000"), "http://localhost:4000");
        assert_eq!(tracker.uri("https://fs:4000"), "https://fs:4000");
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() -> Result<()> {
        let port = portpicker::pick_unused_port().ok_or_else(|| anyhow!("no free port"))?;
        let tracker = ConnTracker::new(&settings())?;

        let r = tracker.get(&server(&format!("127.0.0.1:{}", port))).await;
        assert!(matches!(r, Err(SyncError::Transport { .. })));
        Ok(())
    }
}
