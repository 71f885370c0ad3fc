use std::fs;
use std::time::{Duration, Instant};

use anyhow::{anyhow, ensure, Context, Result};

use parking_lot::Mutex;

use protocol::fileserver::{RegisterResponse, ServerInfo, StatusRequest};

use reqwest::{Certificate, Identity, Url};

use crate::config::IndexServerSetting;

const REGISTER_PATH: &str = "api/fileservers/v1/register";
const STATUS_PATH: &str = "api/fileservers/v1/status";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the index server's file server API.
pub struct IndexServerProxy {
    client: reqwest::Client,
    base_url: Url,
}

impl IndexServerProxy {
    pub fn new(cfg: &IndexServerSetting) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(REQUEST_TIMEOUT);

        if let Some(root_ca) = &cfg.root_ca {
            let pem = fs::read(root_ca)
                .with_context(|| format!("failed to read root CA {:?}", root_ca))?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        match (&cfg.client_certificate, &cfg.client_key) {
            (Some(cert), Some(key)) => {
                let mut pem = fs::read(cert)
                    .with_context(|| format!("failed to read client certificate {:?}", cert))?;
                pem.extend(
                    fs::read(key).with_context(|| format!("failed to read client key {:?}", key))?,
                );
                builder = builder.identity(Identity::from_pem(&pem)?);
            }
            (None, None) => {}
            _ => return Err(anyhow!("client certificate and key must be set together")),
        }

        // A missing trailing slash would make `join` drop the last path segment.
        let mut base = cfg.url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }

        Ok(Self {
            client: builder.build()?,
            base_url: Url::parse(&base)?,
        })
    }

    #[tracing::instrument(skip(self, info), fields(name = %info.name))]
    pub async fn register(&self, info: &ServerInfo) -> Result<RegisterResponse> {
        let url = self.base_url.join(REGISTER_PATH)?;
        let resp = self.client.post(url).json(info).send().await?;

        ensure!(
            resp.status().is_success(),
            "registration failed ({}): {}",
            resp.status(),
            String::from_utf8_lossy(resp.bytes().await?.as_ref())
        );

        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(body.as_ref())?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn announce(&self, status: &StatusRequest) -> Result<()> {
        let url = self.base_url.join(STATUS_PATH)?;
        let resp = self.client.post(url).json(status).send().await?;

        ensure!(
            resp.status().is_success(),
            "status announce failed ({}): {}",
            resp.status(),
            String::from_utf8_lossy(resp.bytes().await?.as_ref())
        );
        Ok(())
    }
}

/// Keeps this server registered with the index server.
pub struct Registration {
    proxy: IndexServerProxy,
    info: ServerInfo,
    started_at: Instant,
    server_id: Mutex<Option<String>>,
}

impl Registration {
    pub fn new(proxy: IndexServerProxy, info: ServerInfo) -> Self {
        Self {
            proxy,
            info,
            started_at: Instant::now(),
            server_id: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> Option<String> {
        self.server_id.lock().clone()
    }

    /// Registers (idempotently), then announces liveness.
    pub async fn checkin(&self) -> Result<()> {
        let response = self.proxy.register(&self.info).await?;
        ensure!(
            response.result.is_success(),
            "index server refused registration: {:?}",
            response.result
        );

        let server_id = response
            .server_id
            .ok_or_else(|| anyhow!("index server did not return a server id"))?;
        *self.server_id.lock() = Some(server_id.clone());

        self.proxy
            .announce(&StatusRequest {
                server_id,
                healthy: true,
                uptime: self.started_at.elapsed().as_secs(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_keeps_its_path() -> Result<()> {
        let proxy = IndexServerProxy::new(&IndexServerSetting {
            url: "http://localhost:9000/prefix".into(),
            checkin_frequency_seconds: 20,
            client_certificate: None,
            client_key: None,
            root_ca: None,
        })?;
        assert_eq!(
            proxy.base_url.join(REGISTER_PATH)?.as_str(),
            "http://localhost:9000/prefix/api/fileservers/v1/register"
        );
        Ok(())
    }

    #[test]
    fn half_an_identity_is_rejected() {
        let r = IndexServerProxy::new(&IndexServerSetting {
            url: "http://localhost:9000".into(),
            checkin_frequency_seconds: 20,
            client_certificate: Some("cert.pem".into()),
            client_key: None,
            root_ca: None,
        });
        assert!(r.is_err());
    }
}
