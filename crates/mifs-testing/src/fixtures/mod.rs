mod pki;

pub use pki::{CertFiles, Pki};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use anyhow::{anyhow, ensure, Result};

use fileserver::config::{
    HttpParameters as FsHttpParameters, IndexServerSetting, OAuth2ClientSetting,
    ServerSetting as FsServerSetting,
};
use indexsrv::config::{HttpsParameters, ServerSetting};

use protocol::fileserver::SyncErrorsResponse;
use protocol::files::{FileMetadata, FileMetadataRequest, PermissionAction, PermissionRequest};
use protocol::index::accounts::{AccountInfo, LinkAccountRequest, LinkAccountResponse};
use protocol::index::auth::{LoginRequest, LoginResponse, SignupRequest, SignupResponse};
use protocol::index::mappings::{ListMappingsResponse, Mapping};
use protocol::index::organizations::{FileServer, NewOrganizationRequest, Organization};
use protocol::index::HealthResponse;
use protocol::SESSION_HEADER;

use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{Certificate, RequestBuilder};

use serde::de::DeserializeOwned;

use tempfile::TempDir;

/// Header the file servers of a federation trust to carry the caller's common name.
pub const CLIENT_CN_HEADER: &str = "x-mifs-client-cn";

pub const ADMIN_USER: &str = "admin";
const PASSWORD: &str = "correct horse battery staple";

const WAIT_STEP: Duration = Duration::from_millis(100);
const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

static INIT: Once = Once::new();

fn init_logger() {
    INIT.call_once(|| {
        if let Err(e) = xecute::logging::init_logger("mifs-test", &None) {
            eprintln!("failed to initialize logging: {}", e);
        }
    });
}

fn free_port() -> Result<u16> {
    portpicker::pick_unused_port().ok_or_else(|| anyhow!("no free port"))
}

async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let resp = request.send().await?;
    let status = resp.status();
    let body = resp.bytes().await?;
    ensure!(
        status.is_success(),
        "unexpected response status {}: {}",
        status,
        String::from_utf8_lossy(body.as_ref())
    );
    Ok(serde_json::from_slice(body.as_ref())?)
}

/// Polls `check` until it returns `Some`, or fails after a while.
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if let Some(v) = check().await? {
            return Ok(v);
        }
        if tokio::time::Instant::now() > deadline {
            return Err(anyhow!("timed out waiting for {}", what));
        }
        tokio::time::sleep(WAIT_STEP).await;
    }
}

struct RunningFileServer {
    server: fileserver::Server,
    url: String,
}

/// One index server over HTTPS plus any number of file servers registered with it.
///
/// File servers serve their user API over plain HTTP and take the caller's identity from
/// [`CLIENT_CN_HEADER`]. They register with the index server using client certificates issued by
/// the federation's own CA.
pub struct Federation {
    index: indexsrv::Server,
    file_servers: HashMap<String, RunningFileServer>,

    pub root_directory: TempDir,
    pub pki: Pki,
    pub index_config: indexsrv::Config,
    pub index_url: String,

    /// Talks to the index server. Never follows redirects.
    client: reqwest::Client,
    admin_token: String,
}

impl Federation {
    pub async fn new() -> Result<Self> {
        init_logger();
        let root_directory = TempDir::new()?;
        let pki = Pki::new(root_directory.path())?;
        let tls = pki.server_cert("localhost")?;

        const INDEX_CONFIG: &str = include_str!("data/indexsrv.toml");
        let mut cfg = indexsrv::Config::from_toml_string(INDEX_CONFIG)?;

        let port = free_port()?;
        let index_url = format!("https://localhost:{}", port);
        cfg.node.db_path = root_directory.path().join("index_db");
        cfg.node.public_url = index_url.clone();
        cfg.server = ServerSetting::Https(HttpsParameters {
            port,
            certificate: tls.certificate,
            private_key: tls.private_key,
            client_ca: Some(pki.ca_path.clone()),
        });

        let node = indexsrv::make_node(&cfg)?;
        let index = indexsrv::Server::new(cfg.clone(), node).await?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(Certificate::from_pem(&std::fs::read(&pki.ca_path)?)?)
            .redirect(Policy::none())
            .build()?;

        let mut federation = Self {
            index,
            file_servers: HashMap::new(),
            root_directory,
            pki,
            index_config: cfg,
            index_url,
            client,
            admin_token: String::new(),
        };

        federation.admin_token = federation.add_user(ADMIN_USER).await?;
        tracing::info!(url = %federation.index_url, "index server up");
        Ok(federation)
    }

    fn index(&self, path: &str) -> String {
        format!("{}{}", self.index_url, path)
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Signs a user up and returns a fresh session token.
    pub async fn add_user(&self, name: &str) -> Result<String> {
        let email = format!("{}@example.com", name);
        let _: SignupResponse = json(self.client.post(self.index("/signup")).json(
            &SignupRequest {
                name: name.into(),
                email: email.clone(),
                password: PASSWORD.into(),
            },
        ))
        .await?;
        self.login(&email).await
    }

    pub async fn login(&self, email: &str) -> Result<String> {
        let resp: LoginResponse = json(self.client.post(self.index("/login")).json(
            &LoginRequest {
                email: email.into(),
                password: PASSWORD.into(),
                otp: None,
            },
        ))
        .await?;
        Ok(resp.token)
    }

    pub async fn add_organization(&self, name: &str) -> Result<Organization> {
        json(
            self.client
                .post(self.index("/organizations"))
                .header(SESSION_HEADER, &self.admin_token)
                .json(&NewOrganizationRequest { name: name.into() }),
        )
        .await
    }

    pub async fn organization_servers(&self, org_id: &str) -> Result<Vec<FileServer>> {
        json(
            self.client
                .get(self.index(&format!("/organizations/{}/servers", org_id)))
                .header(SESSION_HEADER, &self.admin_token),
        )
        .await
    }

    /// Starts a file server of `org` and waits until the index server sees it healthy.
    ///
    /// `creators` may create files on it.
    pub async fn add_file_server(
        &mut self,
        org: &Organization,
        name: &str,
        creators: &[&str],
    ) -> Result<FileServer> {
        const BASE_CFG: &str = include_str!("data/fileserver.toml");
        let mut cfg = fileserver::Config::from_toml_string(BASE_CFG)?;

        let port = free_port()?;
        let identity = self.pki.client_cert(name)?;

        cfg.node.name = name.into();
        cfg.node.org_name = org.name.clone();
        cfg.node.creators = creators.iter().map(|c| c.to_string()).collect();
        cfg.server = FsServerSetting::Http(FsHttpParameters { port });
        cfg.control.port = free_port()?;
        cfg.oauth2.clients = vec![OAuth2ClientSetting {
            client_id: self.index_config.oauth2.client_id.clone(),
            client_secret: self.index_config.oauth2.client_secret.clone(),
            redirect_uri: self.index_config.node.redirect_uri(),
        }];
        cfg.index_server = Some(IndexServerSetting {
            url: self.index_url.clone(),
            checkin_frequency_seconds: 1,
            client_certificate: Some(identity.certificate),
            client_key: Some(identity.private_key),
            root_ca: Some(self.pki.ca_path.clone()),
        });

        let url = cfg.public_url();
        let node = fileserver::make_node(&cfg)?;
        let server = fileserver::Server::new(cfg, node).await?;
        self.file_servers
            .insert(name.to_string(), RunningFileServer { server, url });

        let this = &*self;
        let server = eventually("file server registration", || async {
            let servers = this.organization_servers(&org.id).await?;
            Ok(servers.into_iter().find(|s| s.name == name && s.healthy))
        })
        .await?;
        tracing::info!(name, id = %server.id, "file server registered");
        Ok(server)
    }

    pub fn file_server_url(&self, name: &str) -> Result<String> {
        self.file_servers
            .get(name)
            .map(|fs| fs.url.clone())
            .ok_or_else(|| anyhow!("unknown file server '{}'", name))
    }

    /// Runs the whole authorization-code flow: the index server user `token` links the file
    /// server account known there as `fs_user`.
    pub async fn link(&self, token: &str, org: &str, server: &str, fs_user: &str) -> Result<()> {
        let LinkAccountResponse { redirect } = json(
            self.client
                .post(self.index("/accounts"))
                .header(SESSION_HEADER, token)
                .json(&LinkAccountRequest {
                    org_name: org.into(),
                    server_name: server.into(),
                    force: false,
                }),
        )
        .await?;

        let resp = self
            .client
            .get(&redirect)
            .header(CLIENT_CN_HEADER, fs_user)
            .send()
            .await?;
        ensure!(
            resp.status().is_redirection(),
            "authorization was not granted: {}",
            resp.status()
        );
        let callback = resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| anyhow!("authorization redirect has no location"))?
            .to_string();

        let resp = self.client.get(&callback).send().await?;
        ensure!(
            resp.status().is_success(),
            "auth callback failed: {}",
            resp.status()
        );
        Ok(())
    }

    pub async fn accounts(&self, token: &str) -> Result<Vec<AccountInfo>> {
        json(
            self.client
                .get(self.index("/accounts"))
                .header(SESSION_HEADER, token),
        )
        .await
    }

    /// Creates a file on `server` as `user`, with `contents`.
    pub async fn create_file(
        &self,
        server: &str,
        user: &str,
        name: &str,
        contents: &[u8],
    ) -> Result<FileMetadata> {
        let base = self.file_server_url(server)?;
        let meta: FileMetadata = json(
            self.client
                .post(format!("{}/files", base))
                .header(CLIENT_CN_HEADER, user)
                .json(&FileMetadataRequest {
                    name: name.into(),
                    ..Default::default()
                }),
        )
        .await?;

        json(
            self.client
                .put(format!("{}/files/{}/contents", base, meta.id))
                .header(CLIENT_CN_HEADER, user)
                .body(contents.to_vec()),
        )
        .await
    }

    /// Deletes the contents of a file, then the file itself.
    pub async fn delete_file(&self, server: &str, user: &str, id: &str) -> Result<()> {
        let base = self.file_server_url(server)?;
        for url in [
            format!("{}/files/{}/contents", base, id),
            format!("{}/files/{}", base, id),
        ] {
            let resp = self
                .client
                .delete(&url)
                .header(CLIENT_CN_HEADER, user)
                .send()
                .await?;
            ensure!(
                resp.status().is_success(),
                "delete of {} failed: {}",
                url,
                resp.status()
            );
        }
        Ok(())
    }

    pub async fn grant(
        &self,
        server: &str,
        owner: &str,
        subject: &str,
        operation: &str,
        object: &str,
    ) -> Result<()> {
        let base = self.file_server_url(server)?;
        let resp = self
            .client
            .post(format!("{}/permissions", base))
            .header(CLIENT_CN_HEADER, owner)
            .json(&PermissionRequest {
                subject: subject.into(),
                object: object.into(),
                operation: operation.into(),
                action: PermissionAction::Grant,
            })
            .send()
            .await?;
        ensure!(
            resp.status().is_success(),
            "grant failed: {}",
            resp.status()
        );
        Ok(())
    }

    pub async fn mappings(&self, token: &str, force_update: bool) -> Result<Vec<Mapping>> {
        let mut request = self
            .client
            .get(self.index("/mappings"))
            .header(SESSION_HEADER, token);
        if force_update {
            request = request.query(&[("force_update", "true")]);
        }
        let resp: ListMappingsResponse = json(request).await?;
        Ok(resp.mappings)
    }

    /// Waits for the mapping of `file_ref` to satisfy `check`.
    pub async fn wait_for_mapping<F>(&self, token: &str, file_ref: &str, check: F) -> Result<Mapping>
    where
        F: Fn(&Mapping) -> bool,
    {
        eventually(&format!("mapping of {}", file_ref), || async {
            let mappings = self.mappings(token, false).await?;
            Ok(mappings
                .into_iter()
                .find(|m| m.file_ref == file_ref && check(m)))
        })
        .await
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        json(self.client.get(self.index("/health"))).await
    }

    pub async fn sync_errors(&self) -> Result<SyncErrorsResponse> {
        json(
            self.client
                .get(self.index("/api/fileservers/v1/sync_errors"))
                .header(SESSION_HEADER, &self.admin_token),
        )
        .await
    }

    /// Stops one file server, keeping the rest of the federation up.
    pub async fn stop_file_server(&mut self, name: &str) -> Result<()> {
        let fs = self
            .file_servers
            .remove(name)
            .ok_or_else(|| anyhow!("unknown file server '{}'", name))?;
        fs.server.stop().await
    }

    pub async fn stop_all(self) -> Result<()> {
        let stops = self.file_servers.into_values().map(|fs| fs.server.stop());
        let r: Result<Vec<()>> = futures::future::join_all(stops)
            .await
            .into_iter()
            .collect();
        r?;

        self.index.stop().await
    }
}
