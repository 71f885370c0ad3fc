use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use async_trait::async_trait;

use mifs_std::collections::ConcurrentHashMap;

use protocol::fileserver::{RegistrationResult, ServerInfo, StatusRequest};
use protocol::oauth2::{
    ErrorResponse, TokenRequest, TokenResponse, GRANT_AUTHORIZATION_CODE, GRANT_REFRESH_TOKEN,
    RESPONSE_TYPE_CODE,
};

use reqwest::{Certificate, Identity, StatusCode, Url};

use ring::rand::{SecureRandom, SystemRandom};

use snafu::Snafu;

use crate::config::{OAuth2Setting, SyncSetting};
use crate::node::model::{new_id, FileServer, Organization, PendingOAuth2, UserAccount};
use crate::node::store::iface::{
    DynFileServerStore, DynOrganizationStore, DynPendingOAuth2Store, DynUserAccountStore,
};
use crate::node::store::RepositoryError;

const STATE_LEN: usize = 50;
const STATE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RegistrarError {
    #[snafu(display("certificate common name '{}' does not match server '{}'", cn, name))]
    CNMismatch { cn: String, name: String },

    #[snafu(display("an account is already linked to this server"))]
    AccountExists,

    #[snafu(display("{} not found", what))]
    NotFound { what: String },

    #[snafu(display("organization '{}' not found", name))]
    OrganizationNotFound { name: String },

    #[snafu(display("file server '{}' not found", name))]
    ServerNotFound { name: String },

    #[snafu(display("token exchange failed: {}", reason))]
    TokenExchange { reason: String },

    #[snafu(display("the account must be linked again"))]
    NeedsRelink,

    #[snafu(display("organization name cannot be empty"))]
    EmptyOrganizationName,

    #[snafu(display("{}", source))]
    Repository { source: RepositoryError },
}

impl From<RepositoryError> for RegistrarError {
    fn from(source: RepositoryError) -> Self {
        RegistrarError::Repository { source }
    }
}

type RegistrarResult<T> = std::result::Result<T, RegistrarError>;

#[derive(Debug, Snafu)]
pub enum TokenError {
    /// The file server refused the grant. The link has to be redone.
    #[snafu(display("token endpoint rejected the grant: {}", error))]
    Rejected { error: String },

    #[snafu(display("token endpoint unavailable: {}", reason))]
    Unavailable { reason: String },
}

/// Talks to file server OAuth2 token endpoints.
#[async_trait]
pub trait TokenClient {
    async fn request(
        &self,
        token_url: &str,
        request: &TokenRequest,
    ) -> std::result::Result<TokenResponse, TokenError>;
}

pub type DynTokenClient = Arc<dyn TokenClient + Send + Sync>;

pub struct HttpTokenClient {
    client: reqwest::Client,
}

impl HttpTokenClient {
    pub fn new(cfg: &SyncSetting) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(cfg.unary_timeout());

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
            _ => return Err(anyhow!("sync client certificate and key must be set together")),
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl TokenClient for HttpTokenClient {
    #[tracing::instrument(skip(self, request), fields(grant = %request.grant_type))]
    async fn request(
        &self,
        token_url: &str,
        request: &TokenRequest,
    ) -> std::result::Result<TokenResponse, TokenError> {
        let unavailable = |e: reqwest::Error| TokenError::Unavailable {
            reason: e.to_string(),
        };

        let resp = self
            .client
            .post(token_url)
            .form(request)
            .send()
            .await
            .map_err(unavailable)?;

        let status = resp.status();
        let body = resp.bytes().await.map_err(unavailable)?;

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let error = serde_json::from_slice::<ErrorResponse>(body.as_ref())
                .map(|e| e.error)
                .unwrap_or_else(|_| status.to_string());
            return Err(TokenError::Rejected { error });
        }

        if !status.is_success() {
            return Err(TokenError::Unavailable {
                reason: format!("{}: {}", status, String::from_utf8_lossy(body.as_ref())),
            });
        }

        serde_json::from_slice(body.as_ref()).map_err(|e| TokenError::Unavailable {
            reason: format!("malformed token response: {}", e),
        })
    }
}

#[derive(Clone, Debug)]
pub struct ServerStatus {
    pub healthy: bool,
    pub uptime: u64,
    /// Unix seconds.
    pub last_seen: i64,
}

/// File server registration, organizations, and the per-user OAuth2 account links.
pub struct Registrar {
    organizations: DynOrganizationStore,
    servers: DynFileServerStore,
    accounts: DynUserAccountStore,
    pending: DynPendingOAuth2Store,
    tokens: DynTokenClient,

    oauth2: OAuth2Setting,
    redirect_uri: String,

    status: ConcurrentHashMap<String, ServerStatus>,
    rng: SystemRandom,
}

impl Registrar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        organizations: DynOrganizationStore,
        servers: DynFileServerStore,
        accounts: DynUserAccountStore,
        pending: DynPendingOAuth2Store,
        tokens: DynTokenClient,
        oauth2: OAuth2Setting,
        redirect_uri: String,
    ) -> Self {
        Self {
            organizations,
            servers,
            accounts,
            pending,
            tokens,
            oauth2,
            redirect_uri,
            status: ConcurrentHashMap::new(),
            rng: SystemRandom::new(),
        }
    }

    fn random_state(&self) -> Result<String> {
        // Rejection sampling, so every character is equally likely.
        let limit = (256 / STATE_ALPHABET.len() * STATE_ALPHABET.len()) as u8;

        let mut state = String::with_capacity(STATE_LEN);
        let mut raw = [0u8; STATE_LEN];
        while state.len() < STATE_LEN {
            self.rng.fill(&mut raw).map_err(|e| anyhow!("{}", e))?;
            let missing = STATE_LEN - state.len();
            state.extend(
                raw.iter()
                    .filter(|b| **b < limit)
                    .map(|b| STATE_ALPHABET[*b as usize % STATE_ALPHABET.len()] as char)
                    .take(missing),
            );
        }
        Ok(state)
    }

    fn state_cutoff(&self) -> i64 {
        chrono::Utc::now().timestamp() - self.oauth2.state_ttl_seconds as i64
    }

    fn token_request(&self, grant_type: &str) -> TokenRequest {
        TokenRequest {
            grant_type: grant_type.to_string(),
            client_id: self.oauth2.client_id.clone(),
            client_secret: self.oauth2.client_secret.clone(),
            ..Default::default()
        }
    }

    #[tracing::instrument(skip(self, info), fields(org = %info.org_name, name = %info.name))]
    pub fn register_server(
        &self,
        cn: &str,
        info: &ServerInfo,
    ) -> RegistrarResult<(RegistrationResult, FileServer)> {
        if cn != info.name {
            return Err(RegistrarError::CNMismatch {
                cn: cn.to_string(),
                name: info.name.clone(),
            });
        }

        let org = match self.organizations.find_by_name(&info.org_name) {
            Ok(o) => o,
            Err(e) if e.is_not_found() => {
                return Err(RegistrarError::OrganizationNotFound {
                    name: info.org_name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let (server, created) = self.servers.upsert(&FileServer {
            id: new_id(),
            org_id: org.id,
            name: info.name.clone(),
            auth_url: info.auth_url.clone(),
            token_url: info.token_url.clone(),
            fetch_url: info.fetch_url.clone(),
            control_endpoint: info.control_endpoint.clone(),
            common_name: cn.to_string(),
        })?;

        if created {
            tracing::info!(id = %server.id, "file server registered");
            Ok((RegistrationResult::Ok, server))
        } else {
            tracing::debug!(id = %server.id, "file server already registered");
            Ok((RegistrationResult::AlreadyRegistered, server))
        }
    }

    /// Records a liveness announce. Returns true when the server was unknown or unhealthy
    /// before and is healthy now.
    #[tracing::instrument(skip(self, cn, status), fields(server = %status.server_id))]
    pub fn record_status(&self, cn: &str, status: &StatusRequest) -> RegistrarResult<bool> {
        let server = self.get_server(&status.server_id)?;
        if server.common_name != cn {
            return Err(RegistrarError::CNMismatch {
                cn: cn.to_string(),
                name: server.name,
            });
        }

        let previous = self.status.insert(
            status.server_id.clone(),
            ServerStatus {
                healthy: status.healthy,
                uptime: status.uptime,
                last_seen: chrono::Utc::now().timestamp(),
            },
        );

        let was_healthy = previous.map(|s| s.healthy).unwrap_or(false);
        Ok(status.healthy && !was_healthy)
    }

    pub fn is_healthy(&self, server_id: &str) -> bool {
        self.status
            .get(server_id)
            .map(|s| s.healthy)
            .unwrap_or(false)
    }

    pub fn server_status(&self, server_id: &str) -> Option<ServerStatus> {
        self.status.get(server_id)
    }

    pub fn add_organization(&self, name: &str) -> Result<Organization> {
        anyhow::ensure!(!name.is_empty(), RegistrarError::EmptyOrganizationName);
        Ok(self.organizations.add(name)?)
    }

    pub fn list_organizations(&self) -> RegistrarResult<Vec<Organization>> {
        Ok(self.organizations.list()?)
    }

    pub fn get_organization(&self, id: &str) -> RegistrarResult<Organization> {
        match self.organizations.get(id) {
            Err(e) if e.is_not_found() => Err(RegistrarError::OrganizationNotFound {
                name: id.to_string(),
            }),
            r => Ok(r?),
        }
    }

    pub fn list_servers(&self, org_id: Option<&str>) -> RegistrarResult<Vec<FileServer>> {
        Ok(self.servers.list(org_id)?)
    }

    pub fn get_server(&self, id: &str) -> RegistrarResult<FileServer> {
        match self.servers.get(id) {
            Err(e) if e.is_not_found() => Err(RegistrarError::ServerNotFound {
                name: id.to_string(),
            }),
            r => Ok(r?),
        }
    }

    pub fn find_server(&self, org_name: &str, server_name: &str) -> RegistrarResult<FileServer> {
        let org = match self.organizations.find_by_name(org_name) {
            Err(e) if e.is_not_found() => {
                return Err(RegistrarError::OrganizationNotFound {
                    name: org_name.to_string(),
                })
            }
            r => r?,
        };

        match self.servers.find(&org.id, server_name) {
            Err(e) if e.is_not_found() => Err(RegistrarError::ServerNotFound {
                name: server_name.to_string(),
            }),
            r => Ok(r?),
        }
    }

    /// Starts an authorization-code flow and returns the URL to send the user to.
    #[tracing::instrument(skip(self))]
    pub fn initiate_link(&self, user_id: &str, server_id: &str, force: bool) -> Result<String> {
        let server = self.get_server(server_id)?;

        match self.accounts.get(user_id, server_id) {
            Ok(_) if !force => return Err(RegistrarError::AccountExists.into()),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let state = self.random_state()?;
        self.pending.put(&PendingOAuth2 {
            state: state.clone(),
            user_id: user_id.to_string(),
            server_id: server_id.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        })?;

        let mut url = Url::parse(&server.auth_url)
            .with_context(|| format!("invalid authorization URL '{}'", server.auth_url))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.oauth2.client_id)
            .append_pair("state", &state)
            .append_pair("response_type", RESPONSE_TYPE_CODE)
            .append_pair("redirect_uri", &self.redirect_uri);

        Ok(url.to_string())
    }

    /// Consumes `state`, exchanges `code` and stores the resulting account.
    #[tracing::instrument(skip(self, state, code))]
    pub async fn complete_link(&self, state: &str, code: &str) -> RegistrarResult<UserAccount> {
        let pending = match self.pending.pop(state) {
            Err(e) if e.is_not_found() => {
                return Err(RegistrarError::NotFound {
                    what: "authorization state".into(),
                })
            }
            r => r?,
        };
        if pending.created_at < self.state_cutoff() {
            tracing::debug!(user = %pending.user_id, "authorization state expired");
            return Err(RegistrarError::NotFound {
                what: "authorization state".into(),
            });
        }

        let server = self.get_server(&pending.server_id)?;

        let mut request = self.token_request(GRANT_AUTHORIZATION_CODE);
        request.code = Some(code.to_string());
        request.redirect_uri = Some(self.redirect_uri.clone());

        let tokens = self
            .tokens
            .request(&server.token_url, &request)
            .await
            .map_err(|e| RegistrarError::TokenExchange {
                reason: e.to_string(),
            })?;

        let account = UserAccount {
            user_id: pending.user_id,
            server_id: pending.server_id,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_expires_at: chrono::Utc::now().timestamp() + tokens.expires_in as i64,
            checkpoint_ns: 0,
            needs_relink: false,
        };
        self.accounts.put(&account)?;

        tracing::info!(user = %account.user_id, server = %account.server_id, "account linked");
        Ok(account)
    }

    /// Returns an access token valid for at least `margin`, refreshing it if needed.
    pub async fn valid_token(
        &self,
        user_id: &str,
        server_id: &str,
        margin: Duration,
    ) -> RegistrarResult<String> {
        let account = self.accounts.get(user_id, server_id)?;
        if account.needs_relink {
            return Err(RegistrarError::NeedsRelink);
        }

        let now = chrono::Utc::now().timestamp();
        if account.token_expires_at - now > margin.as_secs() as i64 {
            return Ok(account.access_token);
        }

        self.refresh(user_id, server_id).await
    }

    /// Rotates both tokens of the account. A refused grant flags the account for relinking.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self, user_id: &str, server_id: &str) -> RegistrarResult<String> {
        let account = self.accounts.get(user_id, server_id)?;
        if account.needs_relink {
            return Err(RegistrarError::NeedsRelink);
        }
        let server = self.get_server(server_id)?;

        let mut request = self.token_request(GRANT_REFRESH_TOKEN);
        request.refresh_token = Some(account.refresh_token.clone());

        match self.tokens.request(&server.token_url, &request).await {
            Ok(tokens) => {
                self.accounts.update_tokens(
                    user_id,
                    server_id,
                    &tokens.access_token,
                    &tokens.refresh_token,
                    chrono::Utc::now().timestamp() + tokens.expires_in as i64,
                )?;
                tracing::debug!("tokens rotated");
                Ok(tokens.access_token)
            }
            Err(TokenError::Rejected { error }) => {
                tracing::warn!(%error, "refresh refused, account needs relinking");
                self.accounts.set_needs_relink(user_id, server_id, true)?;
                Err(RegistrarError::NeedsRelink)
            }
            Err(e) => Err(RegistrarError::TokenExchange {
                reason: e.to_string(),
            }),
        }
    }

    pub fn get_account(&self, user_id: &str, server_id: &str) -> RegistrarResult<UserAccount> {
        match self.accounts.get(user_id, server_id) {
            Err(e) if e.is_not_found() => Err(RegistrarError::NotFound {
                what: "account".into(),
            }),
            r => Ok(r?),
        }
    }

    pub fn list_accounts(&self, user_id: &str) -> RegistrarResult<Vec<UserAccount>> {
        Ok(self.accounts.list_for_user(user_id)?)
    }

    pub fn all_accounts(&self) -> RegistrarResult<Vec<UserAccount>> {
        Ok(self.accounts.list_all()?)
    }

    #[tracing::instrument(skip(self))]
    pub fn unlink(&self, user_id: &str, server_id: &str) -> RegistrarResult<()> {
        match self.accounts.remove(user_id, server_id) {
            Err(e) if e.is_not_found() => Err(RegistrarError::NotFound {
                what: "account".into(),
            }),
            r => Ok(r?),
        }
    }

    pub fn update_checkpoint(
        &self,
        user_id: &str,
        server_id: &str,
        checkpoint_ns: i64,
    ) -> RegistrarResult<()> {
        Ok(self
            .accounts
            .update_checkpoint(user_id, server_id, checkpoint_ns)?)
    }

    pub fn reset_checkpoint(&self, user_id: &str, server_id: &str) -> RegistrarResult<()> {
        Ok(self.accounts.reset_checkpoint(user_id, server_id)?)
    }

    /// Drops authorization requests whose callback never came.
    pub fn purge_stale_states(&self) -> Result<usize> {
        Ok(self.pending.purge_created_before(self.state_cutoff())?)
    }

    pub async fn flush(&self) -> Result<()> {
        self.organizations.flush().await?;
        self.servers.flush().await?;
        self.accounts.flush().await?;
        self.pending.flush().await?;
        Ok(())
    }
}
