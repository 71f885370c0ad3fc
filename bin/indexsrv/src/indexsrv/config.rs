use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

use config::{builder::DefaultState, Config as ConfigLoader, ConfigBuilder, Environment, File};

use serde::{Deserialize, Serialize};

const DEFAULT_HTTP_PORT: i64 = 9876;
const DEFAULT_SESSION_TTL_SECONDS: i64 = 60 * 60 * 24;
const DEFAULT_STATE_TTL_SECONDS: i64 = 60 * 10;

const DEFAULT_BACKOFF_BASE_MS: i64 = 500;
const DEFAULT_BACKOFF_CAP_MS: i64 = 30_000;
const DEFAULT_BATCH_SIZE: i64 = 100;
const DEFAULT_BATCH_WINDOW_MS: i64 = 100;
const DEFAULT_DIAL_TIMEOUT_SECONDS: i64 = 5;
const DEFAULT_UNARY_TIMEOUT_SECONDS: i64 = 10;
const DEFAULT_TOKEN_REFRESH_MARGIN_SECONDS: i64 = 60;
const DEFAULT_CANCEL_GRACE_MS: i64 = 2_000;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeSetting {
    pub db_path: PathBuf,

    /// Base URL users reach this server at. The OAuth2 callback lives under it.
    pub public_url: String,

    pub session_ttl_seconds: u64,

    /// Names of the users allowed to manage organizations.
    #[serde(default)]
    pub admin_users: Vec<String>,
}

impl NodeSetting {
    pub fn redirect_uri(&self) -> String {
        format!(
            "{}/accounts/auth_callback",
            self.public_url.trim_end_matches('/')
        )
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HttpParameters {
    pub port: u16,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct HttpsParameters {
    pub port: u16,
    pub certificate: PathBuf,
    pub private_key: PathBuf,

    /// Verifies the client certificates file servers register with.
    pub client_ca: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "lowercase")]
pub enum ServerSetting {
    Http(HttpParameters),
    Https(HttpsParameters),
}

impl ServerSetting {
    pub fn port(&self) -> u16 {
        match self {
            ServerSetting::Http(p) => p.port,
            ServerSetting::Https(p) => p.port,
        }
    }
}

/// The credentials this server presents to every file server.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OAuth2Setting {
    pub client_id: String,
    pub client_secret: String,

    /// How long an authorization request waits for its callback.
    pub state_ttl_seconds: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SyncSetting {
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub batch_size: usize,
    pub batch_window_ms: u64,
    pub dial_timeout_seconds: u64,
    pub unary_timeout_seconds: u64,
    pub token_refresh_margin_seconds: u64,
    pub cancel_grace_ms: u64,

    /// Trust anchor for file server endpoints, on top of the system roots.
    #[serde(default)]
    pub root_ca: Option<PathBuf>,

    /// Client identity presented to file servers, as PEM files.
    #[serde(default)]
    pub client_certificate: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
}

impl SyncSetting {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_seconds)
    }

    pub fn unary_timeout(&self) -> Duration {
        Duration::from_secs(self.unary_timeout_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IdentitySetting {
    pub trusted_cn_header: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub node: NodeSetting,
    pub server: ServerSetting,
    pub oauth2: OAuth2Setting,
    pub sync: SyncSetting,

    #[serde(default)]
    pub identity: IdentitySetting,
}

impl Config {
    fn default_loader() -> Result<ConfigBuilder<DefaultState>> {
        let loader = ConfigLoader::builder();

        let default_config_path = dirs::config_dir()
            .ok_or_else(|| anyhow!("cannot locate config directory"))?
            .join("mifs")
            .join("indexsrv")
            .with_extension("toml");

        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("cannot locate data directory"))?
            .join("mifs");

        fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("index_db");
        let db_path_str = db_path
            .to_str()
            .ok_or_else(|| anyhow!("data directory path is not valid unicode"))?;

        Ok(loader
            .set_default("node.db_path", db_path_str)?
            .set_default(
                "node.public_url",
                format!("http://localhost:{}", DEFAULT_HTTP_PORT),
            )?
            .set_default("node.session_ttl_seconds", DEFAULT_SESSION_TTL_SECONDS)?
            .set_default("oauth2.state_ttl_seconds", DEFAULT_STATE_TTL_SECONDS)?
            .set_default("server.type", "http")?
            .set_default("server.port", DEFAULT_HTTP_PORT)?
            .set_default("sync.backoff_base_ms", DEFAULT_BACKOFF_BASE_MS)?
            .set_default("sync.backoff_cap_ms", DEFAULT_BACKOFF_CAP_MS)?
            .set_default("sync.batch_size", DEFAULT_BATCH_SIZE)?
            .set_default("sync.batch_window_ms", DEFAULT_BATCH_WINDOW_MS)?
            .set_default("sync.dial_timeout_seconds", DEFAULT_DIAL_TIMEOUT_SECONDS)?
            .set_default("sync.unary_timeout_seconds", DEFAULT_UNARY_TIMEOUT_SECONDS)?
            .set_default(
                "sync.token_refresh_margin_seconds",
                DEFAULT_TOKEN_REFRESH_MARGIN_SECONDS,
            )?
            .set_default("sync.cancel_grace_ms", DEFAULT_CANCEL_GRACE_MS)?
            .add_source(
                File::from(default_config_path)
                    .required(false)
                    .format(config::FileFormat::Toml),
            ))
    }

    pub fn from_toml_string<S: AsRef<str>>(cfg_string: S) -> Result<Config> {
        let loader = Config::default_loader()?.add_source(File::from_str(
            cfg_string.as_ref(),
            config::FileFormat::Toml,
        ));

        let cfg: Config = loader.build()?.try_deserialize()?;
        tracing::debug!(config = ?cfg, "loaded configuration");

        Ok(cfg)
    }

    pub fn from_file(cfg_file: &Option<PathBuf>) -> Result<Config> {
        let mut loader = Config::default_loader()?;

        if let Some(cfg) = cfg_file {
            loader = loader.add_source(File::from(cfg.as_ref()).required(false));
        }

        loader = loader.add_source(
            Environment::with_prefix("MIFS")
                .separator("_")
                .try_parsing(true),
        );

        let cfg: Config = loader.build()?.try_deserialize()?;

        Ok(cfg)
    }
}
