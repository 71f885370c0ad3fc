use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use config::{builder::DefaultState, Config as ConfigLoader, ConfigBuilder, Environment, File};

use serde::{Deserialize, Serialize};

const DEFAULT_HTTP_PORT: i64 = 8080;
const DEFAULT_CONTROL_PORT: i64 = 8081;

const DEFAULT_BROKER_BUFFER_SIZE: i64 = 10_000;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS: i64 = 60;

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60 * 6; // 6 hours.
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 60 * 60 * 24 * 30; // 30 days.
const DEFAULT_CODE_TTL_SECONDS: i64 = 60 * 10;

fn default_checkin_frequency_seconds() -> u64 {
    20
}

/// Selects the storage plugin and the arguments handed to it.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PluginSetting {
    pub name: String,

    /// Contract version the plugin is expected to implement, if pinned.
    #[serde(default)]
    pub api_version: Option<u32>,

    #[serde(default)]
    pub args: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeSetting {
    pub name: String,
    pub org_name: String,
    pub public_host: String,
    pub encryption_key: String,

    /// When absent, files are kept in memory.
    #[serde(default)]
    pub plugin: Option<PluginSetting>,

    /// Subjects allowed to create files.
    #[serde(default)]
    pub creators: Vec<String>,

    pub broker_buffer_size: usize,
    pub stream_idle_timeout_seconds: u64,
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

    pub fn scheme(&self) -> &'static str {
        match self {
            ServerSetting::Http(_) => "http",
            ServerSetting::Https(_) => "https",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsSetting {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub client_ca: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ControlSetting {
    pub port: u16,
    #[serde(default)]
    pub tls: Option<TlsSetting>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OAuth2ClientSetting {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OAuth2Setting {
    #[serde(default)]
    pub clients: Vec<OAuth2ClientSetting>,
    pub access_token_ttl_seconds: u32,
    pub refresh_token_ttl_seconds: u32,
    pub code_ttl_seconds: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IndexServerSetting {
    pub url: String,

    #[serde(default = "default_checkin_frequency_seconds")]
    pub checkin_frequency_seconds: u64,

    pub client_certificate: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub root_ca: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct IdentitySetting {
    pub trusted_cn_header: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    pub node: NodeSetting,
    pub server: ServerSetting,
    pub control: ControlSetting,
    pub oauth2: OAuth2Setting,

    #[serde(default)]
    pub index_server: Option<IndexServerSetting>,

    #[serde(default)]
    pub identity: IdentitySetting,
}

impl Config {
    fn default_loader() -> Result<ConfigBuilder<DefaultState>> {
        let loader = ConfigLoader::builder();

        let default_config_path = dirs::config_dir()
            .ok_or_else(|| anyhow!("cannot locate config directory"))?
            .join("mifs")
            .join("fileserver")
            .with_extension("toml");

        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("cannot locate data directory"))?
            .join("mifs");

        fs::create_dir_all(&data_dir)?;

        Ok(loader
            .set_default("server.type", "http")?
            .set_default("server.port", DEFAULT_HTTP_PORT)?
            .set_default("control.port", DEFAULT_CONTROL_PORT)?
            .set_default("node.broker_buffer_size", DEFAULT_BROKER_BUFFER_SIZE)?
            .set_default(
                "node.stream_idle_timeout_seconds",
                DEFAULT_STREAM_IDLE_TIMEOUT_SECONDS,
            )?
            .set_default(
                "oauth2.access_token_ttl_seconds",
                DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            )?
            .set_default(
                "oauth2.refresh_token_ttl_seconds",
                DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            )?
            .set_default("oauth2.code_ttl_seconds", DEFAULT_CODE_TTL_SECONDS)?
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

    /// Base URL of the user-facing HTTP API, as advertised to the index server.
    pub fn public_url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.server.scheme(),
            self.node.public_host,
            self.server.port()
        )
    }

    /// Endpoint of the change feed, as advertised to the index server.
    pub fn control_endpoint(&self) -> String {
        let scheme = if self.control.tls.is_some() {
            "https"
        } else {
            "http"
        };
        format!("{}://{}:{}", scheme, self.node.public_host, self.control.port)
    }
}
