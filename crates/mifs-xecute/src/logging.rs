use std::path::PathBuf;

use anyhow::Result;

use config::Config;

use serde::{Deserialize, Serialize};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::telemetry;

const DEFAULT_TRACKED_CRATES: &[&str] = &[
    "fileserver",
    "indexsrv",
    "xecute",
    "apikit",
    "mifs_auth",
    "protocol",
    "mifs_std",
    "testing",
    "tower_http",
];

#[cfg(debug_assertions)]
const NORMAL_CRATE_LEVEL: &str = "debug";

#[cfg(not(debug_assertions))]
const NORMAL_CRATE_LEVEL: &str = "info";

#[cfg(debug_assertions)]
const DETAILED_CRATE_LEVEL: &str = "trace";

#[cfg(not(debug_assertions))]
const DETAILED_CRATE_LEVEL: &str = "debug";

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Normal,
    Detailed,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum LogStructure {
    Preset(LogLevel),
    Explicit(Vec<String>),
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TracingConfig {
    None,
    Jaeger,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig::None
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: LogStructure,

    #[serde(default)]
    pub json: bool,

    #[serde(default)]
    pub tracing: TracingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogStructure::Preset(LogLevel::Normal),
            json: false,
            tracing: TracingConfig::None,
        }
    }
}

impl LoggingConfig {
    fn get_filter(&self) -> EnvFilter {
        let directives = match &self.level {
            LogStructure::Explicit(dirs) => dirs.clone(),
            LogStructure::Preset(LogLevel::Normal) => DEFAULT_TRACKED_CRATES
                .iter()
                .map(|crate_name| format!("{}={}", crate_name, NORMAL_CRATE_LEVEL))
                .collect::<Vec<_>>(),
            LogStructure::Preset(LogLevel::Detailed) => DEFAULT_TRACKED_CRATES
                .iter()
                .map(|crate_name| format!("{}={}", crate_name, DETAILED_CRATE_LEVEL))
                .collect::<Vec<_>>(),
        };

        EnvFilter::new(directives.join(","))
    }
}

fn get_logging_config(path: &Option<PathBuf>) -> Result<LoggingConfig> {
    let mut builder = Config::builder()
        .set_default("level", "normal")?
        .set_default("json", false)?
        .set_default("tracing", "none")?;

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path.as_ref()))
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MIFS_LOG")
            .separator("_")
            .try_parsing(true),
    );

    let config: LoggingConfig = builder.build()?.try_deserialize()?;

    Ok(config)
}

/// Install the global subscriber.
///
/// Exporting spans to jaeger requires being called from within a tokio runtime.
pub fn init_logger(name: &str, log_cfg_path: &Option<PathBuf>) -> Result<()> {
    let cfg = get_logging_config(log_cfg_path)?;

    let env_filter = cfg.get_filter();
    let builder = FmtSubscriber::builder().with_env_filter(env_filter);

    match (cfg.json, cfg.tracing) {
        (true, TracingConfig::Jaeger) => {
            let tracer = telemetry::init_tracer(name)?;
            builder
                .json()
                .finish()
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
        }
        (false, TracingConfig::Jaeger) => {
            let tracer = telemetry::init_tracer(name)?;
            builder
                .finish()
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()?;
        }
        (true, TracingConfig::None) => builder.json().finish().try_init()?,
        (false, TracingConfig::None) => builder.finish().try_init()?,
    }

    Ok(())
}

/// Flush pending spans before exit.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_filter_covers_tracked_crates() {
        let cfg = LoggingConfig::default();
        let filter = cfg.get_filter().to_string();
        for krate in DEFAULT_TRACKED_CRATES {
            assert!(filter.contains(krate), "missing {}", krate);
        }
    }

    #[test]
    fn explicit_filter_is_used_verbatim() {
        let cfg = LoggingConfig {
            level: LogStructure::Explicit(vec!["indexsrv=warn".into()]),
            json: false,
            tracing: TracingConfig::None,
        };
        assert_eq!(cfg.get_filter().to_string(), "indexsrv=warn");
    }
}
