use std::path::PathBuf;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use xecute::Daemon;

use crate::{Config, Server};

#[derive(Default)]
pub struct IndexServerDaemon {
    server: Option<Server>,
}

impl IndexServerDaemon {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Daemon for IndexServerDaemon {
    type Config = Config;

    fn load_config(&self, path: &Option<PathBuf>) -> Result<Self::Config> {
        Config::from_file(path)
    }

    async fn start(&mut self, cfg: Self::Config) -> Result<()> {
        tracing::info!(
            db = ?cfg.node.db_path,
            public_url = %cfg.node.public_url,
            "starting index server"
        );
        let node = crate::make_node(&cfg)?;
        self.server = Some(Server::new(cfg, node).await?);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.server
            .take()
            .ok_or_else(|| anyhow!("index server is not running"))?
            .stop()
            .await
    }
}
