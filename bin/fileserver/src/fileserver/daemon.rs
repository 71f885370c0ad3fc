use std::path::PathBuf;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use xecute::Daemon;

use crate::{Config, Server};

#[derive(Default)]
pub struct FileServerDaemon {
    server: Option<Server>,
}

impl FileServerDaemon {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Daemon for FileServerDaemon {
    type Config = Config;

    fn load_config(&self, path: &Option<PathBuf>) -> Result<Self::Config> {
        Config::from_file(path)
    }

    async fn start(&mut self, cfg: Self::Config) -> Result<()> {
        tracing::info!(
            name = %cfg.node.name,
            org = %cfg.node.org_name,
            federated = cfg.index_server.is_some(),
            "starting file server"
        );
        let node = crate::make_node(&cfg)?;
        self.server = Some(Server::new(cfg, node).await?);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.server
            .take()
            .ok_or_else(|| anyhow!("file server is not running"))?
            .stop()
            .await
    }
}
