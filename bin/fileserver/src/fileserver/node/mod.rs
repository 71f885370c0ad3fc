mod authz;
mod broker;
mod filemanager;
mod oauth2;
mod plugin;
mod registration;
mod storage;

use std::sync::Arc;

use anyhow::Result;

use mifs_std::time::MonotonicClock;

use protocol::fileserver::ServerInfo;

use crate::Config;

pub use authz::{AuthzError, Operation, GLOBAL_OBJECT};
pub use broker::{Broker, Change, EventType, Subscription};
pub use filemanager::{FileManager, FileManagerError};
pub use oauth2::{OAuth2Error, OAuth2Provider};
pub use registration::{IndexServerProxy, Registration};
pub use storage::{MetadataFields, StorageError};

/// Everything the HTTP and gRPC layers serve from.
pub struct FileNode {
    files: Arc<FileManager>,
    oauth2: Arc<OAuth2Provider>,
    registration: Option<Arc<Registration>>,
}

impl FileNode {
    pub fn new(
        files: FileManager,
        oauth2: OAuth2Provider,
        registration: Option<Registration>,
    ) -> Self {
        Self {
            files: Arc::new(files),
            oauth2: Arc::new(oauth2),
            registration: registration.map(Arc::new),
        }
    }

    pub fn files(&self) -> Arc<FileManager> {
        self.files.clone()
    }

    pub fn oauth2(&self) -> Arc<OAuth2Provider> {
        self.oauth2.clone()
    }

    pub fn registration(&self) -> Option<Arc<Registration>> {
        self.registration.clone()
    }

    pub async fn flush(&self) -> Result<()> {
        self.files.flush().await
    }
}

fn server_info(c: &Config) -> ServerInfo {
    let base = c.public_url();
    ServerInfo {
        org_name: c.node.org_name.clone(),
        name: c.node.name.clone(),
        auth_url: format!("{}/authorize", base),
        token_url: format!("{}/token", base),
        fetch_url: format!("{}/files", base),
        control_endpoint: c.control_endpoint(),
    }
}

#[tracing::instrument(skip(c), fields(name = %c.node.name))]
pub fn make_node(c: &Config) -> Result<FileNode> {
    tracing::debug!("begin node init");

    let plugin = plugin::load(c.node.plugin.as_ref())?;
    let broker = Broker::new(c.node.broker_buffer_size);
    let clock = Arc::new(MonotonicClock::new());
    let files = FileManager::new(plugin, broker, clock.clone());

    // Stamps handed out after a restart must stay above everything already stored.
    clock.observe(files.latest_stamp()?);

    for creator in c.node.creators.iter() {
        files.bootstrap_grant(creator, Operation::Create, GLOBAL_OBJECT)?;
    }

    let oauth2 = OAuth2Provider::new(c.node.encryption_key.clone(), &c.oauth2);

    let registration = match &c.index_server {
        Some(is_cfg) => Some(Registration::new(
            IndexServerProxy::new(is_cfg)?,
            server_info(c),
        )),
        None => None,
    };

    tracing::debug!("node init complete");
    Ok(FileNode::new(files, oauth2, registration))
}

#[cfg(test)]
mod test;
