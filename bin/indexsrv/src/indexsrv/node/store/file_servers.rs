use anyhow::Result as AnyResult;

use async_trait::async_trait;

use sled::Transactional;

use snafu::ResultExt;

use crate::node::model::FileServer;

use super::iface::Flush;
use super::util::{abort, decode, encode, from_tx, get, key, prefix, scan_all};
use super::{DbSnafu, RepositoryError, Result};

const FILE_SERVERS_TREE: &str = "file_servers";
const FILE_SERVERS_BY_NAME_TREE: &str = "file_servers_by_name";

pub trait FileServerStore: Flush {
    /// Inserts the server, or refreshes the record already registered under the same
    /// `(org_id, name)`. The stored id is kept. Returns the record and whether it is new.
    fn upsert(&self, server: &FileServer) -> Result<(FileServer, bool)>;
    fn get(&self, id: &str) -> Result<FileServer>;
    fn find(&self, org_id: &str, name: &str) -> Result<FileServer>;
    fn list(&self, org_id: Option<&str>) -> Result<Vec<FileServer>>;
}

pub struct SledFileServerStore {
    servers: sled::Tree,
    by_name: sled::Tree,
}

impl SledFileServerStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            servers: db.open_tree(FILE_SERVERS_TREE).context(DbSnafu)?,
            by_name: db.open_tree(FILE_SERVERS_BY_NAME_TREE).context(DbSnafu)?,
        })
    }
}

#[async_trait]
impl Flush for SledFileServerStore {
    async fn flush(&self) -> AnyResult<()> {
        self.servers.flush_async().await?;
        self.by_name.flush_async().await?;
        Ok(())
    }
}

impl FileServerStore for SledFileServerStore {
    #[tracing::instrument(name = "file_servers.upsert", level = "debug", skip(self, server), fields(name = %server.name))]
    fn upsert(&self, server: &FileServer) -> Result<(FileServer, bool)> {
        let name_key = key(&[&server.org_id, &server.name]);

        tokio::task::block_in_place(|| {
            (&self.servers, &self.by_name).transaction(|(servers, by_name)| {
                let (record, created) = match by_name.get(&name_key)? {
                    Some(id) => {
                        let id = String::from_utf8_lossy(&id).to_string();
                        (FileServer { id, ..server.clone() }, false)
                    }
                    None => (server.clone(), true),
                };

                servers.insert(record.id.as_bytes(), abort(encode(&record))?)?;
                by_name.insert(name_key.as_slice(), record.id.as_bytes())?;
                Ok((record, created))
            })
        })
        .map_err(from_tx)
    }

    #[tracing::instrument(name = "file_servers.get", level = "debug", skip(self))]
    fn get(&self, id: &str) -> Result<FileServer> {
        get(&self.servers, id.as_bytes())?
            .ok_or_else(|| RepositoryError::not_found(format!("file server '{}'", id)))
    }

    #[tracing::instrument(name = "file_servers.find", level = "debug", skip(self))]
    fn find(&self, org_id: &str, name: &str) -> Result<FileServer> {
        let id = tokio::task::block_in_place(|| self.by_name.get(key(&[org_id, name])))
            .context(DbSnafu)?
            .ok_or_else(|| RepositoryError::not_found(format!("file server '{}'", name)))?;
        get(&self.servers, &id)?
            .ok_or_else(|| RepositoryError::not_found(format!("file server '{}'", name)))
    }

    #[tracing::instrument(name = "file_servers.list", level = "debug", skip(self))]
    fn list(&self, org_id: Option<&str>) -> Result<Vec<FileServer>> {
        let mut servers: Vec<FileServer> = match org_id {
            None => scan_all(&self.servers)?,
            Some(org_id) => tokio::task::block_in_place(|| {
                let mut out = Vec::new();
                for id in self.by_name.scan_prefix(prefix(&[org_id])).values() {
                    let id = id.context(DbSnafu)?;
                    if let Some(v) = self.servers.get(&id).context(DbSnafu)? {
                        out.push(decode(&v)?);
                    }
                }
                Ok::<_, RepositoryError>(out)
            })?,
        };
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }
}
