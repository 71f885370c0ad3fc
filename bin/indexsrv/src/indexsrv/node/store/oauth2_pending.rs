use anyhow::Result as AnyResult;

use async_trait::async_trait;

use snafu::ResultExt;

use crate::node::model::PendingOAuth2;

use super::iface::Flush;
use super::util::{decode, encode};
use super::{DbSnafu, RepositoryError, Result};

const PENDING_TREE: &str = "oauth2_pending";

/// Authorization requests waiting for their callback, keyed by state.
pub trait PendingOAuth2Store: Flush {
    fn put(&self, pending: &PendingOAuth2) -> Result<()>;

    /// Removes and returns the request for `state`. A state can only be consumed once.
    fn pop(&self, state: &str) -> Result<PendingOAuth2>;

    /// Drops every request created before `cutoff` (unix seconds).
    fn purge_created_before(&self, cutoff: i64) -> Result<usize>;
}

pub struct SledPendingOAuth2Store {
    pending: sled::Tree,
}

impl SledPendingOAuth2Store {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            pending: db.open_tree(PENDING_TREE).context(DbSnafu)?,
        })
    }
}

#[async_trait]
impl Flush for SledPendingOAuth2Store {
    async fn flush(&self) -> AnyResult<()> {
        self.pending.flush_async().await?;
        Ok(())
    }
}

impl PendingOAuth2Store for SledPendingOAuth2Store {
    #[tracing::instrument(name = "oauth2_pending.put", level = "debug", skip_all)]
    fn put(&self, pending: &PendingOAuth2) -> Result<()> {
        let encoded = encode(pending)?;
        tokio::task::block_in_place(|| self.pending.insert(pending.state.as_bytes(), encoded))
            .context(DbSnafu)?;
        Ok(())
    }

    #[tracing::instrument(name = "oauth2_pending.pop", level = "debug", skip_all)]
    fn pop(&self, state: &str) -> Result<PendingOAuth2> {
        let v = tokio::task::block_in_place(|| self.pending.remove(state.as_bytes()))
            .context(DbSnafu)?
            .ok_or_else(|| RepositoryError::not_found("authorization state"))?;
        decode(&v)
    }

    #[tracing::instrument(name = "oauth2_pending.purge", level = "debug", skip(self))]
    fn purge_created_before(&self, cutoff: i64) -> Result<usize> {
        tokio::task::block_in_place(|| {
            let mut purged = 0;
            for pair in self.pending.iter() {
                let (k, v) = pair.context(DbSnafu)?;
                let pending: PendingOAuth2 = decode(&v)?;
                if pending.created_at < cutoff {
                    self.pending.remove(k).context(DbSnafu)?;
                    purged += 1;
                }
            }
            Ok(purged)
        })
    }
}
