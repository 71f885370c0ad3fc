use anyhow::Result as AnyResult;

use async_trait::async_trait;

use snafu::ResultExt;

use crate::node::model::Session;

use super::iface::Flush;
use super::util::{decode, encode, get};
use super::{DbSnafu, RepositoryError, Result};

const SESSIONS_TREE: &str = "sessions";

pub trait SessionStore: Flush {
    fn put(&self, session: &Session) -> Result<()>;

    /// Expired sessions read as `NotFound`.
    fn get(&self, token: &str, now: i64) -> Result<Session>;

    fn remove(&self, token: &str) -> Result<()>;

    /// Drops every session expired at `now`, returning how many were dropped.
    fn purge_expired(&self, now: i64) -> Result<usize>;
}

pub struct SledSessionStore {
    sessions: sled::Tree,
}

impl SledSessionStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            sessions: db.open_tree(SESSIONS_TREE).context(DbSnafu)?,
        })
    }
}

#[async_trait]
impl Flush for SledSessionStore {
    async fn flush(&self) -> AnyResult<()> {
        self.sessions.flush_async().await?;
        Ok(())
    }
}

impl SessionStore for SledSessionStore {
    #[tracing::instrument(name = "sessions.put", level = "debug", skip_all)]
    fn put(&self, session: &Session) -> Result<()> {
        let encoded = encode(session)?;
        tokio::task::block_in_place(|| self.sessions.insert(session.token.as_bytes(), encoded))
            .context(DbSnafu)?;
        Ok(())
    }

    #[tracing::instrument(name = "sessions.get", level = "debug", skip_all)]
    fn get(&self, token: &str, now: i64) -> Result<Session> {
        match get::<Session>(&self.sessions, token.as_bytes())? {
            Some(s) if s.expires_at > now => Ok(s),
            _ => Err(RepositoryError::not_found("session")),
        }
    }

    #[tracing::instrument(name = "sessions.remove", level = "debug", skip_all)]
    fn remove(&self, token: &str) -> Result<()> {
        tokio::task::block_in_place(|| self.sessions.remove(token.as_bytes())).context(DbSnafu)?;
        Ok(())
    }

    #[tracing::instrument(name = "sessions.purge_expired", level = "debug", skip(self))]
    fn purge_expired(&self, now: i64) -> Result<usize> {
        tokio::task::block_in_place(|| {
            let mut purged = 0;
            for pair in self.sessions.iter() {
                let (k, v) = pair.context(DbSnafu)?;
                let session: Session = decode(&v)?;
                if session.expires_at <= now {
                    self.sessions.remove(k).context(DbSnafu)?;
                    purged += 1;
                }
            }
            Ok(purged)
        })
    }
}
