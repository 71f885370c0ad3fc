use anyhow::Result as AnyResult;

use async_trait::async_trait;

use snafu::ResultExt;

use crate::node::model::UserAccount;

use super::iface::Flush;
use super::util::{abort, decode, encode, from_tx, get, key, prefix, scan_all, scan_prefix};
use super::{DbSnafu, RepositoryError, Result};

const ACCOUNTS_TREE: &str = "accounts";

pub trait UserAccountStore: Flush {
    /// Inserts or replaces the account linking `account.user_id` to `account.server_id`.
    fn put(&self, account: &UserAccount) -> Result<()>;
    fn get(&self, user_id: &str, server_id: &str) -> Result<UserAccount>;
    fn list_for_user(&self, user_id: &str) -> Result<Vec<UserAccount>>;
    fn list_all(&self) -> Result<Vec<UserAccount>>;
    fn remove(&self, user_id: &str, server_id: &str) -> Result<()>;

    fn update_tokens(
        &self,
        user_id: &str,
        server_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> Result<()>;

    /// Moves the checkpoint forward. A checkpoint lower than the stored one is ignored.
    fn update_checkpoint(&self, user_id: &str, server_id: &str, checkpoint_ns: i64) -> Result<()>;

    fn reset_checkpoint(&self, user_id: &str, server_id: &str) -> Result<()>;
    fn set_needs_relink(&self, user_id: &str, server_id: &str, needs_relink: bool) -> Result<()>;
}

pub struct SledUserAccountStore {
    accounts: sled::Tree,
}

impl SledUserAccountStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            accounts: db.open_tree(ACCOUNTS_TREE).context(DbSnafu)?,
        })
    }

    fn modify<F>(&self, user_id: &str, server_id: &str, f: F) -> Result<()>
    where
        F: Fn(&mut UserAccount),
    {
        let k = key(&[user_id, server_id]);
        tokio::task::block_in_place(|| {
            self.accounts.transaction(|accounts| {
                let current = accounts
                    .get(&k)?
                    .ok_or_else(|| RepositoryError::not_found("account"))
                    .and_then(|v| decode::<UserAccount>(&v));
                let mut account = abort(current)?;
                f(&mut account);
                accounts.insert(k.as_slice(), abort(encode(&account))?)?;
                Ok(())
            })
        })
        .map_err(from_tx)
    }
}

#[async_trait]
impl Flush for SledUserAccountStore {
    async fn flush(&self) -> AnyResult<()> {
        self.accounts.flush_async().await?;
        Ok(())
    }
}

impl UserAccountStore for SledUserAccountStore {
    #[tracing::instrument(name = "accounts.put", level = "debug", skip_all, fields(user = %account.user_id, server = %account.server_id))]
    fn put(&self, account: &UserAccount) -> Result<()> {
        let encoded = encode(account)?;
        tokio::task::block_in_place(|| {
            self.accounts
                .insert(key(&[&account.user_id, &account.server_id]), encoded)
        })
        .context(DbSnafu)?;
        Ok(())
    }

    #[tracing::instrument(name = "accounts.get", level = "debug", skip(self))]
    fn get(&self, user_id: &str, server_id: &str) -> Result<UserAccount> {
        get(&self.accounts, &key(&[user_id, server_id]))?
            .ok_or_else(|| RepositoryError::not_found("account"))
    }

    #[tracing::instrument(name = "accounts.list_for_user", level = "debug", skip(self))]
    fn list_for_user(&self, user_id: &str) -> Result<Vec<UserAccount>> {
        scan_prefix(&self.accounts, &prefix(&[user_id]))
    }

    #[tracing::instrument(name = "accounts.list_all", level = "debug", skip(self))]
    fn list_all(&self) -> Result<Vec<UserAccount>> {
        scan_all(&self.accounts)
    }

    #[tracing::instrument(name = "accounts.remove", level = "debug", skip(self))]
    fn remove(&self, user_id: &str, server_id: &str) -> Result<()> {
        tokio::task::block_in_place(|| self.accounts.remove(key(&[user_id, server_id])))
            .context(DbSnafu)?
            .ok_or_else(|| RepositoryError::not_found("account"))?;
        Ok(())
    }

    #[tracing::instrument(name = "accounts.update_tokens", level = "debug", skip(self, access_token, refresh_token))]
    fn update_tokens(
        &self,
        user_id: &str,
        server_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> Result<()> {
        self.modify(user_id, server_id, |account| {
            account.access_token = access_token.to_string();
            account.refresh_token = refresh_token.to_string();
            account.token_expires_at = expires_at;
            account.needs_relink = false;
        })
    }

    #[tracing::instrument(name = "accounts.update_checkpoint", level = "debug", skip(self))]
    fn update_checkpoint(&self, user_id: &str, server_id: &str, checkpoint_ns: i64) -> Result<()> {
        self.modify(user_id, server_id, |account| {
            account.checkpoint_ns = account.checkpoint_ns.max(checkpoint_ns);
        })
    }

    #[tracing::instrument(name = "accounts.reset_checkpoint", level = "debug", skip(self))]
    fn reset_checkpoint(&self, user_id: &str, server_id: &str) -> Result<()> {
        self.modify(user_id, server_id, |account| account.checkpoint_ns = 0)
    }

    #[tracing::instrument(name = "accounts.set_needs_relink", level = "debug", skip(self))]
    fn set_needs_relink(&self, user_id: &str, server_id: &str, needs_relink: bool) -> Result<()> {
        self.modify(user_id, server_id, |account| {
            account.needs_relink = needs_relink
        })
    }
}
