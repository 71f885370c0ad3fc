use anyhow::Result as AnyResult;

use async_trait::async_trait;

use sled::Transactional;

use snafu::ResultExt;

use crate::node::model::User;

use super::iface::Flush;
use super::util::{abort, decode, encode, from_tx, get};
use super::{DbSnafu, RepositoryError, Result};

const USERS_TREE: &str = "users";
const USERS_BY_EMAIL_TREE: &str = "users_by_email";
const USERS_BY_NAME_TREE: &str = "users_by_name";

pub trait UserStore: Flush {
    /// Fails with `AlreadyExists` if the name or the email is taken.
    fn add(&self, user: &User) -> Result<()>;
    fn get(&self, id: &str) -> Result<User>;
    fn find_by_email(&self, email: &str) -> Result<User>;
    fn find_by_name(&self, name: &str) -> Result<User>;
    fn set_totp_secret(&self, id: &str, secret: Option<Vec<u8>>) -> Result<()>;
}

pub struct SledUserStore {
    users: sled::Tree,
    by_email: sled::Tree,
    by_name: sled::Tree,
}

impl SledUserStore {
    pub fn new(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            users: db.open_tree(USERS_TREE).context(DbSnafu)?,
            by_email: db.open_tree(USERS_BY_EMAIL_TREE).context(DbSnafu)?,
            by_name: db.open_tree(USERS_BY_NAME_TREE).context(DbSnafu)?,
        })
    }

    fn find_by(&self, index: &sled::Tree, value: &str) -> Result<User> {
        let id = tokio::task::block_in_place(|| index.get(value.as_bytes()))
            .context(DbSnafu)?
            .ok_or_else(|| RepositoryError::not_found("user"))?;
        get(&self.users, &id)?.ok_or_else(|| RepositoryError::not_found("user"))
    }
}

#[async_trait]
impl Flush for SledUserStore {
    async fn flush(&self) -> AnyResult<()> {
        self.users.flush_async().await?;
        self.by_email.flush_async().await?;
        self.by_name.flush_async().await?;
        Ok(())
    }
}

impl UserStore for SledUserStore {
    #[tracing::instrument(name = "users.add", level = "debug", skip(self, user), fields(name = %user.name))]
    fn add(&self, user: &User) -> Result<()> {
        let encoded = encode(user)?;
        tokio::task::block_in_place(|| {
            (&self.users, &self.by_email, &self.by_name).transaction(
                |(users, by_email, by_name)| {
                    if by_name.get(user.name.as_bytes())?.is_some() {
                        return abort(Err(RepositoryError::already_exists("user name")));
                    }
                    if by_email.get(user.email.as_bytes())?.is_some() {
                        return abort(Err(RepositoryError::already_exists("email")));
                    }
                    users.insert(user.id.as_bytes(), encoded.as_slice())?;
                    by_email.insert(user.email.as_bytes(), user.id.as_bytes())?;
                    by_name.insert(user.name.as_bytes(), user.id.as_bytes())?;
                    Ok(())
                },
            )
        })
        .map_err(from_tx)
    }

    #[tracing::instrument(name = "users.get", level = "debug", skip(self))]
    fn get(&self, id: &str) -> Result<User> {
        get(&self.users, id.as_bytes())?.ok_or_else(|| RepositoryError::not_found("user"))
    }

    #[tracing::instrument(name = "users.find_by_email", level = "debug", skip(self))]
    fn find_by_email(&self, email: &str) -> Result<User> {
        self.find_by(&self.by_email, email)
    }

    #[tracing::instrument(name = "users.find_by_name", level = "debug", skip(self))]
    fn find_by_name(&self, name: &str) -> Result<User> {
        self.find_by(&self.by_name, name)
    }

    #[tracing::instrument(name = "users.set_totp_secret", level = "debug", skip(self, secret))]
    fn set_totp_secret(&self, id: &str, secret: Option<Vec<u8>>) -> Result<()> {
        tokio::task::block_in_place(|| {
            self.users.transaction(|users| {
                let current = users
                    .get(id.as_bytes())?
                    .ok_or_else(|| RepositoryError::not_found("user"))
                    .and_then(|v| decode::<User>(&v));
                let mut user = abort(current)?;
                user.totp_secret = secret.clone();
                users.insert(id.as_bytes(), abort(encode(&user))?)?;
                Ok(())
            })
        })
        .map_err(from_tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> anyhow::Result<SledUserStore> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(SledUserStore::new(&db)?)
    }

    fn user(id: &str, name: &str, email: &str) -> User {
        User {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            password_hash: "hash".into(),
            totp_secret: None,
        }
    }

    #[test]
    fn names_and_emails_are_unique() -> anyhow::Result<()> {
        let store = store()?;
        store.add(&user("1", "alice", "alice@example.com"))?;

        let dup_name = store.add(&user("2", "alice", "other@example.com"));
        assert!(matches!(dup_name, Err(RepositoryError::AlreadyExists { .. })));

        let dup_email = store.add(&user("3", "bob", "alice@example.com"));
        assert!(matches!(dup_email, Err(RepositoryError::AlreadyExists { .. })));

        assert!(store.find_by_name("bob").unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn lookups() -> anyhow::Result<()> {
        let store = store()?;
        store.add(&user("1", "alice", "alice@example.com"))?;
        assert_eq!(store.find_by_email("alice@example.com")?.id, "1");
        assert_eq!(store.find_by_name("alice")?.email, "alice@example.com");

        store.set_totp_secret("1", Some(vec![1, 2, 3]))?;
        assert_eq!(store.get("1")?.totp_secret, Some(vec![1, 2, 3]));
        Ok(())
    }
}
