use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use async_trait::async_trait;

use protocol::oauth2::{TokenRequest, TokenResponse};

use crate::node::model::{
    new_id, unassigned_path, ChangeKind, FileServer, Mapping, MappingEdit, MappingQuery,
    Organization, PendingOAuth2, ServerUpdate, Session, User, UserAccount,
};
use crate::node::service::{TokenClient, TokenError};
use crate::node::store::iface::*;
use crate::node::store::{RepositoryError, Result as RepoResult};
use crate::node::{assemble, DynTokenClient, IndexNode, Stores};
use crate::Config;

macro_rules! noop_flush {
    ($($t:ty),*) => {
        $(
            #[async_trait]
            impl Flush for $t {
                async fn flush(&self) -> Result<()> {
                    Ok(())
                }
            }
        )*
    };
}

noop_flush!(
    MockUserStore,
    MockSessionStore,
    MockOrganizationStore,
    MockFileServerStore,
    MockAccountStore,
    MockPendingStore,
    MockMappingStore
);

#[derive(Default)]
pub struct MockUserStore {
    users: Mutex<HashMap<String, User>>,
}

impl UserStore for MockUserStore {
    fn add(&self, user: &User) -> RepoResult<()> {
        let mut guard = self.users.lock().unwrap();
        if guard
            .values()
            .any(|u| u.name == user.name || u.email == user.email)
        {
            return Err(RepositoryError::already_exists("user"));
        }
        guard.insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> RepoResult<User> {
        let guard = self.users.lock().unwrap();
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("user"))
    }

    fn find_by_email(&self, email: &str) -> RepoResult<User> {
        let guard = self.users.lock().unwrap();
        guard
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("user"))
    }

    fn find_by_name(&self, name: &str) -> RepoResult<User> {
        let guard = self.users.lock().unwrap();
        guard
            .values()
            .find(|u| u.name == name)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("user"))
    }

    fn set_totp_secret(&self, id: &str, secret: Option<Vec<u8>>) -> RepoResult<()> {
        let mut guard = self.users.lock().unwrap();
        let user = guard
            .get_mut(id)
            .ok_or_else(|| RepositoryError::not_found("user"))?;
        user.totp_secret = secret;
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSessionStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore for MockSessionStore {
    fn put(&self, session: &Session) -> RepoResult<()> {
        let mut guard = self.sessions.lock().unwrap();
        guard.insert(session.token.clone(), session.clone());
        Ok(())
    }

    fn get(&self, token: &str, now: i64) -> RepoResult<Session> {
        let guard = self.sessions.lock().unwrap();
        guard
            .get(token)
            .filter(|s| s.expires_at > now)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("session"))
    }

    fn remove(&self, token: &str) -> RepoResult<()> {
        self.sessions.lock().unwrap().remove(token);
        Ok(())
    }

    fn purge_expired(&self, now: i64) -> RepoResult<usize> {
        let mut guard = self.sessions.lock().unwrap();
        let before = guard.len();
        guard.retain(|_, s| s.expires_at > now);
        Ok(before - guard.len())
    }
}

#[derive(Default)]
pub struct MockOrganizationStore {
    organizations: Mutex<HashMap<String, Organization>>,
}

impl OrganizationStore for MockOrganizationStore {
    fn add(&self, name: &str) -> RepoResult<Organization> {
        let mut guard = self.organizations.lock().unwrap();
        if guard.values().any(|o| o.name == name) {
            return Err(RepositoryError::already_exists("organization"));
        }
        let org = Organization {
            id: new_id(),
            name: name.into(),
        };
        guard.insert(org.id.clone(), org.clone());
        Ok(org)
    }

    fn get(&self, id: &str) -> RepoResult<Organization> {
        let guard = self.organizations.lock().unwrap();
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("organization"))
    }

    fn find_by_name(&self, name: &str) -> RepoResult<Organization> {
        let guard = self.organizations.lock().unwrap();
        guard
            .values()
            .find(|o| o.name == name)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("organization"))
    }

    fn list(&self) -> RepoResult<Vec<Organization>> {
        let guard = self.organizations.lock().unwrap();
        let mut orgs: Vec<_> = guard.values().cloned().collect();
        orgs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(orgs)
    }
}

#[derive(Default)]
pub struct MockFileServerStore {
    servers: Mutex<HashMap<String, FileServer>>,
}

impl FileServerStore for MockFileServerStore {
    fn upsert(&self, server: &FileServer) -> RepoResult<(FileServer, bool)> {
        let mut guard = self.servers.lock().unwrap();
        let existing = guard
            .values()
            .find(|s| s.org_id == server.org_id && s.name == server.name)
            .map(|s| s.id.clone());

        let (record, created) = match existing {
            Some(id) => (
                FileServer {
                    id,
                    ..server.clone()
                },
                false,
            ),
            None => (server.clone(), true),
        };
        guard.insert(record.id.clone(), record.clone());
        Ok((record, created))
    }

    fn get(&self, id: &str) -> RepoResult<FileServer> {
        let guard = self.servers.lock().unwrap();
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("file server"))
    }

    fn find(&self, org_id: &str, name: &str) -> RepoResult<FileServer> {
        let guard = self.servers.lock().unwrap();
        guard
            .values()
            .find(|s| s.org_id == org_id && s.name == name)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("file server"))
    }

    fn list(&self, org_id: Option<&str>) -> RepoResult<Vec<FileServer>> {
        let guard = self.servers.lock().unwrap();
        let mut servers: Vec<_> = guard
            .values()
            .filter(|s| org_id.map_or(true, |o| s.org_id == o))
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }
}

#[derive(Default)]
pub struct MockAccountStore {
    accounts: Mutex<HashMap<(String, String), UserAccount>>,
}

impl MockAccountStore {
    fn modify<F: FnOnce(&mut UserAccount)>(
        &self,
        user_id: &str,
        server_id: &str,
        f: F,
    ) -> RepoResult<()> {
        let mut guard = self.accounts.lock().unwrap();
        let account = guard
            .get_mut(&(user_id.to_string(), server_id.to_string()))
            .ok_or_else(|| RepositoryError::not_found("account"))?;
        f(account);
        Ok(())
    }
}

impl UserAccountStore for MockAccountStore {
    fn put(&self, account: &UserAccount) -> RepoResult<()> {
        let mut guard = self.accounts.lock().unwrap();
        guard.insert(
            (account.user_id.clone(), account.server_id.clone()),
            account.clone(),
        );
        Ok(())
    }

    fn get(&self, user_id: &str, server_id: &str) -> RepoResult<UserAccount> {
        let guard = self.accounts.lock().unwrap();
        guard
            .get(&(user_id.to_string(), server_id.to_string()))
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("account"))
    }

    fn list_for_user(&self, user_id: &str) -> RepoResult<Vec<UserAccount>> {
        let guard = self.accounts.lock().unwrap();
        Ok(guard
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    fn list_all(&self) -> RepoResult<Vec<UserAccount>> {
        let guard = self.accounts.lock().unwrap();
        Ok(guard.values().cloned().collect())
    }

    fn remove(&self, user_id: &str, server_id: &str) -> RepoResult<()> {
        let mut guard = self.accounts.lock().unwrap();
        guard
            .remove(&(user_id.to_string(), server_id.to_string()))
            .map(|_| ())
            .ok_or_else(|| RepositoryError::not_found("account"))
    }

    fn update_tokens(
        &self,
        user_id: &str,
        server_id: &str,
        access_token: &str,
        refresh_token: &str,
        expires_at: i64,
    ) -> RepoResult<()> {
        self.modify(user_id, server_id, |a| {
            a.access_token = access_token.into();
            a.refresh_token = refresh_token.into();
            a.token_expires_at = expires_at;
            a.needs_relink = false;
        })
    }

    fn update_checkpoint(&self, user_id: &str, server_id: &str, checkpoint_ns: i64) -> RepoResult<()> {
        self.modify(user_id, server_id, |a| {
            a.checkpoint_ns = a.checkpoint_ns.max(checkpoint_ns)
        })
    }

    fn reset_checkpoint(&self, user_id: &str, server_id: &str) -> RepoResult<()> {
        self.modify(user_id, server_id, |a| a.checkpoint_ns = 0)
    }

    fn set_needs_relink(&self, user_id: &str, server_id: &str, needs_relink: bool) -> RepoResult<()> {
        self.modify(user_id, server_id, |a| a.needs_relink = needs_relink)
    }
}

#[derive(Default)]
pub struct MockPendingStore {
    pending: Mutex<HashMap<String, PendingOAuth2>>,
}

impl PendingOAuth2Store for MockPendingStore {
    fn put(&self, pending: &PendingOAuth2) -> RepoResult<()> {
        let mut guard = self.pending.lock().unwrap();
        guard.insert(pending.state.clone(), pending.clone());
        Ok(())
    }

    fn pop(&self, state: &str) -> RepoResult<PendingOAuth2> {
        let mut guard = self.pending.lock().unwrap();
        guard
            .remove(state)
            .ok_or_else(|| RepositoryError::not_found("authorization state"))
    }

    fn purge_created_before(&self, cutoff: i64) -> RepoResult<usize> {
        let mut guard = self.pending.lock().unwrap();
        let before = guard.len();
        guard.retain(|_, p| p.created_at >= cutoff);
        Ok(before - guard.len())
    }
}

#[derive(Default)]
pub struct MockMappingStore {
    mappings: Mutex<HashMap<String, Mapping>>,
}

impl MappingStore for MockMappingStore {
    fn list(&self, user_id: &str, query: &MappingQuery) -> RepoResult<Vec<Mapping>> {
        let guard = self.mappings.lock().unwrap();
        let mut found: Vec<_> = guard
            .values()
            .filter(|m| m.user_id == user_id && query.matches(m))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(found)
    }

    fn get(&self, user_id: &str, id: &str) -> RepoResult<Mapping> {
        let guard = self.mappings.lock().unwrap();
        guard
            .get(id)
            .filter(|m| m.user_id == user_id)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found("mapping"))
    }

    fn add(&self, mapping: &Mapping) -> RepoResult<()> {
        let mut guard = self.mappings.lock().unwrap();
        if guard.values().any(|m| {
            m.user_id == mapping.user_id
                && m.server_id == mapping.server_id
                && m.file_ref == mapping.file_ref
        }) {
            return Err(RepositoryError::already_exists("mapping"));
        }
        guard.insert(mapping.id.clone(), mapping.clone());
        Ok(())
    }

    fn edit(&self, user_id: &str, id: &str, edit: &MappingEdit) -> RepoResult<Mapping> {
        let mut guard = self.mappings.lock().unwrap();
        match guard.get_mut(id) {
            Some(m) if m.user_id == user_id => {
                edit.apply(m);
                Ok(m.clone())
            }
            _ => Err(RepositoryError::not_found("mapping")),
        }
    }

    fn remove(&self, user_id: &str, id: &str) -> RepoResult<()> {
        let mut guard = self.mappings.lock().unwrap();
        match guard.get(id) {
            Some(m) if m.user_id == user_id => {
                guard.remove(id);
                Ok(())
            }
            _ => Err(RepositoryError::not_found("mapping")),
        }
    }

    fn handle_server_updates(
        &self,
        user_id: &str,
        server_id: &str,
        updates: &[ServerUpdate],
    ) -> RepoResult<()> {
        let mut guard = self.mappings.lock().unwrap();
        for update in updates {
            let existing = guard.values_mut().find(|m| {
                m.user_id == user_id && m.server_id == server_id && m.file_ref == update.file_ref
            });
            match existing {
                Some(m) if update.checkpoint < m.updated_ns => {}
                Some(m) => {
                    m.updated_ns = update.checkpoint;
                    m.deleted = update.kind == ChangeKind::Delete;
                    m.size_bytes = update.size_bytes;
                }
                None => {
                    let m = Mapping {
                        id: new_id(),
                        user_id: user_id.into(),
                        server_id: server_id.into(),
                        file_ref: update.file_ref.clone(),
                        path: unassigned_path(server_id, &update.file_ref),
                        patient_id: None,
                        size_bytes: update.size_bytes,
                        deleted: update.kind == ChangeKind::Delete,
                        updated_ns: update.checkpoint,
                    };
                    guard.insert(m.id.clone(), m);
                }
            }
        }
        Ok(())
    }
}

/// Token endpoint that answers from a script, then with fresh tokens once the script runs out.
#[derive(Default)]
pub struct MockTokenClient {
    script: Mutex<VecDeque<Result<TokenResponse, TokenError>>>,
    pub requests: Mutex<Vec<(String, TokenRequest)>>,
}

impl MockTokenClient {
    pub fn push(&self, response: Result<TokenResponse, TokenError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn grants(&self) -> Vec<String> {
        let guard = self.requests.lock().unwrap();
        guard.iter().map(|(_, r)| r.grant_type.clone()).collect()
    }
}

pub fn token_response(access: &str, refresh: &str, expires_in: u64) -> TokenResponse {
    TokenResponse {
        access_token: access.into(),
        refresh_token: refresh.into(),
        expires_in,
        token_type: "Bearer".into(),
    }
}

#[async_trait]
impl TokenClient for MockTokenClient {
    async fn request(
        &self,
        token_url: &str,
        request: &TokenRequest,
    ) -> std::result::Result<TokenResponse, TokenError> {
        self.requests
            .lock()
            .unwrap()
            .push((token_url.to_string(), request.clone()));

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(token_response(&new_id(), &new_id(), 3600)))
    }
}

pub fn stores() -> Stores {
    Stores {
        users: Arc::new(MockUserStore::default()),
        sessions: Arc::new(MockSessionStore::default()),
        organizations: Arc::new(MockOrganizationStore::default()),
        servers: Arc::new(MockFileServerStore::default()),
        accounts: Arc::new(MockAccountStore::default()),
        pending: Arc::new(MockPendingStore::default()),
        mappings: Arc::new(MockMappingStore::default()),
    }
}

pub fn config() -> Result<Config> {
    Config::from_toml_string(
        r#"
        [node]
        public_url = "https://index.example.com/"
        admin_users = ["root"]

        [oauth2]
        client_id = "indexsrv"
        client_secret = "s3cret"

        [sync]
        backoff_base_ms = 20
        backoff_cap_ms = 200
        batch_window_ms = 20
        unary_timeout_seconds = 1
        cancel_grace_ms = 500
        "#,
    )
}

/// A node over in-memory stores, with the token endpoint replaced by `tokens`.
pub fn node(tokens: Arc<MockTokenClient>) -> Result<IndexNode> {
    let tokens: DynTokenClient = tokens;
    assemble(&config()?, stores(), tokens)
}
