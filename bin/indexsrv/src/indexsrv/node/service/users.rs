use std::collections::HashSet;

use anyhow::{anyhow, ensure, Context, Result};

use ring::rand::{SecureRandom, SystemRandom};

use snafu::Snafu;

use crate::node::model::{new_id, Session, User};
use crate::node::store::iface::{DynSessionStore, DynUserStore};
use crate::node::store::RepositoryError;

use super::totp;

const SESSION_TOKEN_LEN: usize = 32;
const SALT_LEN: usize = 16;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum UserError {
    #[snafu(display("invalid credentials"))]
    InvalidCredentials,

    #[snafu(display("a one-time password is required"))]
    OtpRequired,

    #[snafu(display("invalid or expired session"))]
    InvalidSession,

    #[snafu(display("{}", reason))]
    InvalidSignup { reason: &'static str },
}

pub struct UserService {
    users: DynUserStore,
    sessions: DynSessionStore,
    session_ttl_seconds: i64,
    admins: HashSet<String>,
    rng: SystemRandom,
}

impl UserService {
    pub fn new(
        users: DynUserStore,
        sessions: DynSessionStore,
        session_ttl_seconds: u64,
        admins: &[String],
    ) -> Self {
        Self {
            users,
            sessions,
            session_ttl_seconds: session_ttl_seconds as i64,
            admins: admins.iter().cloned().collect(),
            rng: SystemRandom::new(),
        }
    }

    fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.rng.fill(&mut buf).map_err(|e| anyhow!("{}", e))?;
        Ok(buf)
    }

    #[tracing::instrument(skip(self, password))]
    pub fn signup(&self, name: &str, email: &str, password: &str) -> Result<String> {
        let invalid = |reason| UserError::InvalidSignup { reason };
        ensure!(!name.is_empty(), invalid("user name cannot be empty"));
        ensure!(email.contains('@'), invalid("invalid email address"));
        ensure!(!password.is_empty(), invalid("password cannot be empty"));

        let salt = self.random_bytes(SALT_LEN)?;
        let password_hash =
            argon2::hash_encoded(password.as_bytes(), &salt, &argon2::Config::default())
                .context("failed to hash password")?;

        let user = User {
            id: new_id(),
            name: name.to_string(),
            email: email.to_string(),
            password_hash,
            totp_secret: None,
        };
        self.users.add(&user)?;

        tracing::info!(id = %user.id, "user signed up");
        Ok(user.id)
    }

    #[tracing::instrument(skip(self, password, otp))]
    pub fn login(&self, email: &str, password: &str, otp: Option<&str>) -> Result<String> {
        let user = match self.users.find_by_email(email) {
            Ok(u) => u,
            Err(e) if e.is_not_found() => return Err(UserError::InvalidCredentials.into()),
            Err(e) => return Err(e.into()),
        };

        if !argon2::verify_encoded(&user.password_hash, password.as_bytes())? {
            return Err(UserError::InvalidCredentials.into());
        }

        if let Some(secret) = &user.totp_secret {
            let otp = otp.ok_or(UserError::OtpRequired)?;
            if !totp::verify(secret, otp, chrono::Utc::now().timestamp()) {
                return Err(UserError::InvalidCredentials.into());
            }
        }

        let token = base64::encode_config(
            self.random_bytes(SESSION_TOKEN_LEN)?,
            base64::URL_SAFE_NO_PAD,
        );
        self.sessions.put(&Session {
            token: token.clone(),
            user_id: user.id.clone(),
            expires_at: chrono::Utc::now().timestamp() + self.session_ttl_seconds,
        })?;

        tracing::debug!(user = %user.name, "session opened");
        Ok(token)
    }

    pub fn logout(&self, token: &str) -> Result<()> {
        self.sessions.remove(token)?;
        Ok(())
    }

    /// Resolves a session token to its user.
    pub fn session_user(&self, token: &str) -> Result<User> {
        let session = match self.sessions.get(token, chrono::Utc::now().timestamp()) {
            Ok(s) => s,
            Err(e) if e.is_not_found() => return Err(UserError::InvalidSession.into()),
            Err(e) => return Err(e.into()),
        };

        match self.users.get(&session.user_id) {
            Ok(u) => Ok(u),
            Err(RepositoryError::NotFound { .. }) => Err(UserError::InvalidSession.into()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, id: &str) -> Result<User> {
        Ok(self.users.get(id)?)
    }

    /// Generates a fresh TOTP secret for the user and returns its provisioning URI.
    ///
    /// Logins require a one-time password from then on.
    #[tracing::instrument(skip(self, user), fields(user = %user.name))]
    pub fn setup_2fa(&self, user: &User) -> Result<String> {
        let secret = totp::generate_secret(&self.rng)?;
        let uri = totp::provisioning_uri(&secret, &user.name)?;
        self.users.set_totp_secret(&user.id, Some(secret))?;
        Ok(uri)
    }

    pub fn is_admin(&self, user: &User) -> bool {
        self.admins.contains(&user.name)
    }

    pub fn purge_expired_sessions(&self) -> Result<usize> {
        Ok(self
            .sessions
            .purge_expired(chrono::Utc::now().timestamp())?)
    }

    pub async fn flush(&self) -> Result<()> {
        self.users.flush().await?;
        self.sessions.flush().await?;
        Ok(())
    }
}
