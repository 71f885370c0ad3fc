//! OAuth2 authorization-code provider (RFC 6749 §4.1 and §6).
//!
//! The index server is the only expected client. Codes live in memory and are single use.
//! Access and refresh tokens are branca tokens sealed with the node encryption key.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use mifs_auth::{FileServerClaims, TokenKind};

use mifs_std::collections::ConcurrentHashMap;

use protocol::oauth2::{
    AuthorizeQuery, TokenRequest, TokenResponse, GRANT_AUTHORIZATION_CODE, GRANT_REFRESH_TOKEN,
    RESPONSE_TYPE_CODE,
};

use reqwest::Url;

use ring::rand::{SecureRandom, SystemRandom};

use snafu::Snafu;

use crate::config::{OAuth2ClientSetting, OAuth2Setting};

const CODE_LENGTH: usize = 32;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum OAuth2Error {
    #[snafu(display("unknown client or bad credentials"))]
    InvalidClient,

    #[snafu(display("invalid grant: {}", reason))]
    InvalidGrant { reason: String },

    #[snafu(display("invalid request: {}", reason))]
    InvalidRequest { reason: String },

    #[snafu(display("unsupported grant type '{}'", grant_type))]
    UnsupportedGrantType { grant_type: String },

    #[snafu(display("{}", message))]
    Internal { message: String },
}

type Result<T, E = OAuth2Error> = std::result::Result<T, E>;

fn internal<E: std::fmt::Display>(e: E) -> OAuth2Error {
    OAuth2Error::Internal {
        message: e.to_string(),
    }
}

fn invalid_grant<S: Into<String>>(reason: S) -> OAuth2Error {
    OAuth2Error::InvalidGrant {
        reason: reason.into(),
    }
}

#[derive(Clone, Debug)]
struct PendingCode {
    user: String,
    client_id: String,
    expires_at: Instant,
}

pub struct OAuth2Provider {
    key: String,
    clients: HashMap<String, OAuth2ClientSetting>,
    codes: ConcurrentHashMap<String, PendingCode>,
    access_ttl: u32,
    refresh_ttl: u32,
    code_ttl: Duration,
    rng: SystemRandom,
}

impl OAuth2Provider {
    pub fn new(key: String, setting: &OAuth2Setting) -> Self {
        Self {
            key,
            clients: setting
                .clients
                .iter()
                .map(|c| (c.client_id.clone(), c.clone()))
                .collect(),
            codes: ConcurrentHashMap::new(),
            access_ttl: setting.access_token_ttl_seconds,
            refresh_ttl: setting.refresh_token_ttl_seconds,
            code_ttl: Duration::from_secs(setting.code_ttl_seconds),
            rng: SystemRandom::new(),
        }
    }

    fn random_code(&self) -> Result<String> {
        let mut buf = [0u8; CODE_LENGTH];
        self.rng.fill(&mut buf).map_err(internal)?;
        Ok(base64::encode_config(buf, base64::URL_SAFE_NO_PAD))
    }

    fn client(&self, client_id: &str, client_secret: &str) -> Result<&OAuth2ClientSetting> {
        let client = self.clients.get(client_id).ok_or(OAuth2Error::InvalidClient)?;
        ring::constant_time::verify_slices_are_equal(
            client.client_secret.as_bytes(),
            client_secret.as_bytes(),
        )
        .map_err(|_| OAuth2Error::InvalidClient)?;
        Ok(client)
    }

    fn issue(&self, user: &str, client_id: &str) -> Result<TokenResponse> {
        let claims = |kind| FileServerClaims {
            user: user.into(),
            client_id: client_id.into(),
            kind,
        };

        let access_token =
            mifs_auth::make_token_with_ttl(&self.key, claims(TokenKind::Access), self.access_ttl)
                .map_err(internal)?;
        let refresh_token = mifs_auth::make_token_with_ttl(
            &self.key,
            claims(TokenKind::Refresh),
            self.refresh_ttl,
        )
        .map_err(internal)?;

        Ok(TokenResponse {
            access_token,
            refresh_token,
            expires_in: self.access_ttl as u64,
            token_type: "Bearer".into(),
        })
    }

    /// Issues a code for `user` and returns the URL to send the user agent back to.
    #[tracing::instrument(skip(self))]
    pub fn authorize(&self, user: &str, query: &AuthorizeQuery) -> Result<String> {
        snafu::ensure!(
            query.response_type == RESPONSE_TYPE_CODE,
            InvalidRequestSnafu {
                reason: format!("unsupported response type '{}'", query.response_type)
            }
        );

        let client = self
            .clients
            .get(&query.client_id)
            .ok_or(OAuth2Error::InvalidClient)?;

        if let Some(redirect_uri) = &query.redirect_uri {
            snafu::ensure!(
                redirect_uri == &client.redirect_uri,
                InvalidRequestSnafu {
                    reason: "redirect_uri does not match the registered one"
                }
            );
        }

        // Expired codes are only ever read to be rejected.
        let now = Instant::now();
        self.codes.retain(|_, c| c.expires_at > now);

        let code = self.random_code()?;
        self.codes.insert(
            code.clone(),
            PendingCode {
                user: user.into(),
                client_id: client.client_id.clone(),
                expires_at: now + self.code_ttl,
            },
        );

        let mut url = Url::parse(&client.redirect_uri).map_err(internal)?;
        url.query_pairs_mut()
            .append_pair("code", &code)
            .append_pair("state", &query.state);

        tracing::debug!(client = %client.client_id, "issued authorization code");
        Ok(url.to_string())
    }

    #[tracing::instrument(skip(self, request), fields(grant_type = %request.grant_type, client = %request.client_id))]
    pub fn token(&self, request: &TokenRequest) -> Result<TokenResponse> {
        let client = self.client(&request.client_id, &request.client_secret)?;

        match request.grant_type.as_str() {
            GRANT_AUTHORIZATION_CODE => {
                let code = request.code.as_deref().ok_or_else(|| OAuth2Error::InvalidRequest {
                    reason: "missing code".into(),
                })?;

                let pending = self
                    .codes
                    .remove(code)
                    .ok_or_else(|| invalid_grant("unknown or already used code"))?;
                snafu::ensure!(
                    pending.expires_at > Instant::now(),
                    InvalidGrantSnafu {
                        reason: "expired code"
                    }
                );
                snafu::ensure!(
                    pending.client_id == client.client_id,
                    InvalidGrantSnafu {
                        reason: "code was issued to another client"
                    }
                );

                self.issue(&pending.user, &client.client_id)
            }
            GRANT_REFRESH_TOKEN => {
                let token = request
                    .refresh_token
                    .as_deref()
                    .ok_or_else(|| OAuth2Error::InvalidRequest {
                        reason: "missing refresh_token".into(),
                    })?;

                let claims: FileServerClaims =
                    mifs_auth::decode_token(&self.key, token, self.refresh_ttl)
                        .map_err(|e| invalid_grant(e.to_string()))?;
                snafu::ensure!(
                    claims.kind == TokenKind::Refresh && claims.client_id == client.client_id,
                    InvalidGrantSnafu {
                        reason: "not a refresh token for this client"
                    }
                );

                self.issue(&claims.user, &client.client_id)
            }
            other => Err(OAuth2Error::UnsupportedGrantType {
                grant_type: other.into(),
            }),
        }
    }

    /// The user an access token was issued to.
    pub fn validate_access_token(&self, token: &str) -> anyhow::Result<String> {
        let claims: FileServerClaims = mifs_auth::decode_token(&self.key, token, self.access_ttl)?;
        anyhow::ensure!(claims.kind == TokenKind::Access, "not an access token");
        Ok(claims.user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn provider() -> OAuth2Provider {
        OAuth2Provider::new(
            KEY.into(),
            &OAuth2Setting {
                clients: vec![OAuth2ClientSetting {
                    client_id: "indexsrv".into(),
                    client_secret: "s3cret".into(),
                    redirect_uri: "https://index.example/accounts/auth_callback".into(),
                }],
                access_token_ttl_seconds: 60,
                refresh_token_ttl_seconds: 600,
                code_ttl_seconds: 60,
            },
        )
    }

    fn authorize_query() -> AuthorizeQuery {
        AuthorizeQuery {
            client_id: "indexsrv".into(),
            state: "st4te".into(),
            response_type: "code".into(),
            redirect_uri: None,
        }
    }

    fn code_from(redirect: &str) -> String {
        let url = Url::parse(redirect).unwrap();
        url.query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.to_string())
            .unwrap()
    }

    fn exchange(code: &str, secret: &str) -> TokenRequest {
        TokenRequest {
            grant_type: GRANT_AUTHORIZATION_CODE.into(),
            code: Some(code.into()),
            client_id: "indexsrv".into(),
            client_secret: secret.into(),
            ..Default::default()
        }
    }

    #[test]
    fn code_flow_issues_tokens_once() {
        let provider = provider();
        let redirect = provider.authorize("alice", &authorize_query()).unwrap();
        assert!(redirect.starts_with("https://index.example/accounts/auth_callback?"));
        assert!(redirect.contains("state=st4te"));

        let code = code_from(&redirect);
        let tokens = provider.token(&exchange(&code, "s3cret")).unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert_eq!(
            provider.validate_access_token(&tokens.access_token).unwrap(),
            "alice"
        );
        assert!(provider.validate_access_token(&tokens.refresh_token).is_err());

        assert!(matches!(
            provider.token(&exchange(&code, "s3cret")),
            Err(OAuth2Error::InvalidGrant { .. })
        ));
    }

    #[test]
    fn bad_secret_is_invalid_client() {
        let provider = provider();
        let code = code_from(&provider.authorize("alice", &authorize_query()).unwrap());
        assert!(matches!(
            provider.token(&exchange(&code, "nope")),
            Err(OAuth2Error::InvalidClient)
        ));
    }

    #[test]
    fn refresh_rotates_tokens() {
        let provider = provider();
        let code = code_from(&provider.authorize("alice", &authorize_query()).unwrap());
        let tokens = provider.token(&exchange(&code, "s3cret")).unwrap();

        let refreshed = provider
            .token(&TokenRequest {
                grant_type: GRANT_REFRESH_TOKEN.into(),
                refresh_token: Some(tokens.refresh_token.clone()),
                client_id: "indexsrv".into(),
                client_secret: "s3cret".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            provider.validate_access_token(&refreshed.access_token).unwrap(),
            "alice"
        );

        // An access token is not accepted as a refresh token.
        let r = provider.token(&TokenRequest {
            grant_type: GRANT_REFRESH_TOKEN.into(),
            refresh_token: Some(tokens.access_token),
            client_id: "indexsrv".into(),
            client_secret: "s3cret".into(),
            ..Default::default()
        });
        assert!(matches!(r, Err(OAuth2Error::InvalidGrant { .. })));
    }

    #[test]
    fn unknown_response_type_is_rejected() {
        let provider = provider();
        let mut query = authorize_query();
        query.response_type = "token".into();
        assert!(matches!(
            provider.authorize("alice", &query),
            Err(OAuth2Error::InvalidRequest { .. })
        ));
    }
}
