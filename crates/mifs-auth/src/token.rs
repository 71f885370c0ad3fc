use anyhow::{ensure, Result};

use branca::Branca;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const TOKEN_TTL_SECONDS: u32 = 60 * 60 * 6; // 6 hours.

const KEY_LENGTH: usize = 32;

/// The symmetric key tokens are sealed with, as stored in the router's extension layer.
#[derive(Clone)]
pub struct EncryptionKey {
    pub key: String,
}

fn codec(key: &str) -> Result<Branca> {
    ensure!(
        key.len() == KEY_LENGTH,
        "encryption key must be exactly {} bytes long",
        KEY_LENGTH
    );
    Ok(Branca::new(key.as_bytes())?)
}

/// Generate a signed token from an encryption key and a serializable payload.
///
/// The generated token will be valid for six hours.
///
/// The encryption key *must* be exactly 32 characters long, else an error will be returned.
///
/// # Examples
/// ```
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Caller {
///     user: String,
/// }
///
/// let key = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"; // 32 characters.
/// let token = mifs_auth::make_token(key, Caller { user: "jdoe".into() })?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn make_token<K: AsRef<str>, D: Serialize>(key: K, data: D) -> Result<String> {
    make_token_with_ttl(key, data, TOKEN_TTL_SECONDS)
}

pub fn make_token_with_ttl<K: AsRef<str>, D: Serialize>(
    key: K,
    data: D,
    ttl_seconds: u32,
) -> Result<String> {
    let mut token = codec(key.as_ref())?;
    token
        .set_ttl(ttl_seconds)
        .set_timestamp(chrono::Utc::now().timestamp() as u32);

    let encoded_body = bincode::serialize(&data)?;
    Ok(token.encode(&encoded_body)?)
}

/// Open a token sealed by [`make_token_with_ttl`], rejecting it if older than `ttl_seconds`.
pub fn decode_token<K: AsRef<str>, D: DeserializeOwned>(
    key: K,
    token: &str,
    ttl_seconds: u32,
) -> Result<D> {
    let decoder = codec(key.as_ref())?;
    let decoded = decoder.decode(token, ttl_seconds)?;
    Ok(bincode::deserialize(&decoded)?)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Claims {
        user: String,
    }

    #[test]
    fn token_decodes_with_same_key() -> Result<()> {
        let token = make_token(
            KEY,
            Claims {
                user: "jdoe".into(),
            },
        )?;
        let claims: Claims = decode_token(KEY, &token, TOKEN_TTL_SECONDS)?;
        assert_eq!(claims.user, "jdoe");
        Ok(())
    }

    #[test]
    fn token_rejected_with_other_key() -> Result<()> {
        let token = make_token(
            KEY,
            Claims {
                user: "jdoe".into(),
            },
        )?;
        let other = "fedcba9876543210fedcba9876543210";
        assert!(decode_token::<_, Claims>(other, &token, TOKEN_TTL_SECONDS).is_err());
        Ok(())
    }

    #[test]
    fn short_key_is_rejected() {
        assert!(make_token("short", Claims { user: "x".into() }).is_err());
    }
}
