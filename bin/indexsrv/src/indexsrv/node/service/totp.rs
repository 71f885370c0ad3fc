//! Time-based one-time passwords (RFC 6238).
use anyhow::{anyhow, Result};

use data_encoding::BASE32_NOPAD;

use reqwest::Url;

use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};

const ISSUER: &str = "MIFS";
const SECRET_LEN: usize = 20;
const STEP_SECONDS: i64 = 30;
const DIGITS: u32 = 6;

/// How many steps around the current one a code stays valid for.
const SKEW_STEPS: i64 = 1;

pub fn generate_secret(rng: &SystemRandom) -> Result<Vec<u8>> {
    let mut secret = vec![0u8; SECRET_LEN];
    rng.fill(&mut secret).map_err(|e| anyhow!("{}", e))?;
    Ok(secret)
}

fn code_at(secret: &[u8], counter: u64) -> u32 {
    let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret);
    let tag = hmac::sign(&key, &counter.to_be_bytes());
    let digest = tag.as_ref();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    binary % 10u32.pow(DIGITS)
}

pub fn code(secret: &[u8], unix_secs: i64) -> String {
    let counter = (unix_secs / STEP_SECONDS).max(0) as u64;
    format!("{:0width$}", code_at(secret, counter), width = DIGITS as usize)
}

pub fn verify(secret: &[u8], otp: &str, unix_secs: i64) -> bool {
    let otp = otp.trim();
    if otp.len() != DIGITS as usize {
        return false;
    }

    (-SKEW_STEPS..=SKEW_STEPS).any(|skew| code(secret, unix_secs + skew * STEP_SECONDS) == otp)
}

/// The `otpauth://` URI authenticator apps provision from.
pub fn provisioning_uri(secret: &[u8], account: &str) -> Result<String> {
    let mut url = Url::parse(&format!("otpauth://totp/{}:", ISSUER))?;
    url.set_path(&format!("{}:{}", ISSUER, account));
    url.query_pairs_mut()
        .append_pair("secret", &BASE32_NOPAD.encode(secret))
        .append_pair("issuer", ISSUER)
        .append_pair("algorithm", "SHA1")
        .append_pair("digits", &DIGITS.to_string())
        .append_pair("period", &STEP_SECONDS.to_string());
    Ok(url.to_string())
}
