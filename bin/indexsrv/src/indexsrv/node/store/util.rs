use serde::de::DeserializeOwned;
use serde::Serialize;

use sled::transaction::{ConflictableTransactionError, TransactionError};

use snafu::ResultExt;

use super::{DbSnafu, EncodingSnafu, RepositoryError, Result};

pub const KEY_SEPARATOR: &str = "::";

/// Joins key parts so that every key of `parts[..n]` shares the prefix `prefix(parts[..n])`.
pub fn key(parts: &[&str]) -> Vec<u8> {
    parts.join(KEY_SEPARATOR).into_bytes()
}

pub fn prefix(parts: &[&str]) -> Vec<u8> {
    let mut k = key(parts);
    k.extend_from_slice(KEY_SEPARATOR.as_bytes());
    k
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).context(EncodingSnafu)
}

pub fn decode<T: DeserializeOwned>(value: &[u8]) -> Result<T> {
    bincode::deserialize(value).context(EncodingSnafu)
}

pub fn get<T: DeserializeOwned>(tree: &sled::Tree, k: &[u8]) -> Result<Option<T>> {
    match tokio::task::block_in_place(|| tree.get(k)).context(DbSnafu)? {
        Some(v) => Ok(Some(decode(&v)?)),
        None => Ok(None),
    }
}

pub fn scan_prefix<T: DeserializeOwned>(tree: &sled::Tree, p: &[u8]) -> Result<Vec<T>> {
    tokio::task::block_in_place(|| {
        tree.scan_prefix(p)
            .values()
            .map(|v| decode(&v.context(DbSnafu)?))
            .collect()
    })
}

pub fn scan_all<T: DeserializeOwned>(tree: &sled::Tree) -> Result<Vec<T>> {
    tokio::task::block_in_place(|| {
        tree.iter()
            .values()
            .map(|v| decode(&v.context(DbSnafu)?))
            .collect()
    })
}

/// Lifts a repository error into a transaction abort.
pub fn abort<T>(r: Result<T>) -> std::result::Result<T, ConflictableTransactionError<RepositoryError>> {
    r.map_err(ConflictableTransactionError::Abort)
}

pub fn from_tx(e: TransactionError<RepositoryError>) -> RepositoryError {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(source) => RepositoryError::Db { source },
    }
}

pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_does_not_match_longer_ids() {
        let p = prefix(&["user-1"]);
        assert!(key(&["user-1", "m1"]).starts_with(&p));
        assert!(!key(&["user-10", "m1"]).starts_with(&p));
    }
}
