use std::collections::HashMap;
use std::convert::TryInto;

use anyhow::Result;

use async_trait::async_trait;

use snafu::ResultExt;

use crate::node::authz::{AuthzDbSnafu, AuthzError};
use crate::node::plugin::v1::{self, check_op, Flush};

const AUTHZ_TREE: &str = "authz";
const KEY_SEPARATOR: &str = "::";

fn key(subject: &str, object: &str) -> String {
    format!("{}{}{}", subject, KEY_SEPARATOR, object)
}

fn decode_mask(value: &[u8]) -> u32 {
    value
        .try_into()
        .map(u32::from_le_bytes)
        .unwrap_or_else(|_| {
            tracing::warn!(len = value.len(), "ignoring malformed permission mask");
            0
        })
}

/// Permissions keyed by `"<subject>::<object>"`, each value a little-endian u32 mask.
pub struct SledAuthorization {
    tree: sled::Tree,
}

impl SledAuthorization {
    pub fn new(db: &sled::Db) -> Result<Self, sled::Error> {
        Ok(Self {
            tree: db.open_tree(AUTHZ_TREE)?,
        })
    }

    fn mask(&self, subject: &str, object: &str) -> Result<u32, AuthzError> {
        Ok(self
            .tree
            .get(key(subject, object))
            .context(AuthzDbSnafu)?
            .map(|v| decode_mask(&v))
            .unwrap_or_default())
    }
}

#[async_trait]
impl Flush for SledAuthorization {
    async fn flush(&self) -> Result<()> {
        self.tree.flush_async().await?;
        Ok(())
    }
}

impl v1::Authorization for SledAuthorization {
    #[tracing::instrument(name = "authz.can", level = "debug", skip(self))]
    fn can(&self, subject: &str, op: u32, object: &str) -> Result<bool, AuthzError> {
        let op = check_op(op)?;
        Ok(self.mask(subject, object)? & op != 0)
    }

    #[tracing::instrument(name = "authz.grant", level = "debug", skip(self))]
    fn grant(&self, subject: &str, op: u32, object: &str) -> Result<(), AuthzError> {
        let op = check_op(op)?;
        self.tree
            .update_and_fetch(key(subject, object), |old| {
                let mask = old.map(decode_mask).unwrap_or_default() | op;
                Some(mask.to_le_bytes().to_vec())
            })
            .context(AuthzDbSnafu)?;
        Ok(())
    }

    #[tracing::instrument(name = "authz.revoke", level = "debug", skip(self))]
    fn revoke(&self, subject: &str, op: u32, object: &str) -> Result<(), AuthzError> {
        let op = check_op(op)?;
        self.tree
            .update_and_fetch(key(subject, object), |old| {
                let mask = old.map(decode_mask).unwrap_or_default() & (op ^ 0xFFFF_FFFF);
                if mask == 0 {
                    None
                } else {
                    Some(mask.to_le_bytes().to_vec())
                }
            })
            .context(AuthzDbSnafu)?;
        Ok(())
    }

    #[tracing::instrument(name = "authz.all_for_subject", level = "debug", skip(self))]
    fn all_for_subject(&self, subject: &str) -> Result<HashMap<String, u32>, AuthzError> {
        let prefix = format!("{}{}", subject, KEY_SEPARATOR);
        let mut out = HashMap::new();
        for pair in self.tree.scan_prefix(prefix.as_bytes()) {
            let (k, v) = pair.context(AuthzDbSnafu)?;
            let object = String::from_utf8_lossy(&k[prefix.len()..]).to_string();
            out.insert(object, decode_mask(&v));
        }
        Ok(out)
    }

    #[tracing::instrument(name = "authz.all_for_object", level = "debug", skip(self))]
    fn all_for_object(&self, object: &str) -> Result<HashMap<String, u32>, AuthzError> {
        let suffix = format!("{}{}", KEY_SEPARATOR, object);
        let mut out = HashMap::new();
        for pair in self.tree.iter() {
            let (k, v) = pair.context(AuthzDbSnafu)?;
            let k = String::from_utf8_lossy(&k);
            if let Some(subject) = k.strip_suffix(&suffix) {
                out.insert(subject.to_string(), decode_mask(&v));
            }
        }
        Ok(out)
    }
}
