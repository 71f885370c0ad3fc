use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use async_trait::async_trait;

use crate::node::authz::{Authorization, AuthzError, Operation};
use crate::node::storage::Flush;

use super::{v1, LoadedPlugin};

/// Exposes a v1 authorization store through the host's typed operations.
pub struct AuthorizationV1 {
    inner: Arc<dyn v1::Authorization>,
}

#[async_trait]
impl Flush for AuthorizationV1 {
    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}

impl Authorization for AuthorizationV1 {
    fn can(&self, subject: &str, op: Operation, object: &str) -> Result<bool, AuthzError> {
        self.inner.can(subject, op.bits(), object)
    }

    fn grant(&self, subject: &str, op: Operation, object: &str) -> Result<(), AuthzError> {
        self.inner.grant(subject, op.bits(), object)
    }

    fn revoke(&self, subject: &str, op: Operation, object: &str) -> Result<(), AuthzError> {
        self.inner.revoke(subject, op.bits(), object)
    }

    fn all_for_subject(&self, subject: &str) -> Result<HashMap<String, u32>, AuthzError> {
        self.inner.all_for_subject(subject)
    }

    fn all_for_object(&self, object: &str) -> Result<HashMap<String, u32>, AuthzError> {
        self.inner.all_for_object(object)
    }
}

pub fn from_v1(plugin: v1::Plugin) -> LoadedPlugin {
    LoadedPlugin {
        files: plugin.files,
        metadata: plugin.metadata,
        authorization: Arc::new(AuthorizationV1 {
            inner: plugin.authorization,
        }),
    }
}
