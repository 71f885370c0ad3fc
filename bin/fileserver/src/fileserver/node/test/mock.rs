use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;

use async_trait::async_trait;

use mifs_std::time::MonotonicClock;

use crate::node::authz::{Authorization, AuthzError, Operation, GLOBAL_OBJECT};
use crate::node::broker::Broker;
use crate::node::filemanager::FileManager;
use crate::node::plugin::{self, LoadedPlugin};
use crate::node::storage::{DynMetadataStorage, Flush};

/// Permission store whose grants can be made to fail on demand.
#[derive(Default)]
pub struct MockAuthorization {
    masks: Mutex<HashMap<(String, String), u32>>,
    pub fail_grants: AtomicBool,
}

impl MockAuthorization {
    pub fn mask(&self, subject: &str, object: &str) -> u32 {
        let guard = self.masks.lock().unwrap();
        guard
            .get(&(subject.to_string(), object.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Flush for MockAuthorization {
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl Authorization for MockAuthorization {
    fn can(&self, subject: &str, op: Operation, object: &str) -> Result<bool, AuthzError> {
        let guard = self.masks.lock().unwrap();
        let mask = guard
            .get(&(subject.to_string(), object.to_string()))
            .copied()
            .unwrap_or_default();
        Ok(op.is_set(mask))
    }

    fn grant(&self, subject: &str, op: Operation, object: &str) -> Result<(), AuthzError> {
        if self.fail_grants.load(Ordering::SeqCst) {
            return Err(AuthzError::NoSuchPermission { bits: op.bits() });
        }
        let mut guard = self.masks.lock().unwrap();
        *guard
            .entry((subject.to_string(), object.to_string()))
            .or_default() |= op.bits();
        Ok(())
    }

    fn revoke(&self, subject: &str, op: Operation, object: &str) -> Result<(), AuthzError> {
        let mut guard = self.masks.lock().unwrap();
        if let Some(mask) = guard.get_mut(&(subject.to_string(), object.to_string())) {
            *mask &= !op.bits();
        }
        Ok(())
    }

    fn all_for_subject(&self, subject: &str) -> Result<HashMap<String, u32>, AuthzError> {
        let guard = self.masks.lock().unwrap();
        Ok(guard
            .iter()
            .filter(|((s, _), _)| s == subject)
            .map(|((_, o), m)| (o.clone(), *m))
            .collect())
    }

    fn all_for_object(&self, object: &str) -> Result<HashMap<String, u32>, AuthzError> {
        let guard = self.masks.lock().unwrap();
        Ok(guard
            .iter()
            .filter(|((_, o), _)| o == object)
            .map(|((s, _), m)| (s.clone(), *m))
            .collect())
    }
}

pub struct Harness {
    pub manager: FileManager,
    pub authz: Arc<MockAuthorization>,
    pub metadata: DynMetadataStorage,
    pub broker: Broker,
}

/// A file manager over in-memory stores, with `alice` allowed to create files.
pub fn file_manager() -> Harness {
    let memory = plugin::load(None).unwrap();
    let authz = Arc::new(MockAuthorization::default());
    authz.grant("alice", Operation::Create, GLOBAL_OBJECT).unwrap();

    let broker = Broker::new(64);
    let manager = FileManager::new(
        LoadedPlugin {
            files: memory.files,
            metadata: memory.metadata.clone(),
            authorization: authz.clone(),
        },
        broker.clone(),
        Arc::new(MonotonicClock::new()),
    );

    Harness {
        manager,
        authz,
        metadata: memory.metadata,
        broker,
    }
}
