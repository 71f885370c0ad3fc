//! Version 1 of the plugin contract.
//!
//! A v1 plugin provides file storage, metadata storage and an authorization store whose
//! operations are raw `u32` bitmasks. This module is frozen: later contract versions get
//! their own module and adapter.
use std::collections::HashMap;
use std::sync::Arc;

pub use crate::node::authz::AuthzError;
pub use crate::node::storage::{
    FileStorage, Filter, Flush, MetadataFields, MetadataStorage, StorageError,
};

pub const API_VERSION: u32 = 1;

pub type Args = HashMap<String, String>;

pub const OP_READ: u32 = 1;
pub const OP_WRITE: u32 = 1 << 1;
pub const OP_CREATE: u32 = 1 << 2;
pub const OP_ADMIN: u32 = 1 << 31;

/// Rejects anything that is not exactly one known operation bit.
pub fn check_op(op: u32) -> Result<u32, AuthzError> {
    match op {
        OP_READ | OP_WRITE | OP_CREATE | OP_ADMIN => Ok(op),
        bits => Err(AuthzError::NoSuchPermission { bits }),
    }
}

pub trait Authorization: Flush + Send + Sync {
    fn can(&self, subject: &str, op: u32, object: &str) -> Result<bool, AuthzError>;
    fn grant(&self, subject: &str, op: u32, object: &str) -> Result<(), AuthzError>;
    fn revoke(&self, subject: &str, op: u32, object: &str) -> Result<(), AuthzError>;
    fn all_for_subject(&self, subject: &str) -> Result<HashMap<String, u32>, AuthzError>;
    fn all_for_object(&self, object: &str) -> Result<HashMap<String, u32>, AuthzError>;
}

/// What a v1 plugin's constructor yields.
pub struct Plugin {
    pub files: Arc<dyn FileStorage>,
    pub metadata: Arc<dyn MetadataStorage>,
    pub authorization: Arc<dyn Authorization>,
}
