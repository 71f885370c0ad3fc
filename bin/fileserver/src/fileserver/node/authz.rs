//! Subject x object permission bitmasks.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use snafu::Snafu;

use super::storage::Flush;

/// Object standing for "any object". `Create` is granted on it.
pub const GLOBAL_OBJECT: &str = "__GLOBAL__";

/// Subject standing for every user.
pub const EVERYONE_SUBJECT: &str = "__EVERYONE__";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AuthzError {
    #[snafu(display("no such permission: {:#x}", bits))]
    NoSuchPermission { bits: u32 },

    #[snafu(display("no such permission: '{}'", name))]
    UnknownOperation { name: String },

    #[snafu(display("authorization store error: {}", source))]
    AuthzDb { source: sled::Error },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    Read = 1,
    Write = 1 << 1,
    Create = 1 << 2,
    Admin = 1 << 31,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Read,
        Operation::Write,
        Operation::Create,
        Operation::Admin,
    ];

    pub fn bits(self) -> u32 {
        self as u32
    }

    /// Accepts exactly one known operation bit.
    pub fn from_bits(bits: u32) -> Result<Self, AuthzError> {
        Operation::ALL
            .into_iter()
            .find(|op| op.bits() == bits)
            .ok_or(AuthzError::NoSuchPermission { bits })
    }

    pub fn is_set(self, mask: u32) -> bool {
        mask & self.bits() != 0
    }
}

impl FromStr for Operation {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Operation::Read),
            "write" => Ok(Operation::Write),
            "create" => Ok(Operation::Create),
            "admin" => Ok(Operation::Admin),
            _ => Err(AuthzError::UnknownOperation { name: s.into() }),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Create => "create",
            Operation::Admin => "admin",
        };
        write!(f, "{}", name)
    }
}

/// Permission store as seen by the file server.
///
/// `can` returns false for unknown tuples. `grant` and `revoke` are idempotent and only touch
/// the bit of the operation they are given.
pub trait Authorization: Flush + Send + Sync {
    fn can(&self, subject: &str, op: Operation, object: &str) -> Result<bool, AuthzError>;
    fn grant(&self, subject: &str, op: Operation, object: &str) -> Result<(), AuthzError>;
    fn revoke(&self, subject: &str, op: Operation, object: &str) -> Result<(), AuthzError>;

    /// Object -> permission mask.
    fn all_for_subject(&self, subject: &str) -> Result<HashMap<String, u32>, AuthzError>;

    /// Subject -> permission mask.
    fn all_for_object(&self, object: &str) -> Result<HashMap<String, u32>, AuthzError>;
}

pub type DynAuthorization = Arc<dyn Authorization>;
