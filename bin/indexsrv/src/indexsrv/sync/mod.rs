//! Fan-in of the file server change feeds into the mapping store.
mod conn;
mod engine;
mod errors;
mod worker;

pub use conn::ConnTracker;
pub use engine::SyncEngine;
pub use errors::{MultiSyncError, SyncError};
pub use worker::Shared;
