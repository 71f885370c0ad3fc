use mifs_std::collections::ConcurrentHashMap;

use protocol::fileserver::SyncErrorEntry;
use protocol::{CHECKPOINT_METADATA_KEY, RESUMABLE_MESSAGE};

use snafu::Snafu;

use tonic::{Code, Status};

#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("file server rejected the access token"))]
    Unauthenticated,

    #[snafu(display("file server denied access"))]
    PermissionDenied,

    #[snafu(display("stream ended, resumable from {:?}", checkpoint))]
    Resumable { checkpoint: Option<i64> },

    #[snafu(display("checkpoint went backwards: received {} after {}", received, expected))]
    InvalidCheckpoint { received: i64, expected: i64 },

    #[snafu(display("transport error: {}", reason))]
    Transport { reason: String },

    #[snafu(display("{}", reason))]
    Internal { reason: String },

    #[snafu(display("the account must be linked again"))]
    NeedsRelink,

    #[snafu(display("cancelled"))]
    Cancelled,
}

impl SyncError {
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        SyncError::Internal {
            reason: e.to_string(),
        }
    }

    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        SyncError::Transport {
            reason: e.to_string(),
        }
    }
}

/// The checkpoint a terminated stream reported, if any.
pub fn status_checkpoint(status: &Status) -> Option<i64> {
    status
        .metadata()
        .get(CHECKPOINT_METADATA_KEY)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

impl From<Status> for SyncError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::Unauthenticated => SyncError::Unauthenticated,
            Code::PermissionDenied => SyncError::PermissionDenied,
            Code::Unavailable if status.message() == RESUMABLE_MESSAGE => SyncError::Resumable {
                checkpoint: status_checkpoint(&status),
            },
            Code::Unavailable | Code::Unknown | Code::Cancelled | Code::DeadlineExceeded => {
                SyncError::Transport {
                    reason: status.message().to_string(),
                }
            }
            _ => SyncError::Internal {
                reason: format!("{:?}: {}", status.code(), status.message()),
            },
        }
    }
}

/// The latest failure of every failing `(organization, server)` pair.
///
/// Failures are never fatal to other workers. They are surfaced through the admin API and the
/// health endpoint.
#[derive(Default)]
pub struct MultiSyncError {
    errors: ConcurrentHashMap<(String, String), String>,
}

impl MultiSyncError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, org_name: &str, server_name: &str, error: &SyncError) {
        let message = error.to_string();
        let previous = self.errors.insert(
            (org_name.to_string(), server_name.to_string()),
            message.clone(),
        );
        if previous.as_ref() != Some(&message) {
            tracing::warn!(org = org_name, server = server_name, error = %message, "sync failing");
        }
    }

    pub fn clear(&self, org_name: &str, server_name: &str) {
        if self
            .errors
            .remove(&(org_name.to_string(), server_name.to_string()))
            .is_some()
        {
            tracing::info!(org = org_name, server = server_name, "sync recovered");
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn entries(&self) -> Vec<SyncErrorEntry> {
        let mut entries: Vec<_> = self
            .errors
            .get_all()
            .into_iter()
            .map(|((org_name, server_name), error)| SyncErrorEntry {
                org_name,
                server_name,
                error,
            })
            .collect();
        entries.sort_by(|a, b| {
            (&a.org_name, &a.server_name).cmp(&(&b.org_name, &b.server_name))
        });
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tonic::metadata::MetadataValue;

    #[test]
    fn resumable_status_carries_its_checkpoint() {
        let mut status = Status::unavailable(RESUMABLE_MESSAGE);
        status
            .metadata_mut()
            .insert(CHECKPOINT_METADATA_KEY, MetadataValue::from(420_i64));

        assert_eq!(
            SyncError::from(status),
            SyncError::Resumable {
                checkpoint: Some(420)
            }
        );
        assert!(matches!(
            SyncError::from(Status::unavailable("connection reset")),
            SyncError::Transport { .. }
        ));
        assert_eq!(
            SyncError::from(Status::unauthenticated("bad token")),
            SyncError::Unauthenticated
        );
    }

    #[test]
    fn errors_are_keyed_per_server() {
        let errors = MultiSyncError::new();
        errors.record("org", "fs-b", &SyncError::NeedsRelink);
        errors.record("org", "fs-a", &SyncError::transport("refused"));
        errors.record("org", "fs-a", &SyncError::transport("timed out"));
        assert_eq!(errors.len(), 2);

        let entries = errors.entries();
        assert_eq!(entries[0].server_name, "fs-a");
        assert_eq!(entries[0].error, "transport error: timed out");

        errors.clear("org", "fs-a");
        errors.clear("org", "fs-b");
        assert!(errors.is_empty());
    }
}
