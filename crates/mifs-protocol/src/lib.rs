//! Wire contracts shared by the file server and the index server.
//!
//! `is2fs` holds the generated gRPC change feed; the other modules hold the JSON payloads of
//! the HTTP APIs.
pub mod files;
pub mod fileserver;
pub mod index;
pub mod oauth2;

pub mod is2fs {
    tonic::include_proto!("is2fs");
}

/// Metadata key carrying the last emitted checkpoint on a terminated change stream.
pub const CHECKPOINT_METADATA_KEY: &str = "x-mifs-checkpoint";

/// Status message marking a stream termination the caller should resume from.
pub const RESUMABLE_MESSAGE: &str = "resumable";

/// Header carrying the index server session token.
pub const SESSION_HEADER: &str = "x-mifs-is-session-token";
