//! In-process MIFS deployments for integration tests.
pub mod fixtures;
