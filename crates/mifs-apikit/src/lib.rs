//! HTTP plumbing shared by the MIFS daemons.
pub mod middleware;
pub mod payload;
pub mod reject;
pub mod reply;
