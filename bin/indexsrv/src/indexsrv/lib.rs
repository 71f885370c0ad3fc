pub mod config;
mod daemon;
mod node;
mod server;
mod sync;

pub use crate::config::Config;
pub use daemon::IndexServerDaemon as Daemon;
pub use node::{make_node, IndexNode};
pub use server::Server;
