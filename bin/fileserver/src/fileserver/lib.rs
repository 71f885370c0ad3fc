pub mod config;
mod daemon;
mod node;
mod server;
mod sync;

pub use crate::config::Config;
pub use daemon::FileServerDaemon as Daemon;
pub use node::{make_node, FileNode};
pub use server::Server;
