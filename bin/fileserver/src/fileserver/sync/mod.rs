//! The `FileRefSync` change feed served to the index server.
mod feed;
mod service;

pub use service::SyncService;

#[cfg(test)]
mod test;
