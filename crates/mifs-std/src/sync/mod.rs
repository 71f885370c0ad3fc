mod sharded_mutex;

pub use sharded_mutex::ShardedMutex;
