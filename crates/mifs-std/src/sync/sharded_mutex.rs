use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

// See https://preshing.com/20110504/hash-collision-probabilities/
fn shard_count_for(concurrent_writers: usize, collision_probability: f64) -> usize {
    let p = if collision_probability <= 0.0 {
        f64::EPSILON
    } else {
        collision_probability
    };

    let n = concurrent_writers as f64;
    (((n - 1.0) * n) / (2.0 * p)).ceil().max(1.0) as usize
}

/// A set of async mutexes addressed by key hash.
///
/// Two keys landing in the same shard serialize against each other, so the shard count is sized
/// from the expected number of concurrent writers and an acceptable collision probability.
pub struct ShardedMutex {
    shards: Vec<Mutex<()>>,
}

impl ShardedMutex {
    pub fn new(concurrent_writers: usize, collision_probability: f64) -> Self {
        let count = shard_count_for(concurrent_writers, collision_probability);
        Self {
            shards: (0..count).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_of<H: Hash + ?Sized>(&self, key: &H) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Acquire the lock guarding `key`.
    #[tracing::instrument(level = "trace", skip(self, key))]
    pub async fn lock<H: Hash + ?Sized>(&self, key: &H) -> MutexGuard<'_, ()> {
        let idx = self.shard_of(key);
        self.shards[idx].lock().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn shard_count_basic() {
        assert_eq!(shard_count_for(2, 0.5), 2);
        assert_eq!(shard_count_for(1, 0.0), 1);
    }

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let mutex = Arc::new(ShardedMutex::new(4, 0.1));
        let guard = mutex.lock("file-a").await;

        let cloned = mutex.clone();
        let contender = tokio::spawn(async move {
            let _g = cloned.lock("file-a").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
