use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

/// A `HashMap` behind a `parking_lot::RwLock` that hands out clones instead of references.
#[derive(Debug)]
pub struct ConcurrentHashMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    data: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for ConcurrentHashMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ConcurrentHashMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn get<Q: ?Sized>(&self, k: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.data.read().get(k).cloned()
    }

    pub fn get_all(&self) -> Vec<(K, V)> {
        let guard = self.data.read();
        guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn contains_key<Q: ?Sized>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.data.read().contains_key(k)
    }

    pub fn insert(&self, k: K, v: V) -> Option<V> {
        self.data.write().insert(k, v)
    }

    /// Returns the current value for `k`, inserting the output of `f` first if absent.
    pub fn get_or_insert_with<F: FnOnce() -> V>(&self, k: K, f: F) -> V {
        let mut guard = self.data.write();
        guard.entry(k).or_insert_with(f).clone()
    }

    pub fn remove<Q: ?Sized>(&self, k: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq,
    {
        self.data.write().remove(k)
    }

    /// Drops every entry for which `f` returns false, returning the dropped values.
    pub fn retain<F: FnMut(&K, &V) -> bool>(&self, mut f: F) -> Vec<V> {
        let mut guard = self.data.write();
        let mut dropped = Vec::new();
        guard.retain(|k, v| {
            let keep = f(k, v);
            if !keep {
                dropped.push(v.clone());
            }
            keep
        });
        dropped
    }
}
