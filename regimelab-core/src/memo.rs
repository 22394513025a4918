//! Run-scoped memoization.
//!
//! One interface for every lookup table the regime path keeps between calls
//! (current regime per instrument and day, table snapshots per date). Memos
//! are owned by the engine or table that uses them and can be injected, so
//! tests start from an empty memo and nothing leaks between runs.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

pub trait MemoCache<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;
    fn put(&self, key: K, value: V);
    /// Drop one entry. Returns whether it was present.
    fn invalidate(&self, key: &K) -> bool;
    fn clear(&self);
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `MemoCache` backed by a mutex-guarded `HashMap`.
#[derive(Debug)]
pub struct InMemoryMemo<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> Default for InMemoryMemo<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> InMemoryMemo<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl<K, V> MemoCache<K, V> for InMemoryMemo<K, V>
where
    K: Eq + Hash + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }

    fn put(&self, key: K, value: V) {
        self.lock().insert(key, value);
    }

    fn invalidate(&self, key: &K) -> bool {
        self.lock().remove(key).is_some()
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}
