//! Key-value rendezvous store.
//!
//! Communicator creation and abort fan-out go through an external
//! rendezvous service shared by every rank. The trait is the minimal
//! surface the group needs; `HashStore` is the in-process implementation
//! used by tests and single-machine deployments.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{CommError, Result};

/// Rendezvous store shared by all ranks of a process group.
pub trait Store: Send + Sync {
    /// Publish `value` under `key`, overwriting any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value under `key`, blocking until another rank publishes
    /// it or the store's timeout elapses (`TimedOut`).
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Block until every key in `keys` exists, or `timeout` elapses
    /// (`TimedOut`).
    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()>;
}

/// In-memory store: a mutex-guarded map plus a condvar for waiters.
pub struct HashStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    cv: Condvar,
    get_timeout: Duration,
}

impl HashStore {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a store whose blocking `get` gives up after `get_timeout`.
    pub fn with_timeout(get_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
            get_timeout,
        }
    }

    /// Snapshot of the keys currently present. Test/diagnostic helper.
    pub fn keys(&self) -> Vec<String> {
        match self.lock_entries() {
            Ok(entries) => entries.keys().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn lock_entries(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| CommError::invalid_state("store mutex poisoned"))
    }

    fn wait_for(
        &self,
        keys: &[&str],
        timeout: Duration,
    ) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.lock_entries()?;
        loop {
            if keys.iter().all(|k| entries.contains_key(*k)) {
                return Ok(entries);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CommError::timed_out(timeout));
            }
            let (guard, _) = self
                .cv
                .wait_timeout(entries, deadline - now)
                .map_err(|_| CommError::invalid_state("store mutex poisoned"))?;
            entries = guard;
        }
    }
}

impl Default for HashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self.lock_entries()?;
        entries.insert(key.to_string(), value.to_vec());
        self.cv.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.wait_for(&[key], self.get_timeout)?;
        Ok(entries[key].clone())
    }

    fn wait(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        self.wait_for(keys, timeout)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_set_then_get() {
        let store = HashStore::new();
        store.set("k", b"payload").unwrap();
        assert_eq!(store.get("k").unwrap(), b"payload");
    }

    #[test]
    fn test_get_blocks_until_set() {
        let store = Arc::new(HashStore::new());
        let writer = Arc::clone(&store);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.set("late", b"v").unwrap();
        });
        assert_eq!(store.get("late").unwrap(), b"v");
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out_on_missing_key() {
        let store = HashStore::new();
        let result = store.wait(&["missing"], Duration::from_millis(20));
        assert!(matches!(result, Err(CommError::TimedOut { .. })));
    }

    #[test]
    fn test_wait_on_multiple_keys() {
        let store = Arc::new(HashStore::new());
        store.set("a", &[]).unwrap();
        let writer = Arc::clone(&store);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            writer.set("b", &[]).unwrap();
        });
        store.wait(&["a", "b"], Duration::from_secs(2)).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_get_timeout() {
        let store = HashStore::with_timeout(Duration::from_millis(20));
        assert!(matches!(
            store.get("never"),
            Err(CommError::TimedOut { .. })
        ));
    }
}
