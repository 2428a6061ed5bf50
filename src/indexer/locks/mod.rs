
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug)]
struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    /// Holders plus waiters, including waiters whose `lock` future is still pending
    users: usize,
}

type LockMap = HashMap<String, LockEntry>;

/// Per-key async mutual exclusion.
///
/// Holders of the same key run one at a time; different keys never wait on each
/// other. Entries are dropped once no holder or waiter remains, including when a
/// waiter's `lock` future is dropped before it acquires the key.
#[derive(Debug, Clone, Default)]
pub struct FileLocks {
    locks: Arc<Mutex<LockMap>>,
}

/// One registered holder or waiter of a key
#[derive(Debug)]
struct KeyUse {
    key: String,
    locks: FileLocks,
}

/// Held while a file is being written or removed
#[derive(Debug)]
pub struct FileLockGuard {
    _guard: OwnedMutexGuard<()>,
    usage: KeyUse,
}

impl FileLocks {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and hold it until the guard is dropped
    #[inline]
    pub async fn lock(&self, key: &str) -> FileLockGuard {
        let (usage, mutex) = {
            let mut locks = self.lock_map();
            let entry = locks.entry(key.to_string()).or_insert_with(|| LockEntry {
                mutex: Arc::default(),
                users: 0,
            });
            entry.users += 1;
            (
                KeyUse {
                    key: key.to_string(),
                    locks: self.clone(),
                },
                Arc::clone(&entry.mutex),
            )
        };

        let guard = mutex.lock_owned().await;
        debug!("Acquired file lock for {}", key);

        FileLockGuard {
            _guard: guard,
            usage,
        }
    }

    /// Number of keys currently held or awaited
    #[inline]
    pub fn active_keys(&self) -> usize {
        self.lock_map().len()
    }

    fn lock_map(&self) -> MutexGuard<'_, LockMap> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for KeyUse {
    #[inline]
    fn drop(&mut self) {
        let mut locks = self.locks.lock_map();
        let idle = locks.get_mut(&self.key).is_some_and(|entry| {
            entry.users = entry.users.saturating_sub(1);
            entry.users == 0
        });
        if idle {
            locks.remove(&self.key);
        }
    }
}

impl FileLockGuard {
    #[inline]
    pub fn key(&self) -> &str {
        &self.usage.key
    }
}
