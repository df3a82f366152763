use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use dashmap::DashMap;

use vbk_types::content_key::ContentKey;

struct LockEntry {
    /// Holders plus waiters. Only incremented while the map shard is locked.
    waiters: AtomicUsize,
    held: Mutex<bool>,
    released: Condvar,
}

/// Per-content-key mutual exclusion. Entries exist only while some thread
/// holds or waits for the key.
#[derive(Default)]
pub struct ContentLockTable {
    entries: DashMap<ContentKey, Arc<LockEntry>>,
}

impl ContentLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `key` is ours. The returned guard unlocks on drop.
    pub fn lock(&self, key: ContentKey) -> ContentLockGuard<'_> {
        let entry = {
            let slot = self.entries.entry(key).or_insert_with(|| {
                Arc::new(LockEntry {
                    waiters: AtomicUsize::new(0),
                    held: Mutex::new(false),
                    released: Condvar::new(),
                })
            });
            slot.waiters.fetch_add(1, Ordering::AcqRel);
            Arc::clone(slot.value())
        };

        let mut held = entry.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = entry
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
        drop(held);

        ContentLockGuard {
            table: self,
            key,
            entry,
        }
    }

    /// Advisory: whether any thread holds or waits for `key` right now.
    pub fn is_locked(&self, key: &ContentKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn unlock(&self, key: &ContentKey, entry: &LockEntry) {
        *entry.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        entry.released.notify_one();
        entry.waiters.fetch_sub(1, Ordering::AcqRel);
        self.entries
            .remove_if(key, |_, e| e.waiters.load(Ordering::Acquire) == 0);
    }
}

pub struct ContentLockGuard<'a> {
    table: &'a ContentLockTable,
    key: ContentKey,
    entry: Arc<LockEntry>,
}

impl Drop for ContentLockGuard<'_> {
    fn drop(&mut self) {
        self.table.unlock(&self.key, &self.entry);
    }
}
