// Keyed, cancellable delayed tasks
//
// Debounce timers (keyed by direction) and playback watchdogs (keyed by session) share
// this table. Scheduling under an existing key aborts the previous task and installs the
// new one while the table lock is held, so two timers never run for the same key. A task
// that already woke up when it was replaced finds a newer generation in the table and
// does nothing.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

struct TimerEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

struct TimerTable<K> {
    next_generation: u64,
    entries: HashMap<K, TimerEntry>,
}

/// Table of delayed tasks, at most one per key.
///
/// Must be used from within a Tokio runtime.
pub struct KeyedTimers<K> {
    table: Arc<Mutex<TimerTable<K>>>,
}

fn lock_table<K>(table: &Mutex<TimerTable<K>>) -> MutexGuard<'_, TimerTable<K>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K> KeyedTimers<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(TimerTable {
                next_generation: 0,
                entries: HashMap::new(),
            })),
        }
    }

    /// Cancel whatever is scheduled under `key` and schedule `on_fire` after `delay`.
    ///
    /// Returns the generation of the new timer; `on_fire` receives the same value.
    pub fn schedule<F, Fut>(&self, key: K, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut table = lock_table(&self.table);
        table.next_generation += 1;
        let generation = table.next_generation;

        if let Some(previous) = table.entries.remove(&key) {
            previous.handle.abort();
        }

        let weak: Weak<Mutex<TimerTable<K>>> = Arc::downgrade(&self.table);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let still_current = match weak.upgrade() {
                Some(table) => {
                    let mut table = lock_table(&table);
                    match table.entries.get(&task_key) {
                        Some(entry) if entry.generation == generation => {
                            table.entries.remove(&task_key);
                            true
                        }
                        _ => false,
                    }
                }
                None => false,
            };

            if still_current {
                on_fire(generation).await;
            } else {
                crate::audio_debug!("⏱️ Superseded timer {:?} (generation {}) discarded", task_key, generation);
            }
        });

        table.entries.insert(key, TimerEntry { generation, handle });
        generation
    }

    /// Cancel the timer under `key`; returns whether one was pending
    pub fn cancel(&self, key: &K) -> bool {
        let mut table = lock_table(&self.table);
        match table.entries.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let mut table = lock_table(&self.table);
        for (_, entry) in table.entries.drain() {
            entry.handle.abort();
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        lock_table(&self.table).entries.contains_key(key)
    }

    /// Generation of the pending timer under `key`
    pub fn generation(&self, key: &K) -> Option<u64> {
        lock_table(&self.table).entries.get(key).map(|e| e.generation)
    }

    pub fn len(&self) -> usize {
        lock_table(&self.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for KeyedTimers<K>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for KeyedTimers<K> {
    fn drop(&mut self) {
        let mut table = lock_table(&self.table);
        for (_, entry) in table.entries.drain() {
            entry.handle.abort();
        }
    }
}

impl<K> std::fmt::Debug for KeyedTimers<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending = lock_table(&self.table).entries.len();
        f.debug_struct("KeyedTimers").field("pending", &pending).finish()
    }
}
