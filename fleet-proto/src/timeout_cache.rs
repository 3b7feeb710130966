//! Correlation cache - keyed store with wait-with-timeout semantics
//!
//! Bridges a fire-and-forget publish and a logically blocking "send and wait
//! for ack": the waiter calls `pop_wait(id, timeout)`, the inbound handler calls
//! `set(id, ack)`. A sweeper drops entries nobody collected (acks for agents
//! that died before reading them).
//!
//! Wake-up is a broadcast: every `set` and every sweep wakes all waiters, each
//! re-checks its own key. O(waiters) wakeups per `set`, one shared `Notify`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(5);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(120 * 60);

struct Entry<V> {
    value: V,
    inserted: Instant,
}

pub struct CorrelationCache<V> {
    entries: Mutex<HashMap<String, Entry<V>>>,
    notify: Notify,
}

impl<V> Default for CorrelationCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }
}

impl<V: Clone + Send + 'static> CorrelationCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache with a background sweeper already running. The sweeper stops
    /// once the last `Arc` is dropped.
    pub fn with_sweeper(period: Duration, retention: Duration) -> Arc<Self> {
        let cache = Arc::new(Self::new());
        cache.spawn_sweeper(period, retention);
        cache
    }

    /// Stores `value` and wakes every waiter.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let entry = Entry { value, inserted: Instant::now() };
        self.entries.lock().insert(key.into(), entry);
        self.notify.notify_waiters();
    }

    /// Non-blocking lookup, leaves the entry in place.
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().get(key).map(|e| e.value.clone())
    }

    /// Waits until `key` shows up, removes and returns it. `None` once
    /// `timeout` has elapsed.
    pub async fn pop_wait(&self, key: &str, timeout: Duration) -> Option<V> {
        let wait = async {
            loop {
                // register before checking so a set() in between is not lost
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(entry) = self.entries.lock().remove(key) {
                    return entry.value;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    /// Drops entries older than `retention`, then wakes every waiter.
    pub fn sweep(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|key, entry| {
                let keep = now.duration_since(entry.inserted) <= retention;
                if !keep {
                    debug!("correlation key {} expired after {:?}", key, retention);
                }
                keep
            });
            before - entries.len()
        };
        self.notify.notify_waiters();
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration, retention: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep(retention);
                    }
                    None => break,
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_does_not_consume() {
        let cache = CorrelationCache::new();
        cache.set("a", 1u32);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[tokio::test]
    async fn pop_wait_returns_present_entry_immediately() {
        let cache = CorrelationCache::new();
        cache.set("a", "ack".to_string());
        let v = cache.pop_wait("a", Duration::from_millis(10)).await;
        assert_eq!(v.as_deref(), Some("ack"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn set_unblocks_waiter_before_timeout() {
        let cache = Arc::new(CorrelationCache::new());
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let v = cache.pop_wait("X", Duration::from_secs(30)).await;
                (v, started.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        cache.set("X", 7u8);

        let (v, waited) = waiter.await.unwrap();
        assert_eq!(v, Some(7));
        assert!(waited < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_set_does_not_satisfy_waiter() {
        let cache = Arc::new(CorrelationCache::new());
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.pop_wait("X", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cache.set("Y", 1u8);

        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(cache.get("Y"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn many_waiters_each_get_their_own_key() {
        let cache = Arc::new(CorrelationCache::new());
        let mut handles = Vec::new();
        for i in 0..16u32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.pop_wait(&format!("k{}", i), Duration::from_secs(10)).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        for i in (0..16u32).rev() {
            cache.set(format!("k{}", i), i);
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap(), Some(i as u32));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_uncollected_entries() {
        let cache = CorrelationCache::with_sweeper(Duration::from_secs(1), Duration::from_secs(3));
        cache.set("orphan", 1u8);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.get("orphan"), Some(1));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cache.get("orphan"), None);
    }
}
