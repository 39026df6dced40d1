//! Two-tier "already shown" cache: an in-process map for sub-second races
//! and rapid duplicate firings, backed by the persistent store for
//! cross-restart suppression.
//!
//! Degrades instead of failing: a store error or timeout means the in-process
//! map is used alone. A missed dedup is preferable to a lost notification.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rendezvous_core::clock::Clock;
use rendezvous_core::config::DedupConfig;
use rendezvous_core::dedup_key::{DedupKey, MATCH_KEY_PREFIX, MESSAGE_KEY_PREFIX};
use rendezvous_core::types::EventKind;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::KeyValueStore;

/// One "shown at" record in the in-process map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub key: DedupKey,
    pub kind: EventKind,
    pub last_shown_at_ms: i64,
    /// Process-unique write stamp; a later writer always gets a larger token.
    pub token: u64,
    /// Whether the persistent write for this entry succeeded.
    pub persisted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub persist_failures: u64,
    pub read_failures: u64,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    persist_failures: AtomicU64,
    read_failures: AtomicU64,
}

pub struct DeduplicationCache {
    memory: Mutex<HashMap<DedupKey, CacheEntry>>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    policy: DedupConfig,
    store_timeout: Duration,
    next_token: AtomicU64,
    counters: Counters,
}

impl DeduplicationCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        policy: DedupConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            memory: Mutex::new(HashMap::new()),
            store,
            clock,
            policy,
            store_timeout,
            next_token: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    pub fn policy(&self) -> &DedupConfig {
        &self.policy
    }

    fn memory(&self) -> MutexGuard<'_, HashMap<DedupKey, CacheEntry>> {
        // A panic while holding this lock cannot leave the map half-updated
        // (single insert/remove calls), so recover the guard.
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }

    /// Whether an event with `key` was surfaced recently enough to stay quiet.
    pub async fn should_suppress(&self, key: &DedupKey, kind: EventKind) -> bool {
        let now = self.clock.now_ms();
        let memory_entry = self.memory().get(key).cloned();

        if let Some(entry) = &memory_entry {
            if now - entry.last_shown_at_ms < self.policy.memory_ttl_ms(kind) {
                self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "suppressed by in-process cache");
                return true;
            }
        }

        let Some(persist_ttl) = self.policy.persist_ttl_ms(kind) else {
            return false;
        };

        // The in-process entry stands in for the store when the store could
        // not be written or read.
        let memory_within_long_ttl = |only_unpersisted: bool| {
            memory_entry.as_ref().is_some_and(|e| {
                (!only_unpersisted || !e.persisted) && now - e.last_shown_at_ms < persist_ttl
            })
        };

        match self.bounded(self.store.get(key.as_str())).await {
            Ok(Some(raw)) => match raw.trim().parse::<i64>() {
                Ok(shown_at) if now - shown_at < persist_ttl => {
                    self.counters.persistent_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, shown_at, "suppressed by persistent cache");
                    true
                }
                Ok(_) => memory_within_long_ttl(true),
                Err(e) => {
                    debug!(key = %key, value = %raw, "ignoring unparseable cache value: {e}");
                    memory_within_long_ttl(true)
                }
            },
            Ok(None) => memory_within_long_ttl(true),
            Err(e) => {
                self.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "persistent cache read failed, using in-process cache: {e}");
                memory_within_long_ttl(false)
            }
        }
    }

    /// Record `key` as shown at `now_ms`. The in-process write happens before
    /// any await; the persistent write may fail silently.
    pub async fn mark_shown(&self, key: &DedupKey, kind: EventKind, now_ms: i64) -> CacheEntry {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut entry = CacheEntry {
            key: key.clone(),
            kind,
            last_shown_at_ms: now_ms,
            token,
            persisted: false,
        };
        {
            let mut memory = self.memory();
            self.prune(&mut memory, now_ms);
            memory.insert(key.clone(), entry.clone());
        }

        if self.policy.persist_ttl_ms(kind).is_none() {
            return entry;
        }

        let value = now_ms.to_string();
        match self.bounded(self.store.set(key.as_str(), &value)).await {
            Ok(()) => {
                entry.persisted = true;
                let mut memory = self.memory();
                if let Some(current) = memory.get_mut(key) {
                    if current.token == token {
                        current.persisted = true;
                    }
                }
            }
            Err(e) => {
                self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, "persistent cache write failed, keeping in-process entry: {e}");
            }
        }
        entry
    }

    /// True when no other writer has advanced `entry.key` since `entry` was written.
    pub fn is_latest(&self, entry: &CacheEntry) -> bool {
        self.memory()
            .get(&entry.key)
            .is_some_and(|current| current.token == entry.token)
    }

    /// Drop in-process entries only. Persistent entries are keyed by session
    /// pair and stay valid across restarts of the same session.
    pub fn clear_memory(&self) {
        self.memory().clear();
    }

    /// Drop everything, including persisted dedup keys.
    pub async fn clear(&self) {
        self.clear_memory();
        for prefix in [MATCH_KEY_PREFIX, MESSAGE_KEY_PREFIX] {
            let keys = match self.bounded(self.store.keys_with_prefix(prefix)).await {
                Ok(keys) => keys,
                Err(e) => {
                    warn!(prefix, "failed to list persisted dedup keys: {e}");
                    continue;
                }
            };
            for key in keys {
                if let Err(e) = self.bounded(self.store.remove(&key)).await {
                    warn!(key = %key, "failed to remove persisted dedup key: {e}");
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.memory().values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            persistent_hits: self.counters.persistent_hits.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
            read_failures: self.counters.read_failures.load(Ordering::Relaxed),
        }
    }

    /// Remove entries that can no longer suppress anything.
    fn prune(&self, memory: &mut HashMap<DedupKey, CacheEntry>, now_ms: i64) {
        memory.retain(|_, e| {
            let ttl = self
                .policy
                .memory_ttl_ms(e.kind)
                .max(self.policy.persist_ttl_ms(e.kind).unwrap_or(0));
            now_ms - e.last_shown_at_ms < ttl
        });
    }
}
