//! Delayed local notifications that back up the managed push transport.
//!
//! A fallback fires after a short head start unless cancelled first. Entries
//! whose cancellation never arrives are swept after a staleness window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rendezvous_core::clock::Clock;
use rendezvous_core::config::FallbackConfig;
use rendezvous_core::types::{EventKind, NormalizedEvent};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content;
use crate::host::{LocalNotification, LocalNotifier};

pub type FallbackId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledFallback {
    pub id: FallbackId,
    pub event_id: String,
    pub kind: EventKind,
    pub scheduled_at_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub fired: u64,
    pub cancelled: u64,
    pub swept: u64,
    pub delivery_failures: u64,
}

struct Slot {
    fallback: ScheduledFallback,
    timer: JoinHandle<()>,
}

type SlotKey = (EventKind, String);

struct Inner {
    registry: Mutex<HashMap<SlotKey, Slot>>,
    notifier: Arc<dyn LocalNotifier>,
    clock: Arc<dyn Clock>,
    config: FallbackConfig,
    next_id: AtomicU64,
    cancel: CancellationToken,
    scheduled: AtomicU64,
    fired: AtomicU64,
    cancelled: AtomicU64,
    swept: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Cloneable handle; clones share one registry.
#[derive(Clone)]
pub struct FallbackScheduler {
    inner: Arc<Inner>,
}

impl FallbackScheduler {
    pub fn new(
        notifier: Arc<dyn LocalNotifier>,
        clock: Arc<dyn Clock>,
        config: FallbackConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(HashMap::new()),
                notifier,
                clock,
                config,
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                scheduled: AtomicU64::new(0),
                fired: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                swept: AtomicU64::new(0),
                delivery_failures: AtomicU64::new(0),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<SlotKey, Slot>> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm a local notification for `event`. Re-arming the same event
    /// replaces the previous timer.
    pub fn schedule_fallback(&self, event: &NormalizedEvent) -> FallbackId {
        let id = format!(
            "fallback-{}",
            self.inner.next_id.fetch_add(1, Ordering::Relaxed)
        );
        if self.inner.cancel.is_cancelled() {
            warn!(event_id = %event.id(), "scheduler stopped, fallback not armed");
            return id;
        }

        let text = content::local(event);
        let notification = LocalNotification {
            fallback_id: id.clone(),
            event_id: event.id().to_string(),
            kind: event.kind(),
            title: text.title,
            body: text.body,
            participant_id: event.other_session_id().to_string(),
        };
        let fallback = ScheduledFallback {
            id: id.clone(),
            event_id: event.id().to_string(),
            kind: event.kind(),
            scheduled_at_ms: self.inner.clock.now_ms(),
        };
        let key: SlotKey = (event.kind(), event.id().to_string());

        // Hold the registry while spawning so the timer cannot observe the
        // registry before its own slot is inserted.
        let mut registry = self.registry();
        let timer = tokio::spawn(Self::fire_after_delay(
            Arc::clone(&self.inner),
            key.clone(),
            notification,
        ));
        if let Some(previous) = registry.insert(key, Slot { fallback, timer }) {
            previous.timer.abort();
            debug!(replaced = %previous.fallback.id, "fallback re-armed");
        }
        drop(registry);

        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
        debug!(fallback_id = %id, event_id = %event.id(), "fallback armed");
        id
    }

    async fn fire_after_delay(inner: Arc<Inner>, key: SlotKey, notification: LocalNotification) {
        tokio::select! {
            _ = tokio::time::sleep(inner.config.delay()) => {}
            _ = inner.cancel.cancelled() => return,
        }

        let still_armed = {
            let mut registry = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
            match registry.get(&key) {
                Some(slot) if slot.fallback.id == notification.fallback_id => {
                    registry.remove(&key);
                    true
                }
                _ => false,
            }
        };
        if !still_armed {
            return;
        }

        match inner.notifier.deliver(&notification) {
            Ok(()) => {
                inner.fired.fetch_add(1, Ordering::Relaxed);
                info!(
                    fallback_id = %notification.fallback_id,
                    event_id = %notification.event_id,
                    "fallback notification delivered"
                );
            }
            Err(e) => {
                inner.delivery_failures.fetch_add(1, Ordering::Relaxed);
                warn!(fallback_id = %notification.fallback_id, "fallback delivery failed: {e}");
            }
        }
    }

    /// Cancel pending fallbacks for `event_id`, for one kind or all kinds.
    /// Best-effort: a timer that is already delivering is not recalled.
    pub fn cancel_fallback(&self, event_id: &str, kind: Option<EventKind>) -> usize {
        let removed: Vec<Slot> = {
            let mut registry = self.registry();
            let keys: Vec<SlotKey> = registry
                .keys()
                .filter(|(k, id)| id == event_id && kind.is_none_or(|want| want == *k))
                .cloned()
                .collect();
            keys.iter().filter_map(|k| registry.remove(k)).collect()
        };
        for slot in &removed {
            slot.timer.abort();
            debug!(fallback_id = %slot.fallback.id, "fallback cancelled");
        }
        self.inner
            .cancelled
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed.len()
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Slot> = self.registry().drain().map(|(_, slot)| slot).collect();
        for slot in &drained {
            slot.timer.abort();
        }
        self.inner
            .cancelled
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained.len()
    }

    /// Cancel entries older than the staleness window.
    pub fn sweep(&self) -> usize {
        let now = self.inner.clock.now_ms();
        let stale_after = self.inner.config.stale_after_ms as i64;
        let stale: Vec<Slot> = {
            let mut registry = self.registry();
            let keys: Vec<SlotKey> = registry
                .iter()
                .filter(|(_, slot)| now - slot.fallback.scheduled_at_ms > stale_after)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| registry.remove(k)).collect()
        };
        for slot in &stale {
            slot.timer.abort();
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "swept stale fallbacks");
        }
        self.inner
            .swept
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        stale.len()
    }

    /// Periodic sweep loop. Runs until [`stop`](Self::stop).
    pub async fn run_sweeper(&self) {
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                _ = self.inner.cancel.cancelled() => {
                    debug!("fallback sweeper stopped");
                    break;
                }
            }
        }
    }

    /// Release every timer and refuse new work.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        let released = self.cancel_all();
        info!(released, "fallback scheduler stopped");
    }

    pub fn outstanding(&self) -> usize {
        self.registry().len()
    }

    pub fn pending(&self) -> Vec<ScheduledFallback> {
        let mut pending: Vec<ScheduledFallback> = self
            .registry()
            .values()
            .map(|slot| slot.fallback.clone())
            .collect();
        pending.sort_by(|a, b| a.scheduled_at_ms.cmp(&b.scheduled_at_ms));
        pending
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            scheduled: self.inner.scheduled.load(Ordering::Relaxed),
            fired: self.inner.fired.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
            swept: self.inner.swept.load(Ordering::Relaxed),
            delivery_failures: self.inner.delivery_failures.load(Ordering::Relaxed),
        }
    }
}
