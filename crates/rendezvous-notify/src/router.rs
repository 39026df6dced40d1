//! Notification router: decides, for every normalized event, whether to stay
//! quiet, render in-app, or arm a local fallback.
//!
//! Per event the pipeline is mute check → session → dedup check → mark shown
//! → race re-check → session re-check → present. Every terminal outcome is
//! broadcast as a [`RouterNotification`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rendezvous_core::clock::Clock;
use rendezvous_core::config::RouterConfig;
use rendezvous_core::dedup_key::key_for;
use rendezvous_core::source::ScopedEvent;
use rendezvous_core::types::{EventKind, NormalizedEvent, SessionContext};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::content;
use crate::dedup::DeduplicationCache;
use crate::host::{
    HostBindings, MuteFilter, PressAction, PushMessage, PushTransport, RenderRequest, RenderStyle,
};
use crate::scheduler::FallbackScheduler;
use crate::session::SessionHandle;

/// Capacity of the outcome broadcast channel.
const NOTIFY_CAPACITY: usize = 256;

/// Terminal state of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Held until the host UI is bound.
    Queued,
    Muted,
    Deduplicated,
    /// Another concurrent call for the same key won the race.
    RaceLost,
    Rendered,
    FallbackArmed,
    /// The session changed while the event was in flight.
    Stale,
    RenderFailed,
    /// No session context arrived within the retry budget.
    Dropped,
}

impl Disposition {
    /// Whether the user saw (or will see) something for this event.
    pub fn is_presented(self) -> bool {
        matches!(self, Disposition::Rendered | Disposition::FallbackArmed)
    }
}

/// Outcome broadcast for observers (recorder, tests, CLI).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterNotification {
    pub event_id: String,
    pub kind: EventKind,
    pub disposition: Disposition,
    pub at: DateTime<Utc>,
}

/// Collaborators the router is built from.
pub struct RouterDeps {
    pub cache: Arc<DeduplicationCache>,
    pub scheduler: FallbackScheduler,
    pub session: SessionHandle,
    pub clock: Arc<dyn Clock>,
    pub mute: Arc<dyn MuteFilter>,
    pub push: Option<Arc<dyn PushTransport>>,
    pub config: RouterConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    /// Host bound; replaying events queued before `init`.
    Draining,
    Ready,
}

struct Gate {
    lifecycle: Lifecycle,
    host: Option<HostBindings>,
    pending: VecDeque<ScopedEvent>,
}

struct Inner {
    gate: Mutex<Gate>,
    cache: Arc<DeduplicationCache>,
    scheduler: FallbackScheduler,
    session: SessionHandle,
    clock: Arc<dyn Clock>,
    mute: Arc<dyn MuteFilter>,
    push: Option<Arc<dyn PushTransport>>,
    config: RouterConfig,
    notify_tx: broadcast::Sender<RouterNotification>,
    cancel: CancellationToken,
}

/// Cloneable handle; clones drive the same router.
#[derive(Clone)]
pub struct NotificationRouter {
    inner: Arc<Inner>,
}

impl NotificationRouter {
    pub fn new(deps: RouterDeps) -> Self {
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(Gate {
                    lifecycle: Lifecycle::Uninitialized,
                    host: None,
                    pending: VecDeque::new(),
                }),
                cache: deps.cache,
                scheduler: deps.scheduler,
                session: deps.session,
                clock: deps.clock,
                mute: deps.mute,
                push: deps.push,
                config: deps.config,
                notify_tx,
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.inner.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterNotification> {
        self.inner.notify_tx.subscribe()
    }

    pub fn cache(&self) -> &Arc<DeduplicationCache> {
        &self.inner.cache
    }

    pub fn scheduler(&self) -> &FallbackScheduler {
        &self.inner.scheduler
    }

    pub fn is_initialized(&self) -> bool {
        self.gate().host.is_some()
    }

    /// Events waiting for `init` or for the replay to reach them.
    pub fn pending_len(&self) -> usize {
        self.gate().pending.len()
    }

    /// Bind the host UI and start replaying queued events. A second call is
    /// ignored and returns `false`.
    pub fn init(&self, host: HostBindings) -> bool {
        let queued = {
            let mut gate = self.gate();
            if gate.host.is_some() {
                warn!("router already initialized, ignoring init");
                return false;
            }
            gate.host = Some(host);
            gate.lifecycle = if gate.pending.is_empty() {
                Lifecycle::Ready
            } else {
                Lifecycle::Draining
            };
            gate.pending.len()
        };
        info!(queued, "router initialized");
        if queued > 0 {
            let router = self.clone();
            tokio::spawn(async move { router.drain().await });
        }
        true
    }

    /// Replay queued events in arrival order, spaced out. Events queued while
    /// this runs are picked up before the router turns ready.
    async fn drain(&self) {
        let mut replayed = 0usize;
        loop {
            let next = {
                let mut gate = self.gate();
                match gate.pending.pop_front() {
                    Some(scoped) => gate.host.clone().map(|host| (scoped, host)),
                    None => {
                        gate.lifecycle = Lifecycle::Ready;
                        None
                    }
                }
            };
            let Some((scoped, host)) = next else {
                break;
            };

            if replayed > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.inner.config.replay_spacing()) => {}
                    _ = self.inner.cancel.cancelled() => return,
                }
            }
            self.process(scoped, &host).await;
            replayed += 1;
        }
        if replayed > 0 {
            debug!(replayed, "queued events replayed");
        }
    }

    /// Route one event. Never fails; the outcome is returned and broadcast.
    pub async fn handle_incoming(&self, scoped: ScopedEvent) -> Disposition {
        let host = {
            let mut gate = self.gate();
            match (gate.lifecycle, gate.host.clone()) {
                (Lifecycle::Ready, Some(host)) => host,
                _ => {
                    debug!(event_id = %scoped.event.id(), "router not ready, queueing event");
                    let (id, kind) = (scoped.event.id().to_string(), scoped.event.kind());
                    gate.pending.push_back(scoped);
                    drop(gate);
                    self.announce(id, kind, Disposition::Queued);
                    return Disposition::Queued;
                }
            }
        };
        self.process(scoped, &host).await
    }

    /// Route an event that carries no session epoch. It is bound to the
    /// session current once one is available.
    pub async fn handle_event(&self, event: NormalizedEvent) -> Disposition {
        match self.await_session().await {
            Some((_, epoch)) => self.handle_incoming(ScopedEvent { epoch, event }).await,
            None => self.finish(&event, Disposition::Dropped),
        }
    }

    /// Consume the listener queue until it closes or the router is shut down.
    pub async fn run(&self, mut rx: mpsc::Receiver<ScopedEvent>) {
        info!("router: event loop started");
        loop {
            tokio::select! {
                scoped = rx.recv() => {
                    match scoped {
                        Some(scoped) => {
                            self.handle_incoming(scoped).await;
                        }
                        None => {
                            info!("router: queue closed, shutting down");
                            break;
                        }
                    }
                }
                _ = self.inner.cancel.cancelled() => {
                    info!("router: cancellation requested, shutting down");
                    break;
                }
            }
        }
    }

    /// The client observed the notification itself; drop its pending fallback.
    pub fn confirm_delivered(&self, event_id: &str, kind: EventKind) -> usize {
        self.inner.scheduler.cancel_fallback(event_id, Some(kind))
    }

    /// Forget everything tied to the previous session: queued events, the
    /// dedup cache (persisted keys too when `full`), and pending fallbacks.
    pub async fn reset_for_session(&self, full: bool) {
        let discarded: Vec<ScopedEvent> = self.gate().pending.drain(..).collect();
        for scoped in &discarded {
            self.announce(
                scoped.event.id().to_string(),
                scoped.event.kind(),
                Disposition::Stale,
            );
        }
        if full {
            self.inner.cache.clear().await;
        } else {
            self.inner.cache.clear_memory();
        }
        let cancelled = self.inner.scheduler.cancel_all();
        info!(
            discarded = discarded.len(),
            cancelled_fallbacks = cancelled,
            full,
            "router reset for session change"
        );
    }

    /// Stop the event loop and any replay in progress.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    async fn process(&self, scoped: ScopedEvent, host: &HostBindings) -> Disposition {
        let ScopedEvent { epoch, event } = scoped;
        if !self.inner.session.is_current(epoch) {
            return self.finish(&event, Disposition::Stale);
        }

        if let NormalizedEvent::Message {
            sender_session_id, ..
        } = &event
        {
            match self.inner.mute.is_muted(sender_session_id).await {
                Ok(true) => return self.finish(&event, Disposition::Muted),
                Ok(false) => {}
                Err(e) => warn!(event_id = %event.id(), "{e}, delivering anyway"),
            }
        }

        let Some((ctx, current_epoch)) = self.await_session().await else {
            return self.finish(&event, Disposition::Dropped);
        };
        if current_epoch != epoch {
            return self.finish(&event, Disposition::Stale);
        }

        let key = key_for(&event, &ctx.session_id);
        let kind = event.kind();
        if self.inner.cache.should_suppress(&key, kind).await {
            return self.finish(&event, Disposition::Deduplicated);
        }

        let entry = self
            .inner
            .cache
            .mark_shown(&key, kind, self.inner.clock.now_ms())
            .await;
        tokio::time::sleep(self.inner.cache.policy().race_recheck()).await;
        if !self.inner.cache.is_latest(&entry) {
            return self.finish(&event, Disposition::RaceLost);
        }
        if !self.inner.session.is_current(epoch) {
            return self.finish(&event, Disposition::Stale);
        }

        let disposition = self.present(&event, &ctx, host);
        self.finish(&event, disposition)
    }

    fn present(
        &self,
        event: &NormalizedEvent,
        ctx: &SessionContext,
        host: &HostBindings,
    ) -> Disposition {
        let participant_id = event.other_session_id().to_string();
        let result = match event {
            NormalizedEvent::Match {
                is_initiator: true,
                counterpart_display_name,
                ..
            } => {
                self.push_to_counterpart(event, ctx);
                match &host.match_modal {
                    Some(modal) => modal.show_match(counterpart_display_name, &participant_id),
                    None => {
                        let text = content::match_alert(counterpart_display_name);
                        host.renderer.render(RenderRequest {
                            style: RenderStyle::MatchAlert,
                            title: text.title,
                            body: text.body,
                            on_press: PressAction::open_conversation(
                                Arc::clone(&host.navigator),
                                participant_id.clone(),
                            ),
                            participant_id,
                        })
                    }
                }
            }
            _ if host.presence.is_foreground() => {
                let text = content::toast(event);
                host.renderer.render(RenderRequest {
                    style: RenderStyle::Toast,
                    title: text.title,
                    body: text.body,
                    on_press: PressAction::open_conversation(
                        Arc::clone(&host.navigator),
                        participant_id.clone(),
                    ),
                    participant_id,
                })
            }
            _ => {
                self.inner.scheduler.schedule_fallback(event);
                return Disposition::FallbackArmed;
            }
        };

        match result {
            Ok(()) => Disposition::Rendered,
            Err(e) => {
                warn!(event_id = %event.id(), "render failed: {e}");
                Disposition::RenderFailed
            }
        }
    }

    /// Fire-and-forget push so the counterpart hears about the match even
    /// with the app closed.
    fn push_to_counterpart(&self, event: &NormalizedEvent, ctx: &SessionContext) {
        let Some(push) = self.inner.push.clone() else {
            return;
        };
        let target = event.other_session_id().to_string();
        let message = PushMessage {
            title: "It's a match!".into(),
            body: "Someone you liked liked you back.".into(),
            payload: serde_json::json!({
                "type": "match",
                "match_id": event.id(),
                "initiator_session_id": ctx.session_id,
                "event_id": ctx.event_id,
            }),
        };
        tokio::spawn(async move {
            if let Err(e) = push.send(&target, message).await {
                warn!(target = %target, "push send failed: {e}");
            }
        });
    }

    /// Current session context, waiting a bounded number of retries for one
    /// to appear.
    async fn await_session(&self) -> Option<(SessionContext, u64)> {
        let mut attempts = 0u32;
        loop {
            if let (Some(ctx), epoch) = self.inner.session.snapshot() {
                return Some((ctx, epoch));
            }
            if attempts >= self.inner.config.session_retry_budget {
                warn!(attempts, "no session context, giving up on event");
                return None;
            }
            attempts += 1;
            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.session_retry_interval()) => {}
                _ = self.inner.cancel.cancelled() => return None,
            }
        }
    }

    fn finish(&self, event: &NormalizedEvent, disposition: Disposition) -> Disposition {
        match disposition {
            d if d.is_presented() => info!(
                event_id = %event.id(),
                kind = ?event.kind(),
                from = %event.other_display_name(),
                disposition = ?disposition,
                "event presented"
            ),
            _ => debug!(
                event_id = %event.id(),
                kind = ?event.kind(),
                disposition = ?disposition,
                "event not presented"
            ),
        }
        self.announce(event.id().to_string(), event.kind(), disposition);
        disposition
    }

    fn announce(&self, event_id: String, kind: EventKind, disposition: Disposition) {
        // No subscribers is fine.
        let _ = self.inner.notify_tx.send(RouterNotification {
            event_id,
            kind,
            disposition,
            at: self.inner.clock.now(),
        });
    }
}
