//! Live-query subscriptions for the current session.
//!
//! Each query runs in its own task: normalize the raw document, drop
//! anything outside the freshness grace, drop document ids already forwarded,
//! then hand the event to the router queue tagged with the session epoch
//! captured at `start`.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rendezvous_core::clock::Clock;
use rendezvous_core::config::ListenerConfig;
use rendezvous_core::normalize::{NormalizeError, is_fresh, normalize};
use rendezvous_core::source::{LiveQuery, ScopedEvent};
use rendezvous_core::types::{RawDocument, SessionContext};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SourceError;

/// The document database, reduced to "subscribe to a live query".
#[async_trait]
pub trait DocumentSource: Send + Sync + 'static {
    async fn subscribe(&self, query: LiveQuery) -> Result<Subscription, SourceError>;
}

/// Stream of documents for one live query. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    query: LiveQuery,
    rx: mpsc::Receiver<RawDocument>,
}

impl Subscription {
    pub fn new(query: LiveQuery, rx: mpsc::Receiver<RawDocument>) -> Self {
        Self { query, rx }
    }

    pub fn query(&self) -> &LiveQuery {
        &self.query
    }

    /// Next document, or `None` once the source closed the subscription.
    pub async fn next(&mut self) -> Option<RawDocument> {
        self.rx.recv().await
    }

    /// Next document if one is already buffered.
    pub fn try_next(&mut self) -> Option<RawDocument> {
        self.rx.try_recv().ok()
    }
}

/// Bounded set of recently forwarded document ids. Oldest ids are evicted
/// first.
#[derive(Debug)]
struct SeenIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

struct ActiveListeners {
    epoch: u64,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct ListenerManager {
    source: Arc<dyn DocumentSource>,
    tx: mpsc::Sender<ScopedEvent>,
    clock: Arc<dyn Clock>,
    config: ListenerConfig,
    active: Mutex<Option<ActiveListeners>>,
}

impl ListenerManager {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        tx: mpsc::Sender<ScopedEvent>,
        clock: Arc<dyn Clock>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            source,
            tx,
            clock,
            config,
            active: Mutex::new(None),
        }
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveListeners>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe the session's live queries, tearing down any previous set
    /// first. Returns the number of subscriptions established; a query that
    /// fails to subscribe is logged and skipped.
    pub async fn start(&self, ctx: SessionContext, epoch: u64) -> usize {
        self.stop();

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        for query in LiveQuery::for_session(&ctx) {
            let label = query.label();
            match self.source.subscribe(query).await {
                Ok(subscription) => {
                    let pump = Pump {
                        ctx: ctx.clone(),
                        epoch,
                        tx: self.tx.clone(),
                        clock: Arc::clone(&self.clock),
                        config: self.config.clone(),
                        cancel: cancel.clone(),
                    };
                    tasks.push(tokio::spawn(pump.run(subscription)));
                    debug!(query = label, epoch, "subscription established");
                }
                Err(e) => warn!(query = label, "subscribe failed: {e}"),
            }
        }

        let established = tasks.len();
        let mut active = self.active();
        if let Some(stale) = active.take() {
            // A concurrent start raced us; keep only the newest set.
            stale.cancel.cancel();
            stale.tasks.iter().for_each(JoinHandle::abort);
        }
        *active = Some(ActiveListeners {
            epoch,
            cancel,
            tasks,
        });
        info!(
            session_id = %ctx.session_id,
            epoch,
            subscriptions = established,
            "listeners started"
        );
        established
    }

    /// Cancel every subscription task.
    pub fn stop(&self) {
        if let Some(active) = self.active().take() {
            active.cancel.cancel();
            for task in &active.tasks {
                task.abort();
            }
            info!(epoch = active.epoch, "listeners stopped");
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.active()
            .as_ref()
            .map(|a| a.tasks.iter().filter(|t| !t.is_finished()).count())
            .unwrap_or(0)
    }

    pub fn epoch(&self) -> Option<u64> {
        self.active().as_ref().map(|a| a.epoch)
    }
}

impl Drop for ListenerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Per-subscription forwarding state.
struct Pump {
    ctx: SessionContext,
    epoch: u64,
    tx: mpsc::Sender<ScopedEvent>,
    clock: Arc<dyn Clock>,
    config: ListenerConfig,
    cancel: CancellationToken,
}

impl Pump {
    async fn run(self, mut subscription: Subscription) {
        let label = subscription.query().label();
        let mut seen = SeenIds::new(self.config.seen_ids_capacity);
        loop {
            let doc = tokio::select! {
                doc = subscription.next() => doc,
                _ = self.cancel.cancelled() => break,
            };
            let Some(doc) = doc else {
                debug!(query = label, "subscription closed by source");
                break;
            };
            let Some(event) = self.accept(&doc, &mut seen) else {
                continue;
            };
            let scoped = ScopedEvent {
                epoch: self.epoch,
                event,
            };
            tokio::select! {
                sent = self.tx.send(scoped) => {
                    if sent.is_err() {
                        warn!(query = label, "router queue closed, stopping subscription");
                        break;
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    fn accept(
        &self,
        doc: &RawDocument,
        seen: &mut SeenIds,
    ) -> Option<rendezvous_core::types::NormalizedEvent> {
        let event = match normalize(doc, &self.ctx) {
            Ok(event) => event,
            Err(NormalizeError::SelfAuthored { .. }) => return None,
            Err(e) => {
                warn!(doc_id = %doc.id, "skipping document: {e}");
                return None;
            }
        };
        if !is_fresh(event.created_at(), self.clock.now(), self.config.freshness_grace()) {
            debug!(
                doc_id = %doc.id,
                created_at = %event.created_at(),
                "dropping historical record"
            );
            return None;
        }
        if !seen.insert(&doc.id) {
            debug!(doc_id = %doc.id, "dropping repeat delivery");
            return None;
        }
        Some(event)
    }
}
