//! The single owner of the router, scheduler, listeners and session state.

use std::sync::{Arc, Mutex};

use rendezvous_core::clock::Clock;
use rendezvous_core::config::NotifyConfig;
use rendezvous_core::types::SessionContext;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::dedup::DeduplicationCache;
use crate::host::{HostBindings, LocalNotifier, MuteFilter, NoMutes, PushTransport};
use crate::listener::{DocumentSource, ListenerManager};
use crate::router::{NotificationRouter, RouterDeps};
use crate::scheduler::FallbackScheduler;
use crate::session::SessionHandle;
use crate::store::KeyValueStore;

/// External collaborators the service is assembled from.
pub struct ServiceDeps {
    pub store: Arc<dyn KeyValueStore>,
    pub source: Arc<dyn DocumentSource>,
    pub notifier: Arc<dyn LocalNotifier>,
    pub clock: Arc<dyn Clock>,
    pub mute: Arc<dyn MuteFilter>,
    pub push: Option<Arc<dyn PushTransport>>,
}

impl ServiceDeps {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        source: Arc<dyn DocumentSource>,
        notifier: Arc<dyn LocalNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            source,
            notifier,
            clock,
            mute: Arc::new(NoMutes),
            push: None,
        }
    }

    pub fn with_mute_filter(mut self, mute: Arc<dyn MuteFilter>) -> Self {
        self.mute = mute;
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushTransport>) -> Self {
        self.push = Some(push);
        self
    }
}

pub struct NotificationService {
    router: NotificationRouter,
    scheduler: FallbackScheduler,
    listeners: ListenerManager,
    session: SessionHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NotificationService {
    /// Assemble the engine and spawn its router loop and fallback sweeper.
    /// Must be called inside a tokio runtime.
    pub fn start(config: NotifyConfig, deps: ServiceDeps) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.router.queue_capacity);
        let session = SessionHandle::new();

        let cache = Arc::new(DeduplicationCache::new(
            deps.store,
            Arc::clone(&deps.clock),
            config.dedup.clone(),
            config.store.timeout(),
        ));
        let scheduler = FallbackScheduler::new(
            deps.notifier,
            Arc::clone(&deps.clock),
            config.fallback.clone(),
        );
        let router = NotificationRouter::new(RouterDeps {
            cache,
            scheduler: scheduler.clone(),
            session: session.clone(),
            clock: Arc::clone(&deps.clock),
            mute: deps.mute,
            push: deps.push,
            config: config.router.clone(),
        });
        let listeners = ListenerManager::new(
            deps.source,
            queue_tx,
            deps.clock,
            config.listener.clone(),
        );

        let router_task = {
            let router = router.clone();
            tokio::spawn(async move { router.run(queue_rx).await })
        };
        let sweeper_task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_sweeper().await })
        };

        info!(
            queue_capacity = config.router.queue_capacity,
            fallback_delay_ms = config.fallback.delay_ms,
            "notification service started"
        );
        Self {
            router,
            scheduler,
            listeners,
            session,
            tasks: Mutex::new(vec![router_task, sweeper_task]),
        }
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.router
    }

    pub fn scheduler(&self) -> &FallbackScheduler {
        &self.scheduler
    }

    pub fn listeners(&self) -> &ListenerManager {
        &self.listeners
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Bind the host UI. See [`NotificationRouter::init`].
    pub fn init(&self, host: HostBindings) -> bool {
        self.router.init(host)
    }

    /// Switch to `ctx`: tear down the old subscriptions, invalidate the old
    /// session, and subscribe for the new one. Returns the number of live
    /// subscriptions.
    ///
    /// On a cold start only the in-process cache is reset, so persisted
    /// entries keep suppressing across restarts. Switching from another
    /// session also wipes persisted entries.
    pub async fn begin_session(&self, ctx: SessionContext) -> usize {
        self.listeners.stop();
        let switching = self.session.current().is_some();
        let epoch = self.session.set(ctx.clone());
        self.router.reset_for_session(switching).await;
        info!(session_id = %ctx.session_id, epoch, switching, "session begun");
        self.listeners.start(ctx, epoch).await
    }

    /// Leave the current session. Queued and in-flight events of that
    /// session produce no output.
    pub async fn end_session(&self) {
        self.listeners.stop();
        let epoch = self.session.clear();
        self.router.reset_for_session(true).await;
        info!(epoch, "session ended");
    }

    /// Stop everything. Safe to call more than once.
    pub async fn shutdown(&self) {
        self.listeners.stop();
        self.session.clear();
        self.scheduler.stop();
        self.router.shutdown();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("notification service stopped");
    }
}
