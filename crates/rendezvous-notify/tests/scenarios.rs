//! End-to-end scenarios: raw documents in through the feed, renders and local
//! notifications out through the host seams.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rendezvous_core::clock::{Clock, ManualClock};
use rendezvous_core::config::NotifyConfig;
use rendezvous_core::dedup_key::match_key;
use rendezvous_core::source::ScopedEvent;
use rendezvous_core::types::{Collection, NormalizedEvent, RawDocument, SessionContext};
use rendezvous_notify::error::{HostError, MuteLookupError, StoreError};
use rendezvous_notify::host::{
    HostBindings, LocalNotification, LocalNotifier, MuteFilter, NoMutes, RenderRequest,
    RenderStyle, Renderer,
};
use rendezvous_notify::router::{Disposition, RouterNotification};
use rendezvous_notify::service::{NotificationService, ServiceDeps};
use rendezvous_notify::sources::feed::FeedSource;
use rendezvous_notify::store::{KeyValueStore, MemoryStore};
use serde_json::json;
use tokio::sync::broadcast;

const T0: i64 = 1_792_443_600_000;
const ME: &str = "sess-ari";

#[derive(Default)]
struct RecordingHost {
    renders: Mutex<Vec<RenderRequest>>,
    locals: Mutex<Vec<LocalNotification>>,
}

impl RecordingHost {
    fn renders(&self) -> Vec<RenderRequest> {
        self.renders.lock().unwrap().clone()
    }

    fn locals(&self) -> Vec<LocalNotification> {
        self.locals.lock().unwrap().clone()
    }
}

impl Renderer for RecordingHost {
    fn render(&self, request: RenderRequest) -> Result<(), HostError> {
        self.renders.lock().unwrap().push(request);
        Ok(())
    }
}

impl LocalNotifier for RecordingHost {
    fn deliver(&self, notification: &LocalNotification) -> Result<(), HostError> {
        self.locals.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

struct MuteList(HashSet<String>);

#[async_trait]
impl MuteFilter for MuteList {
    async fn is_muted(&self, sender: &str) -> Result<bool, MuteLookupError> {
        Ok(self.0.contains(sender))
    }
}

/// Memory store whose reads take a moment, so concurrent callers interleave.
#[derive(Clone, Default)]
struct SlowReadStore(MemoryStore);

#[async_trait]
impl KeyValueStore for SlowReadStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.0.get(key).await
    }
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.0.set(key, value).await
    }
    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.0.remove(key).await
    }
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.0.keys_with_prefix(prefix).await
    }
}

struct Harness {
    service: NotificationService,
    feed: FeedSource,
    clock: ManualClock,
    host: Arc<RecordingHost>,
    foreground: Arc<AtomicBool>,
    outcomes: broadcast::Receiver<RouterNotification>,
}

impl Harness {
    fn build(
        store: Arc<dyn KeyValueStore>,
        feed: FeedSource,
        mute: Arc<dyn MuteFilter>,
    ) -> Self {
        let clock = ManualClock::new(T0);
        let host = Arc::new(RecordingHost::default());
        let service = NotificationService::start(
            NotifyConfig::default(),
            ServiceDeps::new(
                store,
                Arc::new(feed.clone()),
                host.clone(),
                Arc::new(clock.clone()),
            )
            .with_mute_filter(mute),
        );
        let outcomes = service.router().subscribe();
        Self {
            service,
            feed,
            clock,
            host,
            foreground: Arc::new(AtomicBool::new(true)),
            outcomes,
        }
    }

    fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::build(store, FeedSource::new(), Arc::new(NoMutes))
    }

    fn init(&self) {
        let foreground = Arc::clone(&self.foreground);
        assert!(self.service.init(HostBindings {
            presence: Arc::new(move || foreground.load(Ordering::SeqCst)),
            navigator: Arc::new(|_: &str| {}),
            renderer: self.host.clone(),
            match_modal: None,
        }));
    }

    async fn begin(&self) {
        let subscriptions = self
            .service
            .begin_session(SessionContext::new(ME, "prof-ari", "gala"))
            .await;
        assert_eq!(subscriptions, 3);
    }

    fn background(&self) {
        self.foreground.store(false, Ordering::SeqCst);
    }

    async fn outcome_for(&mut self, event_id: &str) -> Disposition {
        loop {
            let n = tokio::time::timeout(Duration::from_secs(30), self.outcomes.recv())
                .await
                .expect("timed out waiting for router outcome")
                .expect("outcome channel closed");
            if n.event_id == event_id {
                return n.disposition;
            }
        }
    }
}

fn match_doc(id: &str, initiator: (&str, &str), counterpart: (&str, &str), at: i64) -> RawDocument {
    RawDocument {
        collection: Collection::Matches,
        id: id.into(),
        data: json!({
            "event_id": "gala",
            "initiator_session_id": initiator.0,
            "initiator_name": initiator.1,
            "counterpart_session_id": counterpart.0,
            "counterpart_name": counterpart.1,
            "created_at": at,
        }),
    }
}

fn message_doc(id: &str, sender: &str, content: &str, at: i64) -> RawDocument {
    RawDocument {
        collection: Collection::Messages,
        id: id.into(),
        data: json!({
            "event_id": "gala",
            "recipient_profile_id": "prof-ari",
            "sender_session_id": sender,
            "sender_name": "Dana",
            "content": content,
            "created_at": at,
        }),
    }
}

#[tokio::test(start_paused = true)]
async fn initiator_match_renders_once_with_counterpart_name() {
    let mut h = Harness::new(Arc::new(MemoryStore::new()));
    h.init();
    h.begin().await;

    h.feed
        .publish(match_doc("match-1", (ME, "Ari"), ("sess-dana", "Dana"), T0))
        .await;
    assert_eq!(h.outcome_for("match-1").await, Disposition::Rendered);

    tokio::time::sleep(Duration::from_secs(5)).await;
    let renders = h.host.renders();
    assert_eq!(renders.len(), 1);
    assert_eq!(renders[0].style, RenderStyle::MatchAlert);
    assert!(renders[0].title.contains("Dana"));
    assert_eq!(renders[0].participant_id, "sess-dana");
    assert!(h.host.locals().is_empty());
    assert_eq!(h.service.scheduler().outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn backgrounded_counterpart_gets_exactly_one_fallback() {
    let store = MemoryStore::new();
    let mut h = Harness::new(Arc::new(store.clone()));
    h.init();
    h.begin().await;
    h.background();

    h.feed
        .publish(match_doc("match-2", ("sess-dana", "Dana"), (ME, "Ari"), T0))
        .await;
    assert_eq!(h.outcome_for("match-2").await, Disposition::FallbackArmed);
    assert!(h.host.renders().is_empty());
    assert_eq!(store.len(), 1, "one persisted cache write");
    assert_eq!(
        store.get(match_key(ME, "sess-dana").as_str()).await.unwrap(),
        Some(T0.to_string())
    );

    tokio::time::sleep(Duration::from_secs(3)).await;
    let locals = h.host.locals();
    assert_eq!(locals.len(), 1);
    assert_eq!(locals[0].event_id, "match-2");
    assert!(locals[0].body.contains("Dana"));
    assert!(h.host.renders().is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_message_is_suppressed_but_new_text_is_not() {
    let mut h = Harness::new(Arc::new(MemoryStore::new()));
    h.init();
    h.begin().await;

    h.feed
        .publish(message_doc("msg-1", "sess-dana", "see you at the bar", T0))
        .await;
    assert_eq!(h.outcome_for("msg-1").await, Disposition::Rendered);

    h.clock.advance_ms(5_000);
    h.feed
        .publish(message_doc("msg-2", "sess-dana", "see you at the bar", T0 + 5_000))
        .await;
    assert_eq!(h.outcome_for("msg-2").await, Disposition::Deduplicated);

    h.clock.advance_ms(1_000);
    h.feed
        .publish(message_doc("msg-3", "sess-dana", "actually, the terrace", T0 + 6_000))
        .await;
    assert_eq!(h.outcome_for("msg-3").await, Disposition::Rendered);

    let bodies: Vec<String> = h.host.renders().into_iter().map(|r| r.body).collect();
    assert_eq!(bodies, vec!["see you at the bar", "actually, the terrace"]);
}

#[tokio::test(start_paused = true)]
async fn muted_sender_produces_nothing() {
    let store = MemoryStore::new();
    let mute = MuteList(HashSet::from(["sess-dana".to_string()]));
    let mut h = Harness::build(Arc::new(store.clone()), FeedSource::new(), Arc::new(mute));
    h.init();
    h.begin().await;
    h.background();

    h.feed
        .publish(message_doc("msg-1", "sess-dana", "hey", T0))
        .await;
    assert_eq!(h.outcome_for("msg-1").await, Disposition::Muted);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.host.renders().is_empty());
    assert!(h.host.locals().is_empty());
    assert!(h.service.router().cache().snapshot().is_empty());
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn persisted_entry_suppresses_after_restart() {
    let store = MemoryStore::new();

    let mut first = Harness::new(Arc::new(store.clone()));
    first.init();
    first.begin().await;
    first
        .feed
        .publish(match_doc("match-1", ("sess-dana", "Dana"), (ME, "Ari"), T0))
        .await;
    assert_eq!(first.outcome_for("match-1").await, Disposition::Rendered);
    first.service.shutdown().await;

    // Same pair, new document, fresh process: only the store remembers.
    let mut second = Harness::new(Arc::new(store.clone()));
    second.clock.advance_ms(20 * 60_000);
    second.init();
    second.begin().await;
    assert!(second.service.router().cache().snapshot().is_empty());
    second
        .feed
        .publish(match_doc(
            "match-1b",
            ("sess-dana", "Dana"),
            (ME, "Ari"),
            T0 + 20 * 60_000,
        ))
        .await;
    assert_eq!(second.outcome_for("match-1b").await, Disposition::Deduplicated);
    assert!(second.host.renders().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ending_the_session_discards_queued_events() {
    let mut h = Harness::new(Arc::new(MemoryStore::new()));
    h.begin().await;

    h.feed
        .publish(message_doc("msg-1", "sess-dana", "first", T0))
        .await;
    h.feed
        .publish(message_doc("msg-2", "sess-dana", "second", T0))
        .await;
    assert_eq!(h.outcome_for("msg-1").await, Disposition::Queued);
    assert_eq!(h.outcome_for("msg-2").await, Disposition::Queued);
    assert_eq!(h.service.router().pending_len(), 2);

    h.service.end_session().await;
    h.init();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.host.renders().is_empty());
    assert!(h.host.locals().is_empty());
    assert_eq!(h.service.router().pending_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_no_timers_or_subscriptions() {
    let mut h = Harness::new(Arc::new(MemoryStore::new()));
    h.init();
    h.begin().await;
    h.background();

    h.feed
        .publish(message_doc("msg-1", "sess-dana", "hey", T0))
        .await;
    assert_eq!(h.outcome_for("msg-1").await, Disposition::FallbackArmed);
    assert_eq!(h.service.scheduler().outstanding(), 1);
    assert_eq!(h.service.listeners().active_subscriptions(), 3);

    h.service.shutdown().await;
    assert_eq!(h.service.scheduler().outstanding(), 0);
    assert_eq!(h.service.listeners().active_subscriptions(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.host.locals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn historical_records_never_reach_the_router() {
    let feed = FeedSource::with_history(16);
    feed.publish(message_doc("old", "sess-dana", "from an hour ago", T0 - 3_600_000))
        .await;
    feed.publish(message_doc("recent", "sess-dana", "just now", T0 - 2_000))
        .await;

    let mut h = Harness::build(Arc::new(MemoryStore::new()), feed, Arc::new(NoMutes));
    h.init();
    h.begin().await;

    assert_eq!(h.outcome_for("recent").await, Disposition::Rendered);
    tokio::time::sleep(Duration::from_secs(1)).await;
    while let Ok(n) = h.outcomes.try_recv() {
        assert_ne!(n.event_id, "old");
    }
    assert_eq!(h.host.renders().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn switching_sessions_resubscribes_under_the_new_scope() {
    let mut h = Harness::new(Arc::new(MemoryStore::new()));
    h.init();
    h.begin().await;
    h.service
        .begin_session(SessionContext::new("sess-kim", "prof-kim", "gala"))
        .await;

    // Addressed to the old profile: nobody listens any more.
    h.feed
        .publish(message_doc("for-ari", "sess-dana", "hi ari", T0))
        .await;
    let mut for_kim = message_doc("for-kim", "sess-dana", "hi kim", T0);
    for_kim.data["recipient_profile_id"] = json!("prof-kim");
    h.feed.publish(for_kim).await;

    assert_eq!(h.outcome_for("for-kim").await, Disposition::Rendered);
    let renders = h.host.renders();
    assert_eq!(renders.len(), 1);
    assert_eq!(renders[0].body, "hi kim");
}

#[tokio::test(start_paused = true)]
async fn concurrent_duplicates_yield_a_single_winner() {
    let h = Harness::new(Arc::new(SlowReadStore::default()));
    h.init();
    h.begin().await;
    let epoch = h.service.session().epoch();

    let event = NormalizedEvent::Match {
        id: "match-9".into(),
        created_at: h.clock.now(),
        is_initiator: false,
        counterpart_session_id: "sess-dana".into(),
        counterpart_display_name: "Dana".into(),
    };
    let router = h.service.router();
    let (a, b) = tokio::join!(
        router.handle_incoming(ScopedEvent {
            epoch,
            event: event.clone()
        }),
        router.handle_incoming(ScopedEvent { epoch, event }),
    );

    let mut outcomes = [a, b];
    outcomes.sort_by_key(|d| format!("{d:?}"));
    assert_eq!(outcomes, [Disposition::RaceLost, Disposition::Rendered]);
    assert_eq!(h.host.renders().len(), 1);
}
