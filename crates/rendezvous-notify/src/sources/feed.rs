use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rendezvous_core::source::LiveQuery;
use rendezvous_core::types::RawDocument;
use tokio::io::AsyncBufReadExt;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SourceError;
use crate::listener::{DocumentSource, Subscription};

/// Per-subscription buffer between `publish` and the listener task.
const SUBSCRIPTION_BUFFER: usize = 64;

struct Subscriber {
    query: LiveQuery,
    tx: mpsc::Sender<RawDocument>,
}

#[derive(Default)]
struct Hub {
    subscribers: Vec<Subscriber>,
    history: VecDeque<RawDocument>,
    history_capacity: usize,
}

/// In-process document feed. Documents published here reach every open
/// subscription whose live query matches them.
///
/// With a history, new subscriptions first receive the retained matching
/// documents, the way a live query delivers its current result set on
/// attach.
#[derive(Clone, Default)]
pub struct FeedSource {
    hub: Arc<Mutex<Hub>>,
}

impl FeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retain up to `capacity` published documents for late subscribers.
    pub fn with_history(capacity: usize) -> Self {
        let feed = Self::default();
        feed.hub().history_capacity = capacity;
        feed
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver `doc` to matching subscriptions. Returns how many received it.
    pub async fn publish(&self, doc: RawDocument) -> usize {
        let targets: Vec<mpsc::Sender<RawDocument>> = {
            let mut hub = self.hub();
            hub.subscribers.retain(|s| !s.tx.is_closed());
            if hub.history_capacity > 0 {
                if hub.history.len() == hub.history_capacity {
                    hub.history.pop_front();
                }
                hub.history.push_back(doc.clone());
            }
            hub.subscribers
                .iter()
                .filter(|s| s.query.matches(&doc))
                .map(|s| s.tx.clone())
                .collect()
        };

        let mut delivered = 0;
        for tx in targets {
            if tx.send(doc.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        tracing::debug!(doc_id = %doc.id, delivered, "feed document published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        let mut hub = self.hub();
        hub.subscribers.retain(|s| !s.tx.is_closed());
        hub.subscribers.len()
    }

    /// Accept newline-delimited JSON documents on a Unix stream socket and
    /// publish them. Runs until `cancel` fires.
    pub async fn listen(
        &self,
        socket_path: PathBuf,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        // Remove stale socket file if it exists.
        if socket_path.exists() {
            tokio::fs::remove_file(&socket_path).await?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        tracing::info!(path = %socket_path.display(), "feed socket listening");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = cancel.cancelled() => break,
            };
            match accepted {
                Ok((stream, _addr)) => {
                    let feed = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let mut lines = tokio::io::BufReader::new(stream).lines();
                        loop {
                            let line = tokio::select! {
                                line = lines.next_line() => line,
                                _ = cancel.cancelled() => break,
                            };
                            match line {
                                Ok(Some(line)) => {
                                    feed.publish_line(&line).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    tracing::warn!("feed connection read error: {e}");
                                    break;
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!("feed accept error: {e}");
                    continue;
                }
            }
        }

        if let Err(e) = tokio::fs::remove_file(&socket_path).await {
            tracing::warn!(path = %socket_path.display(), "failed to remove feed socket: {e}");
        }
        Ok(())
    }

    /// Publish every document in a JSONL file, in order. Malformed lines are
    /// skipped. Returns the number of documents published.
    pub async fn replay_file(&self, path: &Path) -> Result<usize, SourceError> {
        let file = tokio::fs::File::open(path).await?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        let mut published = 0;
        while let Some(line) = lines.next_line().await? {
            if self.publish_line(&line).await {
                published += 1;
            }
        }
        tracing::info!(path = %path.display(), published, "feed replay finished");
        Ok(published)
    }

    async fn publish_line(&self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return false;
        }
        match serde_json::from_str::<RawDocument>(line) {
            Ok(doc) => {
                self.publish(doc).await;
                true
            }
            Err(e) => {
                tracing::warn!("failed to parse feed JSON: {e}, line: {line}");
                false
            }
        }
    }
}

#[async_trait]
impl DocumentSource for FeedSource {
    async fn subscribe(&self, query: LiveQuery) -> Result<Subscription, SourceError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let backlog: Vec<RawDocument> = {
            let mut hub = self.hub();
            let backlog = hub
                .history
                .iter()
                .filter(|doc| query.matches(doc))
                .cloned()
                .collect();
            hub.subscribers.push(Subscriber {
                query: query.clone(),
                tx: tx.clone(),
            });
            backlog
        };
        for doc in backlog {
            // The receiver is still in hand, so only a full buffer can fail.
            if tx.try_send(doc).is_err() {
                tracing::warn!(query = query.label(), "feed backlog exceeds buffer, truncating");
                break;
            }
        }
        Ok(Subscription::new(query, rx))
    }
}
