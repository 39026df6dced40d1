//! Append-only JSONL log of router outcomes, stamped with the session they
//! were decided under.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::router::{Disposition, RouterNotification};
use crate::session::SessionHandle;

/// One line of the outcome log.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordedOutcome {
    pub recorded_at: DateTime<Utc>,
    /// Session active when the line was written. `None` between sessions.
    pub session_id: Option<String>,
    pub epoch: u64,
    #[serde(flatten)]
    pub outcome: RouterNotification,
}

/// What a recorder saw over its lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecorderSummary {
    pub written: u64,
    /// Outcomes lost to broadcast lag.
    pub missed: u64,
    pub by_disposition: BTreeMap<Disposition, u64>,
}

pub struct Recorder {
    writer: BufWriter<File>,
    rx: broadcast::Receiver<RouterNotification>,
    session: SessionHandle,
    cancel: CancellationToken,
    summary: RecorderSummary,
}

impl Recorder {
    /// Open `path` for appending, so a restarted daemon extends the same log.
    pub async fn open(
        path: &Path,
        rx: broadcast::Receiver<RouterNotification>,
        session: SessionHandle,
    ) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            writer: BufWriter::new(file),
            rx,
            session,
            cancel: CancellationToken::new(),
            summary: RecorderSummary::default(),
        })
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Write one line per outcome until cancelled or the router goes away.
    pub async fn run(mut self) -> RecorderSummary {
        loop {
            tokio::select! {
                result = self.rx.recv() => {
                    match result {
                        Ok(outcome) => self.write(outcome).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            self.summary.missed += n;
                            tracing::warn!(skipped = n, "recorder lagged, dropped outcomes");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("recorder: router closed, stopping");
                            break;
                        }
                    }
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!("recorder: cancellation requested, shutting down");
                    break;
                }
            }
        }
        if let Err(e) = self.writer.flush().await {
            tracing::error!("recorder flush failed: {e}");
        }
        self.summary
    }

    async fn write(&mut self, outcome: RouterNotification) {
        let (context, epoch) = self.session.snapshot();
        let disposition = outcome.disposition;
        let record = RecordedOutcome {
            recorded_at: Utc::now(),
            session_id: context.map(|c| c.session_id),
            epoch,
            outcome,
        };
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("recorder serialization failed: {e}");
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = self.writer.write_all(&line).await {
            tracing::error!("recorder write failed: {e}");
            return;
        }
        // Flush per line so `tail -f` sees outcomes as they happen.
        if let Err(e) = self.writer.flush().await {
            tracing::error!("recorder flush failed: {e}");
        }
        self.summary.written += 1;
        *self.summary.by_disposition.entry(disposition).or_default() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_core::types::{EventKind, SessionContext};

    fn outcome(id: &str, disposition: Disposition) -> RouterNotification {
        RouterNotification {
            event_id: id.into(),
            kind: EventKind::Message,
            disposition,
            at: Utc::now(),
        }
    }

    fn read_lines(path: &Path) -> Vec<RecordedOutcome> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn lines_carry_the_session_they_were_decided_under() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        let session = SessionHandle::new();
        let epoch = session.set(SessionContext::new("sess-ari", "prof-ari", "gala"));
        let (tx, rx) = broadcast::channel(16);
        let recorder = Recorder::open(&path, rx, session.clone()).await.unwrap();

        tx.send(outcome("a", Disposition::Rendered)).unwrap();
        tx.send(outcome("b", Disposition::FallbackArmed)).unwrap();
        drop(tx);
        let summary = recorder.run().await;

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].session_id.as_deref(), Some("sess-ari"));
        assert_eq!(lines[0].epoch, epoch);
        assert_eq!(lines[1].outcome.disposition, Disposition::FallbackArmed);
        assert_eq!(summary.written, 2);
        assert_eq!(summary.by_disposition[&Disposition::Rendered], 1);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"disposition\":\"fallback_armed\""));
        assert!(raw.contains("\"kind\":\"message\""));
    }

    #[tokio::test]
    async fn reopening_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outcomes.jsonl");

        for id in ["first-run", "second-run"] {
            let (tx, rx) = broadcast::channel(4);
            let recorder = Recorder::open(&path, rx, SessionHandle::new()).await.unwrap();
            tx.send(outcome(id, Disposition::Deduplicated)).unwrap();
            drop(tx);
            recorder.run().await;
        }

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].outcome.event_id, "first-run");
        assert_eq!(lines[1].session_id, None);
    }

    #[tokio::test]
    async fn lag_is_counted_as_missed() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = broadcast::channel(2);
        let recorder = Recorder::open(&dir.path().join("out.jsonl"), rx, SessionHandle::new())
            .await
            .unwrap();

        for i in 0..5 {
            tx.send(outcome(&format!("m{i}"), Disposition::Muted)).unwrap();
        }
        drop(tx);
        let summary = recorder.run().await;

        assert_eq!(summary.missed, 3);
        assert_eq!(summary.written, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_the_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, rx) = broadcast::channel::<RouterNotification>(4);
        let cancel = CancellationToken::new();
        let recorder = Recorder::open(&dir.path().join("out.jsonl"), rx, SessionHandle::new())
            .await
            .unwrap()
            .with_cancel(cancel.clone());
        cancel.cancel();
        assert_eq!(recorder.run().await, RecorderSummary::default());
    }
}
