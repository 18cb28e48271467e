//! Key/value artifact store scoped to one pipeline run.
//!
//! Reads are plain lookups: an absent key is a normal result, never an
//! error. Writes and deletes are mirrored to persistent run-state logging by
//! queueing a full snapshot on a [`BackgroundWriter`]; the mutating call
//! returns immediately and logging failures end up in [`SinkDiagnostics`].

use super::sink::{BackgroundWriter, RecordSink, SinkDiagnostics};
use crate::error::SinkError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// A named text value held in the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub key: String,
    pub value: String,
    /// Ordinal of the stage that wrote it, or `None` for values written
    /// outside a stage (the seeded query, a carried-over snapshot).
    pub produced_at_stage: Option<usize>,
}

/// One persisted snapshot of a run's state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StateRecord {
    pub run_id: String,
    /// RFC 3339 wall-clock time of the mutation.
    pub time: String,
    pub state: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct StateStore {
    run_id: String,
    artifacts: BTreeMap<String, Artifact>,
    /// Stage ordinal stamped on artifacts written from now on.
    current_stage: Option<usize>,
    writer: Option<BackgroundWriter<StateRecord>>,
}

impl StateStore {
    /// Create an empty store with no persistence attached.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            artifacts: BTreeMap::new(),
            current_stage: None,
            writer: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Stream a snapshot to `sink` after every mutation.
    ///
    /// Spawns a writer task, so this must run inside a Tokio runtime.
    pub fn attach_sink(
        &mut self,
        sink: Arc<dyn RecordSink<StateRecord>>,
        diagnostics: SinkDiagnostics,
    ) -> Result<(), SinkError> {
        self.writer = Some(BackgroundWriter::spawn("state", sink, diagnostics)?);
        Ok(())
    }

    /// Wait for queued snapshots to reach the sink and detach it.
    pub async fn close_log(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
    }

    /// Set the stage ordinal recorded on subsequent writes.
    pub fn set_stage(&mut self, stage: Option<usize>) {
        self.current_stage = stage;
    }

    /// Insert or overwrite `key`.
    pub fn write(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        trace!("state write: {key} ({} chars)", value.len());
        self.artifacts.insert(
            key.clone(),
            Artifact {
                key,
                value,
                produced_at_stage: self.current_stage,
            },
        );
        self.persist();
    }

    /// Value at `key`, or `None` when absent.
    pub fn read(&self, key: &str) -> Option<&str> {
        self.artifacts.get(key).map(|a| a.value.as_str())
    }

    /// Value at `key`, with absent treated as empty text.
    pub fn read_or_empty(&self, key: &str) -> &str {
        self.read(key).unwrap_or("")
    }

    pub fn artifact(&self, key: &str) -> Option<&Artifact> {
        self.artifacts.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.artifacts.contains_key(key)
    }

    /// Remove `key`. Absent keys are a no-op and queue no snapshot.
    pub fn delete(&mut self, key: &str) -> Option<Artifact> {
        let removed = self.artifacts.remove(key);
        if removed.is_some() {
            trace!("state delete: {key}");
            self.persist();
        }
        removed
    }

    /// Insert many values at once, queueing a single snapshot.
    pub fn extend(&mut self, values: impl IntoIterator<Item = (String, String)>) {
        let mut count = 0;
        for (key, value) in values {
            self.artifacts.insert(
                key.clone(),
                Artifact {
                    key,
                    value,
                    produced_at_stage: self.current_stage,
                },
            );
            count += 1;
        }
        if count > 0 {
            debug!("state seeded with {count} value(s)");
            self.persist();
        }
    }

    /// Every key and value, ordered by key. Reflects exactly what
    /// [`read`](Self::read) returns at call time.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.artifacts
            .iter()
            .map(|(k, a)| (k.clone(), a.value.clone()))
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    fn persist(&self) {
        if let Some(ref writer) = self.writer {
            writer.send(StateRecord {
                run_id: self.run_id.clone(),
                time: chrono::Utc::now().to_rfc3339(),
                state: self.snapshot(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::sink::{MemorySink, SinkFuture};

    #[test]
    fn write_then_read() {
        let mut store = StateStore::new("run-1");
        store.write("market_raw", "lots of text");
        assert_eq!(store.read("market_raw"), Some("lots of text"));

        store.write("market_raw", "overwritten");
        assert_eq!(store.read("market_raw"), Some("overwritten"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn absent_key_reads_as_none_or_empty() {
        let store = StateStore::new("run-1");
        assert_eq!(store.read("missing"), None);
        assert_eq!(store.read_or_empty("missing"), "");
    }

    #[test]
    fn delete_absent_key_is_noop() {
        let mut store = StateStore::new("run-1");
        assert!(store.delete("missing").is_none());
        store.write("a", "1");
        assert!(store.delete("missing").is_none());
        assert_eq!(store.read("a"), Some("1"));
    }

    #[test]
    fn delete_removes_key() {
        let mut store = StateStore::new("run-1");
        store.write("finance_raw", "numbers");
        let removed = store.delete("finance_raw").unwrap();
        assert_eq!(removed.value, "numbers");
        assert!(!store.contains("finance_raw"));
    }

    #[test]
    fn snapshot_matches_reads() {
        let mut store = StateStore::new("run-1");
        store.write("b", "2");
        store.write("a", "1");
        store.write("c", "3");
        store.delete("c");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        for (key, value) in &snapshot {
            assert_eq!(store.read(key), Some(value.as_str()));
        }
    }

    #[test]
    fn writes_carry_current_stage() {
        let mut store = StateStore::new("run-1");
        store.write("user_query", "q");
        store.set_stage(Some(2));
        store.write("policy_raw", "p");

        assert_eq!(store.artifact("user_query").unwrap().produced_at_stage, None);
        assert_eq!(store.artifact("policy_raw").unwrap().produced_at_stage, Some(2));
    }

    #[tokio::test]
    async fn mutations_stream_snapshots_in_order() {
        let sink = MemorySink::<StateRecord>::new();
        let mut store = StateStore::new("run-7");
        store
            .attach_sink(Arc::new(sink.clone()), SinkDiagnostics::new())
            .unwrap();

        store.write("a", "1");
        store.write("b", "2");
        store.delete("missing");
        store.delete("a");
        store.close_log().await;

        let records = sink.records();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.run_id == "run-7"));
        assert_eq!(records[0].state.len(), 1);
        assert_eq!(records[1].state.len(), 2);
        assert_eq!(
            records[2].state,
            BTreeMap::from([("b".to_string(), "2".to_string())])
        );
    }

    /// Holds every append until `release` is notified.
    struct StalledSink {
        release: Arc<tokio::sync::Notify>,
        released: std::sync::atomic::AtomicBool,
        inner: MemorySink<StateRecord>,
    }

    impl RecordSink<StateRecord> for StalledSink {
        fn append<'a>(&'a self, record: &'a StateRecord) -> SinkFuture<'a> {
            Box::pin(async move {
                use std::sync::atomic::Ordering;
                if !self.released.load(Ordering::SeqCst) {
                    self.release.notified().await;
                    self.released.store(true, Ordering::SeqCst);
                }
                self.inner.append(record).await
            })
        }
    }

    #[tokio::test]
    async fn stalled_sink_never_blocks_mutations() {
        let release = Arc::new(tokio::sync::Notify::new());
        let inner = MemorySink::<StateRecord>::new();
        let sink = StalledSink {
            release: release.clone(),
            released: std::sync::atomic::AtomicBool::new(false),
            inner: inner.clone(),
        };
        let mut store = StateStore::new("run-3");
        store
            .attach_sink(Arc::new(sink), SinkDiagnostics::new())
            .unwrap();

        store.write("market_raw", "long text");
        // Let the writer task pick up the first snapshot and park on it.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        store.write("market_summary", "short");
        store.delete("market_raw");
        store.write("decision", "go");

        assert_eq!(store.read("market_raw"), None);
        assert_eq!(store.read("market_summary"), Some("short"));
        assert_eq!(store.read("decision"), Some("go"));
        assert!(inner.is_empty(), "sink is still stalled");

        release.notify_one();
        store.close_log().await;

        let keys: Vec<Vec<String>> = inner
            .records()
            .into_iter()
            .map(|r| r.state.into_keys().collect())
            .collect();
        assert_eq!(
            keys,
            vec![
                vec!["market_raw".to_string()],
                vec!["market_raw".to_string(), "market_summary".to_string()],
                vec!["market_summary".to_string()],
                vec!["decision".to_string(), "market_summary".to_string()],
            ]
        );
    }

    #[test]
    fn extend_inserts_all_values() {
        let mut store = StateStore::new("run-2");
        store.extend([
            ("market_summary".to_string(), "m".to_string()),
            ("finance_summary".to_string(), "f".to_string()),
        ]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.read("finance_summary"), Some("f"));
    }
}
