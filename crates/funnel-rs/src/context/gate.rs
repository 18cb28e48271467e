//! Compaction gate: replace a raw artifact with its summary.
//!
//! For one `raw_key -> summary_key` pair the gate reads the raw artifact,
//! hands it to the compactor's logic together with the output cap, measures
//! both sides, writes the summary, deletes the raw, and records a
//! [`CompactionRecord`].
//!
//! The order is fixed: summary write first, raw delete second. A crash
//! between the two leaves both present rather than neither. The cap is
//! guidance for the compactor only; the gate never truncates, and an
//! oversized summary is recorded (with `exceeded_cap`) rather than rejected.
//! The raw is deleted even when the summary came out larger. When both keys
//! are the same the summary overwrites the raw in place and nothing is
//! deleted.

use super::meter::SizeMeter;
use crate::Turn;
use crate::error::StageLogicError;
use crate::events::{EventRecorder, PipelineEvent};
use crate::pipeline::stage::{StageKind, StageLogic, StageRequest};
use crate::state::store::StateStore;
use serde::{Deserialize, Serialize};

/// Size accounting for one committed compaction. Immutable once recorded.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompactionRecord {
    pub stage_name: String,
    pub raw_key: String,
    pub summary_key: String,
    pub raw_size_tokens: usize,
    pub summary_size_tokens: usize,
    pub reduction_percent: f64,
    pub max_output_tokens: Option<usize>,
    pub exceeded_cap: bool,
    /// RFC 3339 time the compaction was committed.
    pub timestamp: String,
}

/// `round((1 - summary / max(raw, 1)) * 100, 2)`.
///
/// An empty raw artifact is measured against 1, so the result is large and
/// negative instead of a division by zero. Ties round to even.
pub fn reduction_percent(raw_tokens: usize, summary_tokens: usize) -> f64 {
    let denominator = raw_tokens.max(1) as f64;
    let pct = (1.0 - summary_tokens as f64 / denominator) * 100.0;
    (pct * 100.0).round_ties_even() / 100.0
}

/// Borrows a run's store and recorder for the duration of one compaction.
pub struct CompactionGate<'a> {
    store: &'a mut StateStore,
    recorder: &'a mut EventRecorder,
    meter: &'a dyn SizeMeter,
}

impl<'a> CompactionGate<'a> {
    pub fn new(
        store: &'a mut StateStore,
        recorder: &'a mut EventRecorder,
        meter: &'a dyn SizeMeter,
    ) -> Self {
        Self {
            store,
            recorder,
            meter,
        }
    }

    /// Run `compactor` over the artifact at `raw_key` and commit the result
    /// to `summary_key`.
    ///
    /// On error nothing is written or deleted and no record is emitted.
    pub async fn compact(
        &mut self,
        stage: &str,
        raw_key: &str,
        summary_key: &str,
        max_output_tokens: Option<usize>,
        compactor: &dyn StageLogic,
        window: &[Turn],
    ) -> Result<String, StageLogicError> {
        let raw = self.store.read_or_empty(raw_key).to_string();
        let raw_tokens = self.meter.measure(&raw);
        self.recorder.emit(&PipelineEvent::TokenInput {
            stage,
            raw_tokens,
        });

        let inputs = [raw];
        let summary = compactor
            .run(StageRequest {
                stage,
                kind: StageKind::Compactor,
                inputs: &inputs,
                window,
                max_output_tokens,
            })
            .await?;

        let summary_tokens = self.meter.measure(&summary);
        let record = CompactionRecord {
            stage_name: stage.to_string(),
            raw_key: raw_key.to_string(),
            summary_key: summary_key.to_string(),
            raw_size_tokens: raw_tokens,
            summary_size_tokens: summary_tokens,
            reduction_percent: reduction_percent(raw_tokens, summary_tokens),
            max_output_tokens,
            exceeded_cap: max_output_tokens.is_some_and(|cap| summary_tokens > cap),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        self.store.write(summary_key, summary.clone());
        // Same key: the write above already replaced the raw.
        if raw_key != summary_key {
            self.store.delete(raw_key);
        }
        self.recorder.emit(&PipelineEvent::Compaction(&record));

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::meter::WordMeter;
    use crate::pipeline::stage::FnLogic;

    fn words(n: usize) -> String {
        vec!["w"; n].join(" ")
    }

    #[test]
    fn reduction_from_1000_to_200_is_80() {
        assert_eq!(reduction_percent(1000, 200), 80.0);
    }

    #[test]
    fn empty_raw_uses_unit_denominator() {
        assert_eq!(reduction_percent(0, 50), -4900.0);
        assert_eq!(reduction_percent(0, 0), 100.0);
    }

    #[test]
    fn reduction_rounds_to_two_places() {
        assert_eq!(reduction_percent(3, 1), 66.67);
        assert_eq!(reduction_percent(100, 150), -50.0);
    }

    #[test]
    fn reduction_ties_round_to_even() {
        // 90.625 exactly
        assert_eq!(reduction_percent(32, 3), 90.62);
        // 96.875 exactly
        assert_eq!(reduction_percent(32, 1), 96.88);
    }

    #[tokio::test]
    async fn summary_replaces_raw() {
        let mut store = StateStore::new("run-1");
        let mut recorder = EventRecorder::new("run-1");
        store.write("market_raw", words(1000));

        let compactor = FnLogic::new(|_req| async { Ok(words(200)) });
        let summary = CompactionGate::new(&mut store, &mut recorder, &WordMeter)
            .compact("market_summarizer", "market_raw", "market_summary", Some(180), &compactor, &[])
            .await
            .unwrap();

        assert_eq!(store.read("market_raw"), None);
        assert_eq!(store.read("market_summary"), Some(summary.as_str()));

        let rec = &recorder.compactions()[0];
        assert_eq!(rec.raw_size_tokens, 1000);
        assert_eq!(rec.summary_size_tokens, 200);
        assert_eq!(rec.reduction_percent, 80.0);
        assert!(rec.exceeded_cap);
    }

    #[tokio::test]
    async fn compactor_receives_raw_text_and_cap() {
        let mut store = StateStore::new("run-1");
        let mut recorder = EventRecorder::new("run-1");
        store.write("tech_raw", "alpha beta gamma");

        let compactor = FnLogic::new(|req| {
            let echoed = format!("{}|{:?}|{:?}", req.inputs[0], req.kind, req.max_output_tokens);
            async move { Ok(echoed) }
        });
        let summary = CompactionGate::new(&mut store, &mut recorder, &WordMeter)
            .compact("tech_summarizer", "tech_raw", "tech_summary", Some(120), &compactor, &[])
            .await
            .unwrap();

        assert_eq!(summary, "alpha beta gamma|Compactor|Some(120)");
    }

    #[tokio::test]
    async fn absent_raw_is_compacted_as_empty() {
        let mut store = StateStore::new("run-1");
        let mut recorder = EventRecorder::new("run-1");

        let compactor = FnLogic::new(|req| {
            let empty = req.inputs[0].is_empty();
            async move { Ok(if empty { words(50) } else { String::new() }) }
        });
        CompactionGate::new(&mut store, &mut recorder, &WordMeter)
            .compact("risk_summarizer", "risk_raw", "risk_summary", Some(180), &compactor, &[])
            .await
            .unwrap();

        let rec = &recorder.compactions()[0];
        assert_eq!(rec.raw_size_tokens, 0);
        assert_eq!(rec.reduction_percent, -4900.0);
        assert!(store.contains("risk_summary"));
    }

    #[tokio::test]
    async fn larger_summary_still_deletes_raw() {
        let mut store = StateStore::new("run-1");
        let mut recorder = EventRecorder::new("run-1");
        store.write("policy_raw", words(10));

        let compactor = FnLogic::new(|_req| async { Ok(words(30)) });
        CompactionGate::new(&mut store, &mut recorder, &WordMeter)
            .compact("policy_summarizer", "policy_raw", "policy_summary", Some(180), &compactor, &[])
            .await
            .unwrap();

        assert!(!store.contains("policy_raw"));
        assert_eq!(recorder.compactions()[0].reduction_percent, -200.0);
        assert!(!recorder.compactions()[0].exceeded_cap);
    }

    #[tokio::test]
    async fn failed_compactor_leaves_raw_in_place() {
        let mut store = StateStore::new("run-1");
        let mut recorder = EventRecorder::new("run-1");
        store.write("finance_raw", "revenue 10M");

        let compactor = FnLogic::new(|_req| async { Err(StageLogicError::new("model timeout")) });
        let err = CompactionGate::new(&mut store, &mut recorder, &WordMeter)
            .compact("finance_summarizer", "finance_raw", "finance_summary", Some(180), &compactor, &[])
            .await
            .unwrap_err();

        assert_eq!(err.message(), "model timeout");
        assert_eq!(store.read("finance_raw"), Some("revenue 10M"));
        assert!(!store.contains("finance_summary"));
        assert!(recorder.compactions().is_empty());
    }

    #[tokio::test]
    async fn same_key_summary_overwrites_in_place() {
        let mut store = StateStore::new("run-1");
        let mut recorder = EventRecorder::new("run-1");
        store.write("topic", "alpha beta gamma");

        let compactor = FnLogic::new(|_req| async { Ok("alpha".to_string()) });
        let summary = CompactionGate::new(&mut store, &mut recorder, &WordMeter)
            .compact("topic_summarizer", "topic", "topic", Some(180), &compactor, &[])
            .await
            .unwrap();

        assert_eq!(summary, "alpha");
        assert_eq!(store.read("topic"), Some("alpha"));
        assert_eq!(recorder.compactions()[0].raw_size_tokens, 3);
    }
}
