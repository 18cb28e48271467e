//! End-to-end tests for pipeline runs.
//!
//! These drive the public API only: stage logic is closure-based or the
//! bundled extractive logic, and sinks are in memory or temp files.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use funnel_rs::context::meter::WordMeter;
use funnel_rs::events::EventRecord;
use funnel_rs::pipeline::research::{DECISION_KEY, RESEARCH_TOPICS, raw_key, summary_key};
use funnel_rs::prelude::*;

fn echo() -> FnLogic {
    FnLogic::new(|input| async move { Ok(format!("{} <- {}", input.stage, input.inputs.join(" | "))) })
}

fn first_words(n: usize) -> FnLogic {
    FnLogic::new(move |input| async move {
        Ok(input.inputs[0]
            .split_whitespace()
            .take(n)
            .collect::<Vec<_>>()
            .join(" "))
    })
}

fn failing(message: &'static str) -> FnLogic {
    FnLogic::new(move |_| async move { Err(StageLogicError::new(message)) })
}

/// `[producerA, compactorA, producerB, compactorB, synth]`, with producerB
/// backed by `producer_b`.
fn two_topic_pipeline(producer_b: FnLogic) -> Arc<Pipeline> {
    let pipeline = PipelineBuilder::new()
        .meter(WordMeter)
        .producer("producerA", [QUERY_KEY], "a_raw", echo())
        .compactor("compactorA", "a_raw", "a_summary", 180, first_words(2))
        .producer("producerB", [QUERY_KEY], "b_raw", producer_b)
        .compactor("compactorB", "b_raw", "b_summary", 180, first_words(2))
        .synthesis("synth", ["a_summary", "b_summary"], "decision", None, echo())
        .build()
        .unwrap();
    Arc::new(pipeline)
}

// ── Abort ──────────────────────────────────────────────────────────

#[tokio::test]
async fn failing_producer_aborts_after_earlier_compaction() {
    let mut controller =
        PipelineController::new(two_topic_pipeline(failing("upstream retrieval failed")));

    let err = controller.run("EV charging").await.unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Stage(ref failure) if failure.stage == "producerB"
    ));
    assert_eq!(
        controller.status(),
        &RunStatus::Aborted {
            stage: "producerB".into(),
            cause: "upstream retrieval failed".into(),
        }
    );

    let snapshot = controller.snapshot();
    assert!(!snapshot.contains_key("a_raw"), "compactorA already ran");
    assert!(snapshot.contains_key("a_summary"));
    assert!(!snapshot.contains_key("b_raw"), "producerB output must be absent");
    assert!(controller.output().is_none());

    let executed: Vec<&str> = controller
        .state()
        .executed()
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    assert_eq!(executed, vec!["producerA", "compactorA"]);
}

#[tokio::test]
async fn aborted_run_can_seed_a_fresh_run() {
    let mut first = PipelineController::new(two_topic_pipeline(failing("HTTP 503")));
    assert!(first.run("EV charging").await.is_err());
    let carried = first.snapshot();

    let mut second = PipelineController::new(two_topic_pipeline(echo())).with_seed(carried);
    let decision = second.run("EV charging").await.unwrap();

    assert_ne!(first.run_id(), second.run_id());
    assert_eq!(second.status(), &RunStatus::Completed);
    // Every stage ran again; the seed did not short-circuit any of them.
    assert_eq!(second.state().executed().len(), 5);
    assert!(decision.starts_with("synth <- "));
}

// ── Isolation ──────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_runs_do_not_share_state() {
    let pipeline_a = Arc::new(
        PipelineBuilder::new()
            .producer("a_agent", [QUERY_KEY], "only_in_a", echo())
            .synthesis("a_synth", ["only_in_a", "only_in_b"], "out", None, echo())
            .build()
            .unwrap(),
    );
    let pipeline_b = Arc::new(
        PipelineBuilder::new()
            .producer("b_agent", [QUERY_KEY], "only_in_b", echo())
            .synthesis("b_synth", ["only_in_a", "only_in_b"], "out", None, echo())
            .build()
            .unwrap(),
    );

    let run_a = tokio::spawn(async move {
        let mut controller = PipelineController::new(pipeline_a);
        controller.run("query A").await.map(|_| controller)
    });
    let run_b = tokio::spawn(async move {
        let mut controller = PipelineController::new(pipeline_b);
        controller.run("query B").await.map(|_| controller)
    });
    let a = run_a.await.unwrap().unwrap();
    let b = run_b.await.unwrap().unwrap();

    assert!(a.state().store().read("only_in_b").is_none());
    assert!(b.state().store().read("only_in_a").is_none());
    assert_eq!(a.state().store().read(QUERY_KEY), Some("query A"));
    assert_eq!(b.state().store().read(QUERY_KEY), Some("query B"));
    assert_eq!(a.output(), Some("a_synth <- a_agent <- query A | "));
    assert_eq!(b.output(), Some("b_synth <-  | b_agent <- query B"));
}

#[tokio::test]
async fn one_pipeline_many_concurrent_runs() {
    let pipeline = Arc::new(
        research_pipeline(SUMMARY_CAP, |_| Some(Arc::new(ExtractiveLogic::default()) as Arc<dyn StageLogic>))
            .unwrap()
            .build()
            .unwrap(),
    );

    let runs = (0..4).map(|i| {
        let pipeline = Arc::clone(&pipeline);
        async move {
            let mut controller = PipelineController::new(pipeline);
            let output = controller.run(&format!("topic {i}")).await.unwrap();
            (i, output)
        }
    });
    for (i, output) in futures::future::join_all(runs).await {
        assert!(output.contains(&format!("topic {i}")));
        for j in (0..4).filter(|j| *j != i) {
            assert!(!output.contains(&format!("topic {j}")));
        }
    }
}

const SUMMARY_CAP: usize = 180;

// ── Full research run ──────────────────────────────────────────────

#[tokio::test]
async fn offline_research_run_keeps_only_summaries() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    let pipeline = research_pipeline(SUMMARY_CAP, |_| Some(Arc::new(ExtractiveLogic::default()) as Arc<dyn StageLogic>))
        .unwrap()
        .system_turn("You are part of a research pipeline.")
        .build()
        .unwrap();
    let mut controller = PipelineController::new(Arc::new(pipeline))
        .observe(move |event| seen.lock().unwrap().push(event.name()));

    let decision = controller.run("EV charging stations in Europe").await.unwrap();

    let snapshot = controller.snapshot();
    for topic in RESEARCH_TOPICS {
        assert!(!snapshot.contains_key(&raw_key(topic)), "{topic} raw survived");
        assert!(snapshot.contains_key(&summary_key(topic)), "{topic} summary missing");
    }
    assert_eq!(snapshot.get(DECISION_KEY), Some(&decision));

    let compactions = controller.compactions();
    assert_eq!(compactions.len(), 5);
    assert!(compactions.iter().all(|c| !c.exceeded_cap));
    assert!(compactions.iter().all(|c| c.summary_size_tokens <= SUMMARY_CAP));

    // User query plus six agent turns: the query is the one evicted.
    let window = controller.window();
    assert_eq!(window[0].role, TurnRole::System);
    assert_eq!(window.len(), 7);
    assert_eq!(window.last().map(|t| t.content.as_str()), Some(decision.as_str()));

    let events = events.lock().unwrap();
    assert_eq!(events.first(), Some(&"run_start"));
    assert_eq!(events.last(), Some(&"run_completed"));
    assert_eq!(events.iter().filter(|e| **e == "stage_start").count(), 11);
    assert_eq!(events.iter().filter(|e| **e == "token_input").count(), 5);

    let report = controller.report();
    assert_eq!(report.stages_executed.len(), 11);
    assert_eq!(report.evicted_turns, 1);
    assert!(report.window.iter().all(|t| t.role != TurnRole::User));
}

// ── File sinks ─────────────────────────────────────────────────────

#[tokio::test]
async fn jsonl_logs_are_written_per_run() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state_logs");
    let event_log = dir.path().join("token_log.jsonl");

    let controller = PipelineController::new(two_topic_pipeline(echo()));
    let run_id = controller.run_id().to_string();
    let mut controller = controller
        .with_state_sink(Arc::new(JsonlSink::for_run(&state_dir, &run_id)))
        .with_event_sink(Arc::new(JsonlSink::new(&event_log)));
    controller.run("EV charging").await.unwrap();

    let state_text = std::fs::read_to_string(state_dir.join(format!("{run_id}.jsonl"))).unwrap();
    let states: Vec<StateRecord> = state_text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert!(states.iter().all(|s| s.run_id == run_id));
    let last: &BTreeMap<String, String> = &states.last().unwrap().state;
    assert!(last.contains_key("decision"));
    assert!(!last.contains_key("a_raw"));

    let event_text = std::fs::read_to_string(&event_log).unwrap();
    let events: Vec<EventRecord> = event_text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let compaction = events.iter().find(|e| e.event == "compaction").unwrap();
    assert_eq!(compaction.payload["raw_key"], "a_raw");
    assert!(compaction.payload.contains_key("reduction_percent"));
    assert!(events.iter().any(|e| e.event == "stage_end"));
    assert_eq!(controller.diagnostics().failure_count(), 0);
}

#[tokio::test]
async fn unwritable_sink_never_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the log file should be makes every append fail.
    let blocked = dir.path().join("blocked.jsonl");
    std::fs::create_dir(&blocked).unwrap();

    let mut controller = PipelineController::new(two_topic_pipeline(echo()))
        .with_event_sink(Arc::new(JsonlSink::new(&blocked)));
    let result = controller.run("EV charging").await;

    assert!(result.is_ok());
    assert_eq!(controller.status(), &RunStatus::Completed);
    assert!(controller.diagnostics().failure_count() > 0);
    assert!(
        controller
            .diagnostics()
            .failures()
            .iter()
            .all(|f| f.sink == "events")
    );
}
