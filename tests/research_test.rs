use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use finlens::config::ResearchConfig;
use finlens::error::{Error, Result};
use finlens::research::event::{PhaseEvent, truncate_detail};
use finlens::research::provider::CompletionProvider;
use finlens::research::tools::ToolInvoker;
use finlens::research::{ResearchOrchestrator, ResearchOutcome};
use serde_json::json;
use tokio::sync::mpsc;

// =============================================================
// Scripted collaborators
// =============================================================

enum StreamScript {
    Chunks(Vec<String>),
    FailBeforeContent,
    FailAfterChunks(Vec<String>),
    RejectTemperature,
}

#[derive(Default)]
struct ScriptedProvider {
    completions: Mutex<VecDeque<String>>,
    streams: Mutex<VecDeque<StreamScript>>,
    stream_temperatures: Mutex<Vec<Option<f32>>>,
}

fn scripted(completions: &[&str], streams: Vec<StreamScript>) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider {
        completions: Mutex::new(completions.iter().map(|s| s.to_string()).collect()),
        streams: Mutex::new(streams.into()),
        stream_temperatures: Mutex::new(Vec::new()),
    })
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(
        &self,
        _messages: &[serde_json::Value],
        _system: Option<&str>,
        _temperature: Option<f32>,
    ) -> Result<String> {
        self.completions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::CompletionFailed("no scripted completion".into()))
    }

    async fn complete_streaming(
        &self,
        _messages: &[serde_json::Value],
        _system: Option<&str>,
        temperature: Option<f32>,
        tx: mpsc::Sender<String>,
    ) -> Result<()> {
        self.stream_temperatures.lock().unwrap().push(temperature);
        let script = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::CompletionFailed("no scripted stream".into()))?;

        match script {
            StreamScript::Chunks(chunks) => {
                for chunk in chunks {
                    if tx.send(chunk).await.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
                Ok(())
            }
            StreamScript::FailBeforeContent => Err(Error::CompletionFailed("provider down".into())),
            StreamScript::FailAfterChunks(chunks) => {
                for chunk in chunks {
                    if tx.send(chunk).await.is_err() {
                        return Err(Error::Cancelled);
                    }
                }
                Err(Error::CompletionFailed("stream broke".into()))
            }
            StreamScript::RejectTemperature => Err(Error::TemperatureRejected),
        }
    }
}

/// Search tool that answers every query with one result, after an optional
/// per-query delay (to control completion order under paused time).
struct DelayTool {
    delays: HashMap<String, u64>,
}

impl DelayTool {
    fn instant() -> Arc<Self> {
        Arc::new(Self {
            delays: HashMap::new(),
        })
    }

    fn with_delays(delays: &[(&str, u64)]) -> Arc<Self> {
        Arc::new(Self {
            delays: delays
                .iter()
                .map(|(q, ms)| (q.to_string(), *ms))
                .collect(),
        })
    }
}

#[async_trait]
impl ToolInvoker for DelayTool {
    async fn invoke(
        &self,
        _tool_name: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let query = params
            .get("query")
            .and_then(|q| q.as_str())
            .unwrap_or_default()
            .to_string();
        if let Some(ms) = self.delays.get(&query) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        Ok(json!({
            "results": [{
                "url": format!("https://research.example/{}", query.replace(' ', "-")),
                "title": query,
                "snippet": "finding",
            }]
        }))
    }
}

/// Tool that always returns the same URL, for deduplication tests.
struct FixedUrlTool;

#[async_trait]
impl ToolInvoker for FixedUrlTool {
    async fn invoke(
        &self,
        _tool_name: &str,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Ok(json!({
            "results": [{ "url": "https://research.example/same", "snippet": "finding" }]
        }))
    }
}

struct FailingTool;

#[async_trait]
impl ToolInvoker for FailingTool {
    async fn invoke(
        &self,
        tool_name: &str,
        _params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        Err(Error::Tool {
            tool: tool_name.to_string(),
            message: "search backend down".into(),
        })
    }
}

// =============================================================
// Helpers
// =============================================================

fn research_config() -> ResearchConfig {
    ResearchConfig {
        max_subquestions: 4,
        max_followups: 2,
        budget_secs: 60,
        search_tool: "web_search".into(),
    }
}

fn orchestrator(
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<dyn ToolInvoker>,
) -> ResearchOrchestrator {
    ResearchOrchestrator::new(provider, tools, research_config(), Some(0.7))
}

fn complex(sub_questions: &[&str]) -> String {
    json!({ "complexity": "complex", "sub_questions": sub_questions }).to_string()
}

fn gaps(items: &[&str]) -> String {
    json!({ "gaps": items }).to_string()
}

const NO_GAPS: &str = r#"{"gaps": []}"#;

async fn run_collect(
    orch: &ResearchOrchestrator,
    query: &str,
) -> (Result<ResearchOutcome>, Vec<PhaseEvent>) {
    let (tx, mut rx) = mpsc::channel(64);
    let collector = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    let outcome = orch.run(query, &[], None, tx).await;
    let events = collector.await.unwrap();
    (outcome, events)
}

fn researching_details(events: &[PhaseEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            PhaseEvent::Status { label, detail } if label == "Researching" => detail.clone(),
            _ => None,
        })
        .collect()
}

fn content_indices(events: &[PhaseEvent]) -> Vec<usize> {
    events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, PhaseEvent::Content { .. }))
        .map(|(i, _)| i)
        .collect()
}

// =============================================================
// Bypass and analysis
// =============================================================

#[tokio::test]
async fn simple_query_bypasses_with_zero_events() {
    let provider = scripted(&[r#"{"complexity": "simple", "sub_questions": []}"#], vec![]);
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "what is a P/E ratio").await;
    assert_eq!(outcome.unwrap(), ResearchOutcome::Bypass);
    assert!(events.is_empty());
}

#[tokio::test]
async fn unparseable_analysis_is_treated_as_simple() {
    let provider = scripted(&["I could not decide, sorry."], vec![]);
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "hello").await;
    assert_eq!(outcome.unwrap(), ResearchOutcome::Bypass);
    assert!(events.is_empty());
}

// =============================================================
// Ordering
// =============================================================

#[tokio::test]
async fn sources_precede_first_content() {
    let provider = scripted(
        &[&complex(&["q1 history", "q2 outlook"]), NO_GAPS],
        vec![StreamScript::Chunks(vec!["Hello ".into(), "world".into()])],
    );
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "complex question").await;

    match outcome.unwrap() {
        ResearchOutcome::Completed { answer, sources } => {
            assert_eq!(answer, "Hello world");
            assert_eq!(sources.len(), 2);
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    // Planning status comes first.
    assert_eq!(
        events[0],
        PhaseEvent::status("Planning research", "Identified 2 sub-questions")
    );

    let source_positions: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, PhaseEvent::Source { .. }))
        .map(|(i, _)| i)
        .collect();
    let contents = content_indices(&events);

    assert_eq!(source_positions.len(), 1);
    assert!(!contents.is_empty());
    assert!(source_positions[0] < contents[0]);
}

#[tokio::test(start_paused = true)]
async fn researching_status_follows_completion_order() {
    let provider = scripted(&[&complex(&["q1", "q2", "q3"]), NO_GAPS], vec![
        StreamScript::Chunks(vec!["done".into()]),
    ]);
    let tools = DelayTool::with_delays(&[("q1", 30), ("q2", 10), ("q3", 50)]);
    let orch = orchestrator(provider, tools);

    let (outcome, events) = run_collect(&orch, "complex question").await;
    assert!(matches!(
        outcome.unwrap(),
        ResearchOutcome::Completed { .. }
    ));

    // Completion order, not submission order.
    assert_eq!(researching_details(&events), vec!["q2", "q1", "q3"]);
}

// =============================================================
// Truncation
// =============================================================

#[test]
fn detail_truncation_boundary() {
    let s80 = "a".repeat(80);
    assert_eq!(truncate_detail(&s80), s80);

    let s81 = "a".repeat(81);
    let truncated = truncate_detail(&s81);
    assert_eq!(truncated.len(), 83);
    assert_eq!(truncated, format!("{}...", "a".repeat(80)));

    let s83 = "b".repeat(83);
    assert_eq!(truncate_detail(&s83), format!("{}...", "b".repeat(80)));
}

#[tokio::test]
async fn long_subquestion_truncated_in_status_detail() {
    let long = "q".repeat(83);
    let provider = scripted(&[&complex(&[&long]), NO_GAPS], vec![StreamScript::Chunks(
        vec!["ok".into()],
    )]);
    let orch = orchestrator(provider, DelayTool::instant());

    let (_, events) = run_collect(&orch, "complex question").await;
    let details = researching_details(&events);
    assert_eq!(details, vec![format!("{}...", "q".repeat(80))]);
}

// =============================================================
// Fallback boundary
// =============================================================

#[tokio::test]
async fn failure_before_content_ends_sequence_cleanly() {
    let provider = scripted(&[&complex(&["q1"]), NO_GAPS], vec![
        StreamScript::FailBeforeContent,
    ]);
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "complex question").await;
    assert_eq!(outcome.unwrap(), ResearchOutcome::NoContent);
    assert!(content_indices(&events).is_empty());
}

#[tokio::test]
async fn failed_synthesis_leaves_no_dangling_citations() {
    // The search produced sources, but synthesis never yields a fragment.
    // The client must not receive a Source event for an answer the
    // fallback path will not be based on.
    let provider = scripted(&[&complex(&["q1", "q2"]), NO_GAPS], vec![
        StreamScript::FailBeforeContent,
    ]);
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "complex question").await;
    assert_eq!(outcome.unwrap(), ResearchOutcome::NoContent);
    assert!(!events.iter().any(|e| matches!(e, PhaseEvent::Source { .. })));
}

#[tokio::test]
async fn empty_synthesis_emits_no_source_event() {
    let provider = scripted(&[&complex(&["q1"]), NO_GAPS], vec![StreamScript::Chunks(
        vec![],
    )]);
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "complex question").await;
    assert_eq!(outcome.unwrap(), ResearchOutcome::NoContent);
    assert!(!events.iter().any(|e| matches!(e, PhaseEvent::Source { .. })));
}

#[tokio::test]
async fn failure_after_content_propagates() {
    let provider = scripted(&[&complex(&["q1"]), NO_GAPS], vec![
        StreamScript::FailAfterChunks(vec!["partial ".into()]),
    ]);
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "complex question").await;
    assert!(matches!(outcome, Err(Error::CompletionFailed(_))));
    assert_eq!(content_indices(&events).len(), 1);
}

#[tokio::test]
async fn empty_synthesis_is_no_content() {
    let provider = scripted(&[&complex(&["q1"]), NO_GAPS], vec![StreamScript::Chunks(
        vec![],
    )]);
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, _) = run_collect(&orch, "complex question").await;
    assert_eq!(outcome.unwrap(), ResearchOutcome::NoContent);
}

// =============================================================
// Temperature shim
// =============================================================

#[tokio::test]
async fn temperature_rejection_retried_once_without_parameter() {
    let provider = scripted(&[&complex(&["q1"]), NO_GAPS], vec![
        StreamScript::RejectTemperature,
        StreamScript::Chunks(vec!["ok".into()]),
    ]);
    let orch = orchestrator(Arc::clone(&provider) as Arc<dyn CompletionProvider>, DelayTool::instant());

    let (outcome, _) = run_collect(&orch, "complex question").await;
    match outcome.unwrap() {
        ResearchOutcome::Completed { answer, .. } => assert_eq!(answer, "ok"),
        other => panic!("expected Completed, got {other:?}"),
    }

    let temps = provider.stream_temperatures.lock().unwrap().clone();
    assert_eq!(temps, vec![Some(0.7), None]);
}

#[tokio::test]
async fn double_temperature_rejection_falls_back() {
    let provider = scripted(&[&complex(&["q1"]), NO_GAPS], vec![
        StreamScript::RejectTemperature,
        StreamScript::RejectTemperature,
    ]);
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "complex question").await;
    assert_eq!(outcome.unwrap(), ResearchOutcome::NoContent);
    assert!(content_indices(&events).is_empty());
}

// =============================================================
// Tool failures, gaps, budget
// =============================================================

#[tokio::test]
async fn tool_failure_is_absorbed_per_subquestion() {
    let provider = scripted(&[&complex(&["q1", "q2"]), NO_GAPS], vec![
        StreamScript::Chunks(vec!["answer".into()]),
    ]);
    let orch = orchestrator(provider, Arc::new(FailingTool));

    let (outcome, events) = run_collect(&orch, "complex question").await;
    match outcome.unwrap() {
        ResearchOutcome::Completed { answer, sources } => {
            assert_eq!(answer, "answer");
            assert!(sources.is_empty());
        }
        other => panic!("expected Completed, got {other:?}"),
    }
    // Nothing fetched, so no Source event was emitted.
    assert!(!events.iter().any(|e| matches!(e, PhaseEvent::Source { .. })));
    assert_eq!(researching_details(&events).len(), 2);
}

#[tokio::test]
async fn followup_results_feed_synthesis() {
    let provider = scripted(
        &[&complex(&["q1"]), &gaps(&["missing revenue figures"]), NO_GAPS],
        vec![StreamScript::Chunks(vec!["done".into()])],
    );
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "complex question").await;
    match outcome.unwrap() {
        ResearchOutcome::Completed { sources, .. } => {
            assert!(sources.iter().any(|s| s.url.contains("missing-revenue-figures")));
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    let followups: Vec<&PhaseEvent> = events
        .iter()
        .filter(|e| matches!(e, PhaseEvent::Status { label, .. } if label == "Follow-up research"))
        .collect();
    assert_eq!(followups.len(), 1);
}

#[tokio::test]
async fn followup_limit_reached_falls_back() {
    // Gap detection never settles; the cap trips before content exists.
    let provider = scripted(
        &[
            &complex(&["q1"]),
            &gaps(&["g1"]),
            &gaps(&["g2"]),
            &gaps(&["g3"]),
        ],
        vec![],
    );
    let orch = orchestrator(provider, DelayTool::instant());

    let (outcome, events) = run_collect(&orch, "complex question").await;
    assert_eq!(outcome.unwrap(), ResearchOutcome::NoContent);

    let followups = events
        .iter()
        .filter(|e| matches!(e, PhaseEvent::Status { label, .. } if label == "Follow-up research"))
        .count();
    assert_eq!(followups, 2);
}

#[tokio::test(start_paused = true)]
async fn budget_exhaustion_before_content_falls_back() {
    let provider = scripted(&[&complex(&["q1"])], vec![]);
    let tools = DelayTool::with_delays(&[("q1", 120_000)]);
    let config = ResearchConfig {
        budget_secs: 1,
        ..research_config()
    };
    let orch = ResearchOrchestrator::new(provider, tools, config, None);

    let (outcome, events) = run_collect(&orch, "complex question").await;
    assert_eq!(outcome.unwrap(), ResearchOutcome::NoContent);
    assert!(content_indices(&events).is_empty());
}

#[tokio::test]
async fn duplicate_sources_deduplicated_by_url() {
    let provider = scripted(&[&complex(&["q1", "q2"]), NO_GAPS], vec![
        StreamScript::Chunks(vec!["answer".into()]),
    ]);
    let orch = orchestrator(provider, Arc::new(FixedUrlTool));

    let (outcome, events) = run_collect(&orch, "complex question").await;
    match outcome.unwrap() {
        ResearchOutcome::Completed { sources, .. } => assert_eq!(sources.len(), 1),
        other => panic!("expected Completed, got {other:?}"),
    }

    let source_event = events
        .iter()
        .find_map(|e| match e {
            PhaseEvent::Source { items } => Some(items.clone()),
            _ => None,
        })
        .expect("source event");
    assert_eq!(source_event.len(), 1);
    assert_eq!(source_event[0].url, "https://research.example/same");
}
