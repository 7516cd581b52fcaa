pub mod event;
pub mod provider;
pub mod tools;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ResearchConfig;
use crate::error::{Error, Result};
use event::{PhaseEvent, SourceRef, truncate_detail};
use provider::CompletionProvider;
use tools::ToolInvoker;

/// How a research run ended, from the caller's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum ResearchOutcome {
    /// Simple query. Zero events were emitted; use the cheaper
    /// single-pass path instead.
    Bypass,
    /// The pipeline produced no content (failure or empty synthesis
    /// before the first fragment). Fall back to the single-pass path.
    NoContent,
    /// A full phased answer was streamed.
    Completed {
        answer: String,
        sources: Vec<SourceRef>,
    },
}

/// One resolved sub-question.
#[derive(Debug, Clone)]
struct SubResult {
    question: String,
    findings: String,
    sources: Vec<SourceRef>,
}

/// Event channel wrapper tracking the one flag the fallback boundary
/// hangs on: whether any Content event has shipped. Status and Source
/// activity never sets it.
struct EventSink {
    tx: mpsc::Sender<PhaseEvent>,
    content_emitted: AtomicBool,
}

impl EventSink {
    fn new(tx: mpsc::Sender<PhaseEvent>) -> Self {
        Self {
            tx,
            content_emitted: AtomicBool::new(false),
        }
    }

    async fn emit(&self, event: PhaseEvent) -> Result<()> {
        let is_content = event.is_content();
        self.tx.send(event).await.map_err(|_| Error::Cancelled)?;
        if is_content {
            self.content_emitted.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    fn content_emitted(&self) -> bool {
        self.content_emitted.load(Ordering::Relaxed)
    }
}

/// Multi-phase research pipeline:
/// query analysis -> bypass | planning -> parallel sub-question execution
/// -> gap detection -> bounded follow-up -> synthesis.
///
/// Failures before the first Content event end the sequence cleanly as
/// `NoContent`; failures after it propagate, since switching answer paths
/// mid-stream would corrupt what the user already saw.
pub struct ResearchOrchestrator {
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<dyn ToolInvoker>,
    config: ResearchConfig,
    temperature: Option<f32>,
}

impl ResearchOrchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        tools: Arc<dyn ToolInvoker>,
        config: ResearchConfig,
        temperature: Option<f32>,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
            temperature,
        }
    }

    /// Run the pipeline for one request, emitting events through `tx`.
    ///
    /// The whole run is bounded by the configured wall-clock budget;
    /// exhaustion behaves like any other pre/post-Content failure.
    pub async fn run(
        &self,
        query: &str,
        context: &[serde_json::Value],
        system: Option<&str>,
        tx: mpsc::Sender<PhaseEvent>,
    ) -> Result<ResearchOutcome> {
        let sink = EventSink::new(tx);
        let budget = Duration::from_secs(self.config.budget_secs);

        match timeout(budget, self.pipeline(query, context, system, &sink)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => self.resolve_failure(err, &sink),
            Err(_) => self.resolve_failure(Error::BudgetExhausted(budget), &sink),
        }
    }

    /// Apply the fallback boundary: absorb pre-Content failures, surface
    /// post-Content ones.
    fn resolve_failure(&self, err: Error, sink: &EventSink) -> Result<ResearchOutcome> {
        match &err {
            Error::Cancelled => debug!("research cancelled by consumer"),
            Error::BudgetExhausted(budget) => warn!(?budget, "research budget exhausted"),
            Error::MaxTurnsExceeded(limit) => warn!(limit, "follow-up iteration limit reached"),
            other => warn!(error = %other, "research pipeline failed"),
        }
        if sink.content_emitted() {
            Err(err)
        } else {
            Ok(ResearchOutcome::NoContent)
        }
    }

    async fn pipeline(
        &self,
        query: &str,
        context: &[serde_json::Value],
        system: Option<&str>,
        sink: &EventSink,
    ) -> Result<ResearchOutcome> {
        // QUERY_ANALYSIS: simple queries terminate before any event.
        let Some(mut sub_questions) = self.analyze_query(query, context, system).await? else {
            debug!("query classified simple, bypassing research");
            return Ok(ResearchOutcome::Bypass);
        };
        sub_questions.truncate(self.config.max_subquestions);
        if sub_questions.is_empty() {
            return Ok(ResearchOutcome::Bypass);
        }

        // PLANNING
        sink.emit(PhaseEvent::status(
            "Planning research",
            format!("Identified {} sub-questions", sub_questions.len()),
        ))
        .await?;

        // SUBQUESTION_EXECUTION: fan out, report in completion order so
        // visible progress tracks actual latency.
        let mut results: Vec<SubResult> = Vec::new();
        let mut in_flight = FuturesUnordered::new();
        for question in &sub_questions {
            let question = question.clone();
            in_flight.push(async move {
                let resolved = self.resolve_question(&question).await;
                (question, resolved)
            });
        }
        while let Some((question, resolved)) = in_flight.next().await {
            sink.emit(PhaseEvent::status("Researching", truncate_detail(&question)))
                .await?;
            results.push(resolved?);
        }

        // GAP_DETECTION / FOLLOWUP: bounded rounds; gaps still open at the
        // cap surface as MaxTurnsExceeded and fall under the fallback rule.
        let mut rounds = 0;
        loop {
            sink.emit(PhaseEvent::status("Evaluating results", "Checking completeness"))
                .await?;
            let gaps = self.detect_gaps(query, &results, system).await?;
            if gaps.is_empty() {
                break;
            }
            if rounds >= self.config.max_followups {
                return Err(Error::MaxTurnsExceeded(self.config.max_followups));
            }
            rounds += 1;
            for gap in gaps {
                sink.emit(PhaseEvent::status("Follow-up research", truncate_detail(&gap)))
                    .await?;
                results.push(self.resolve_question(&gap).await?);
            }
        }

        // SYNTHESIS: sources first (deduplicated by URL, first-seen order),
        // then streamed content. The Source event is held back until the
        // first fragment arrives, so a synthesis that dies without content
        // never leaves the client holding citations the fallback answer
        // is not based on.
        let sources = dedup_sources(&results);
        let answer = self
            .stream_synthesis(query, context, &results, &sources, system, sink)
            .await?;
        if answer.is_empty() {
            debug!("synthesis produced no content");
            return Ok(ResearchOutcome::NoContent);
        }

        Ok(ResearchOutcome::Completed { answer, sources })
    }

    /// Classify the query; `None` means simple (bypass), `Some` carries the
    /// ordered sub-questions of a complex query.
    async fn analyze_query(
        &self,
        query: &str,
        context: &[serde_json::Value],
        system: Option<&str>,
    ) -> Result<Option<Vec<String>>> {
        let mut messages = context.to_vec();
        messages.push(serde_json::json!({
            "role": "user",
            "content": format!(
                "Classify this finance question and decompose it if complex.\n\
                 Question: {query}\n\
                 Respond with only JSON: \
                 {{\"complexity\": \"simple\" | \"complex\", \"sub_questions\": [\"...\"]}}"
            ),
        }));

        let text = self.provider.complete(&messages, system, None).await?;
        let Some(parsed) = extract_json_object(&text) else {
            debug!("unparseable query analysis, treating as simple");
            return Ok(None);
        };

        if parsed.get("complexity").and_then(|c| c.as_str()) != Some("complex") {
            return Ok(None);
        }

        let sub_questions = parsed
            .get("sub_questions")
            .and_then(|s| s.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|q| q.as_str())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(Some(sub_questions))
    }

    /// Resolve one sub-question or follow-up via the search tool.
    /// Tool failure means an empty contribution, not a dead pipeline.
    async fn resolve_question(&self, question: &str) -> Result<SubResult> {
        let params = serde_json::json!({ "query": question });
        let value = match self.tools.invoke(&self.config.search_tool, params).await {
            Ok(value) => value,
            Err(Error::Tool { tool, message }) => {
                debug!(%tool, %message, "sub-question produced no usable result");
                return Ok(SubResult {
                    question: question.to_string(),
                    findings: String::new(),
                    sources: Vec::new(),
                });
            }
            Err(other) => return Err(other),
        };

        let mut findings = Vec::new();
        let mut sources = Vec::new();
        if let Some(items) = value.get("results").and_then(|r| r.as_array()) {
            for item in items {
                let url = item.get("url").and_then(|u| u.as_str());
                let title = item.get("title").and_then(|t| t.as_str());
                let snippet = item
                    .get("snippet")
                    .or_else(|| item.get("content"))
                    .and_then(|s| s.as_str())
                    .unwrap_or_default();
                findings.push(match title {
                    Some(title) => format!("- {title}: {snippet}"),
                    None => format!("- {snippet}"),
                });
                if let Some(url) = url {
                    sources.push(SourceRef {
                        url: url.to_string(),
                        title: title.map(str::to_string),
                    });
                }
            }
        } else {
            findings.push(value.to_string());
        }

        Ok(SubResult {
            question: question.to_string(),
            findings: findings.join("\n"),
            sources,
        })
    }

    /// Ask the provider whether the gathered results leave the original
    /// question insufficiently answered. Unparseable output means no gaps.
    async fn detect_gaps(
        &self,
        query: &str,
        results: &[SubResult],
        system: Option<&str>,
    ) -> Result<Vec<String>> {
        let messages = vec![serde_json::json!({
            "role": "user",
            "content": format!(
                "Question: {query}\n\nResearch findings:\n{}\n\n\
                 If the findings adequately answer the question, respond with \
                 only {{\"gaps\": []}}. Otherwise list the missing aspects as \
                 short follow-up questions: {{\"gaps\": [\"...\"]}}",
                digest(results)
            ),
        })];

        let text = self.provider.complete(&messages, system, None).await?;
        let gaps = extract_json_object(&text)
            .and_then(|parsed| {
                parsed.get("gaps").and_then(|g| g.as_array()).map(|items| {
                    items
                        .iter()
                        .filter_map(|g| g.as_str())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
            })
            .unwrap_or_default();
        Ok(gaps)
    }

    /// Stream the final answer token-by-token, emitting the Source event
    /// just ahead of the first Content fragment and forwarding every
    /// fragment after it. Retries once without temperature if the provider
    /// rejects the parameter.
    async fn stream_synthesis(
        &self,
        query: &str,
        context: &[serde_json::Value],
        results: &[SubResult],
        sources: &[SourceRef],
        system: Option<&str>,
        sink: &EventSink,
    ) -> Result<String> {
        let mut messages = context.to_vec();
        messages.push(serde_json::json!({
            "role": "user",
            "content": format!(
                "Using the research findings below, answer the question.\n\n\
                 Findings:\n{}\n\nQuestion: {query}",
                digest(results)
            ),
        }));

        let (tok_tx, mut tok_rx) = mpsc::channel(32);
        let handle = tokio::spawn(provider::complete_streaming_with_retry(
            Arc::clone(&self.provider),
            messages,
            system.map(str::to_string),
            self.temperature,
            tok_tx,
        ));

        let mut answer = String::new();
        let mut sources_sent = false;
        while let Some(text) = tok_rx.recv().await {
            if !sources_sent {
                sources_sent = true;
                if !sources.is_empty() {
                    sink.emit(PhaseEvent::Source {
                        items: sources.to_vec(),
                    })
                    .await?;
                }
            }
            answer.push_str(&text);
            sink.emit(PhaseEvent::Content { text }).await?;
        }

        match handle.await {
            Ok(result) => result?,
            Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
            Err(e) => return Err(Error::CompletionFailed(format!("synthesis task failed: {e}"))),
        }
        Ok(answer)
    }
}

fn digest(results: &[SubResult]) -> String {
    results
        .iter()
        .map(|r| format!("### {}\n{}", r.question, r.findings))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Deduplicate accumulated sources by URL, keeping first-seen order.
fn dedup_sources(results: &[SubResult]) -> Vec<SourceRef> {
    let mut sources: Vec<SourceRef> = Vec::new();
    for result in results {
        for source in &result.sources {
            if !sources.iter().any(|s| s.url == source.url) {
                sources.push(source.clone());
            }
        }
    }
    sources
}

/// Lenient JSON extraction for model output: direct parse first, then the
/// outermost brace-delimited span (models like to wrap JSON in prose).
fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
