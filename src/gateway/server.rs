use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::stream::{ScopedEventStream, StreamFrame};
use crate::config::FinlensConfig;
use crate::context::ContextAssembler;
use crate::error::{Error, Result};
use crate::research::event::{PhaseEvent, SourceRef};
use crate::research::provider::{self, CompletionProvider};
use crate::research::tools::{HttpToolInvoker, ToolInvoker};
use crate::research::{ResearchOrchestrator, ResearchOutcome};
use crate::session::backend::MemoryBackend;
use crate::session::{SessionMode, SessionStore};

pub struct AppState {
    pub assembler: ContextAssembler,
    pub store: Arc<SessionStore>,
    pub provider: Arc<dyn CompletionProvider>,
    pub orchestrator: ResearchOrchestrator,
    pub config: FinlensConfig,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    /// Omitted on the first request from a fresh tab; the gateway mints one.
    #[serde(default = "new_session_id")]
    pub session_id: String,
    pub query: String,
    #[serde(default)]
    pub mode: SessionMode,
    pub current_url: Option<String>,
    pub user_timezone: Option<String>,
    pub user_time: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContextPush {
    pub session_id: String,
    pub source_type: String,
    pub content: String,
    pub url: Option<String>,
    pub extracted_data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ClearRequest {
    #[serde(default)]
    pub history: bool,
    #[serde(default)]
    pub fetched_context: bool,
    pub source_type: Option<String>,
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub async fn run(config: FinlensConfig) -> anyhow::Result<()> {
    let provider = provider::from_config(&config.llm)?;
    let tools: Arc<dyn ToolInvoker> = Arc::new(HttpToolInvoker::new(&config.tools));

    let store = Arc::new(SessionStore::new(
        Arc::new(MemoryBackend::new()),
        Duration::from_secs(config.sessions.ttl_secs),
        config.sessions.max_entries,
        config.sessions.sweep_every,
    ));
    let assembler = ContextAssembler::new(Arc::clone(&store));
    let orchestrator = ResearchOrchestrator::new(
        Arc::clone(&provider),
        tools,
        config.research.clone(),
        config.llm.temperature,
    );

    let addr = format!("{}:{}", config.gateway.bind, config.gateway.port);
    let state = Arc::new(AppState {
        assembler,
        store,
        provider,
        orchestrator,
        config,
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("finlens gateway listening on {addr}");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Build the router over an already-assembled state, so tests can serve it
/// with fake providers and tools behind the same routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/ask", post(ask_handler))
        .route("/v1/context", post(context_handler))
        .route("/v1/session/{id}/clear", post(clear_handler))
        // The extension calls from page origins, so CORS stays open.
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Ask a question about the current page. Responds with an SSE stream of
/// status/data frames terminated by `done` or `error`.
async fn ask_handler(State(state): State<Arc<AppState>>, Json(req): Json<AskRequest>) -> Response {
    if let Err(e) = prepare_session(&state, &req).await {
        error!(session = %req.session_id, error = %e, "failed to prepare session");
        return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
    }

    let (tx, rx) = mpsc::channel(32);
    let producer = tokio::spawn(run_ask(Arc::clone(&state), req, tx));

    Sse::new(ScopedEventStream::new(rx, producer))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Push page-scraped or search material into a session.
async fn context_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ContextPush>,
) -> impl IntoResponse {
    match state
        .assembler
        .add_fetched_context(
            &req.session_id,
            &req.source_type,
            &req.content,
            req.url,
            req.extracted_data,
        )
        .await
    {
        Ok(()) => (StatusCode::NO_CONTENT, String::new()),
        Err(e) => {
            warn!(session = %req.session_id, error = %e, "failed to add fetched context");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

/// Clear conversation history and/or fetched context, independently.
async fn clear_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<ClearRequest>,
) -> impl IntoResponse {
    if !req.history && !req.fetched_context {
        return (
            StatusCode::BAD_REQUEST,
            "nothing to clear: set history and/or fetched_context".to_string(),
        );
    }

    if req.history {
        if let Err(e) = state.assembler.clear_conversation_history(&session_id).await {
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    }
    if req.fetched_context {
        if let Err(e) = state
            .assembler
            .clear_fetched_context(&session_id, req.source_type.as_deref())
            .await
        {
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    }
    (StatusCode::OK, "cleared".to_string())
}

/// Record request metadata on the session and append the user message.
async fn prepare_session(state: &AppState, req: &AskRequest) -> Result<()> {
    let mut session = state.store.load(&req.session_id).await?;
    session.metadata.mode = req.mode;
    if let Some(url) = &req.current_url {
        session.metadata.current_url = Some(url.clone());
    }
    if let Some(tz) = &req.user_timezone {
        session.metadata.user_timezone = Some(tz.clone());
    }
    if let Some(time) = &req.user_time {
        session.metadata.user_time = Some(time.clone());
    }
    if let Some(prompt) = &req.system_prompt {
        session.system_prompt_override = Some(prompt.clone());
    }
    state.store.save(&req.session_id, session).await?;

    state
        .assembler
        .append_user_message(&req.session_id, &req.query, None)
        .await
}

struct Produced {
    answer: String,
    sources: Vec<SourceRef>,
    researched: bool,
}

/// Producer task behind the SSE stream. Owned by the `ScopedEventStream`
/// and aborted with it when the client disconnects.
async fn run_ask(state: Arc<AppState>, req: AskRequest, tx: mpsc::Sender<StreamFrame>) {
    let started = std::time::Instant::now();

    match produce_answer(&state, &req, &tx).await {
        Ok(produced) => {
            if !produced.answer.is_empty() {
                let sources_used = produced.sources.iter().map(|s| s.url.clone()).collect();
                let tools_used = if produced.researched {
                    vec![state.config.research.search_tool.clone()]
                } else {
                    Vec::new()
                };
                if let Err(e) = state
                    .assembler
                    .append_assistant_message(
                        &req.session_id,
                        &produced.answer,
                        &state.config.llm.model,
                        sources_used,
                        tools_used,
                        Some(started.elapsed().as_millis() as u64),
                    )
                    .await
                {
                    warn!(session = %req.session_id, error = %e, "failed to record assistant message");
                }
            }
            let _ = tx.send(StreamFrame::Done).await;
        }
        Err(Error::Cancelled) => {
            debug!(session = %req.session_id, "client disconnected mid-answer");
        }
        Err(e) => {
            // Post-content failure: the client sees a truncated answer
            // followed by an explicit error terminator.
            error!(session = %req.session_id, error = %e, "answer stream failed");
            let _ = tx.send(StreamFrame::Error(e.to_string())).await;
        }
    }
}

async fn produce_answer(
    state: &AppState,
    req: &AskRequest,
    tx: &mpsc::Sender<StreamFrame>,
) -> Result<Produced> {
    let session = state.store.load(&req.session_id).await?;
    let system = session
        .system_prompt_override
        .clone()
        .or_else(|| state.config.llm.system_prompt.clone());

    let messages: Vec<serde_json::Value> = state
        .assembler
        .formatted_messages_for_api(&req.session_id)
        .await?
        .iter()
        .map(|m| m.to_json())
        .collect();

    if req.mode == SessionMode::Research {
        let (ev_tx, mut ev_rx) = mpsc::channel(32);
        let frame_tx = tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = ev_rx.recv().await {
                if frame_tx.send(StreamFrame::Phase(event)).await.is_err() {
                    break;
                }
            }
        });

        let outcome = state
            .orchestrator
            .run(&req.query, &messages, system.as_deref(), ev_tx)
            .await;
        let _ = forward.await;

        match outcome? {
            ResearchOutcome::Completed { answer, sources } => {
                return Ok(Produced {
                    answer,
                    sources,
                    researched: true,
                });
            }
            ResearchOutcome::Bypass | ResearchOutcome::NoContent => {
                debug!(session = %req.session_id, "falling back to single-pass completion");
            }
        }
    }

    let answer = single_pass(state, &messages, system.as_deref(), tx).await?;
    Ok(Produced {
        answer,
        sources: Vec::new(),
        researched: false,
    })
}

/// Non-phased completion path: used directly for normal/thinking modes and
/// as the fallback when research produced no content.
async fn single_pass(
    state: &AppState,
    messages: &[serde_json::Value],
    system: Option<&str>,
    tx: &mpsc::Sender<StreamFrame>,
) -> Result<String> {
    let (tok_tx, mut tok_rx) = mpsc::channel(32);
    let handle = tokio::spawn(provider::complete_streaming_with_retry(
        Arc::clone(&state.provider),
        messages.to_vec(),
        system.map(str::to_string),
        state.config.llm.temperature,
        tok_tx,
    ));

    let mut answer = String::new();
    while let Some(text) = tok_rx.recv().await {
        answer.push_str(&text);
        tx.send(StreamFrame::Phase(PhaseEvent::Content { text }))
            .await
            .map_err(|_| Error::Cancelled)?;
    }

    match handle.await {
        Ok(result) => result?,
        Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
        Err(e) => {
            return Err(Error::CompletionFailed(format!(
                "completion task failed: {e}"
            )));
        }
    }
    Ok(answer)
}
