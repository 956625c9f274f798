use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::engine::{ConversationEngine, EngineEvent};
use crate::session::{Role, ToolEvent};
use crate::settings::EffectiveSettings;
use crate::storage::SessionRepository;
use crate::tools::{AvailableFunctions, InvocationStatus, ToolDescriptor, ToolInvocation, Tooling};

pub const EMPTY_REPLY_FALLBACK: &str =
    "Sorry, the model returned an empty response. Please try again or rephrase your message.";

/// Wire event of a streamed turn. `Done` or `Error` always comes last.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Token { content: String },
    Tool { name: String, arguments: Value, result: String, status: InvocationStatus },
    Done { session_id: String },
    Error { message: String },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::Tool { .. } => "tool",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }

    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

impl From<&ToolInvocation> for StreamEvent {
    fn from(inv: &ToolInvocation) -> Self {
        StreamEvent::Tool {
            name: inv.name.clone(),
            arguments: inv.arguments.clone(),
            result: inv.result.clone(),
            status: inv.status,
        }
    }
}

pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    pub tooling: Option<Tooling>,
    /// Generation settings for this turn; the engine keeps its own when absent.
    pub settings: Option<EffectiveSettings>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub session_id: String,
    pub response: String,
    pub tool_events: Vec<ToolInvocation>,
    pub failed: bool,
}

/// Starts a streamed turn and returns the ordered event sequence.
///
/// The engine lock is held for the whole turn, so turns on one session queue up.
pub fn stream_turn(
    engine: Arc<Mutex<ConversationEngine>>,
    repo: Arc<dyn SessionRepository>,
    request: TurnRequest,
) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let terminal = drive(&engine, repo.as_ref(), &request, &tx).await;
        if tx.send(terminal).await.is_err() {
            debug!(session_id = %request.session_id, "stream consumer left before the end");
        }
    });
    rx
}

async fn drive(
    engine: &Mutex<ConversationEngine>,
    repo: &dyn SessionRepository,
    request: &TurnRequest,
    tx: &mpsc::Sender<StreamEvent>,
) -> StreamEvent {
    let session_id = request.session_id.as_str();
    let mut engine = engine.lock().await;
    apply_settings(&mut engine, request.settings.as_ref());
    metrics::counter!("parley_turns_total", "mode" => "stream").increment(1);

    if let Err(e) = record_user_turn(repo, session_id, &request.message).await {
        return persistence_failure(session_id, e);
    }

    let (descriptors, functions) = split_tooling(request.tooling.as_ref());
    let (etx, mut erx) = mpsc::channel::<EngineEvent>(64);
    let generation = async {
        let etx = etx;
        engine.send_stream(&request.message, descriptors, functions, &etx).await
    };
    let forward = async {
        let mut tokens = 0usize;
        let mut invocations = Vec::new();
        while let Some(event) = erx.recv().await {
            match event {
                EngineEvent::Token(content) => {
                    tokens += 1;
                    let _ = tx.send(StreamEvent::Token { content }).await;
                }
                // tool events follow every token
                EngineEvent::Tool(invocation) => invocations.push(invocation),
            }
        }
        (tokens, invocations)
    };
    let (outcome, (tokens, invocations)) = tokio::join!(generation, forward);

    let text = match outcome {
        Ok(text) => text,
        Err(e) => {
            error!(session_id, error = %e, "streamed turn failed");
            metrics::counter!("parley_turn_errors_total").increment(1);
            return StreamEvent::Error { message: e.user_message() };
        }
    };

    for invocation in &invocations {
        let _ = tx.send(StreamEvent::from(invocation)).await;
        record_tool_event(repo, session_id, invocation).await;
    }

    let text = if tokens == 0 && invocations.is_empty() {
        warn!(session_id, "model produced an empty reply");
        let _ = tx
            .send(StreamEvent::Token { content: EMPTY_REPLY_FALLBACK.to_string() })
            .await;
        EMPTY_REPLY_FALLBACK.to_string()
    } else {
        text
    };

    if let Err(e) = record_assistant_turn(repo, session_id, &text).await {
        return persistence_failure(session_id, e);
    }
    StreamEvent::Done { session_id: session_id.to_string() }
}

/// Runs a turn to completion without streaming.
pub async fn respond(
    engine: &Mutex<ConversationEngine>,
    repo: &dyn SessionRepository,
    request: TurnRequest,
) -> anyhow::Result<TurnReply> {
    let session_id = request.session_id.as_str();
    let mut engine = engine.lock().await;
    apply_settings(&mut engine, request.settings.as_ref());
    metrics::counter!("parley_turns_total", "mode" => "single").increment(1);
    record_user_turn(repo, session_id, &request.message).await?;

    let (descriptors, functions) = split_tooling(request.tooling.as_ref());
    let text = match engine.try_send(&request.message, descriptors, functions).await {
        Ok(text) => text,
        Err(e) => {
            error!(session_id, error = %e, "turn failed");
            metrics::counter!("parley_turn_errors_total").increment(1);
            return Ok(TurnReply {
                session_id: session_id.to_string(),
                response: e.user_message(),
                tool_events: Vec::new(),
                failed: true,
            });
        }
    };

    let tool_events = engine.last_invocations().to_vec();
    for invocation in &tool_events {
        record_tool_event(repo, session_id, invocation).await;
    }
    let text = if text.trim().is_empty() && tool_events.is_empty() {
        EMPTY_REPLY_FALLBACK.to_string()
    } else {
        text
    };
    record_assistant_turn(repo, session_id, &text).await?;
    Ok(TurnReply {
        session_id: session_id.to_string(),
        response: text,
        tool_events,
        failed: false,
    })
}

fn apply_settings(engine: &mut ConversationEngine, settings: Option<&EffectiveSettings>) {
    if let Some(s) = settings {
        engine.set_params(s.model_params.clone(), s.retrieval_top_k);
    }
}

fn split_tooling(tooling: Option<&Tooling>) -> (Option<&[ToolDescriptor]>, Option<&AvailableFunctions>) {
    match tooling {
        Some(t) => (Some(t.descriptors.as_slice()), t.functions.as_ref()),
        None => (None, None),
    }
}

async fn record_user_turn(repo: &dyn SessionRepository, session_id: &str, message: &str) -> anyhow::Result<()> {
    repo.append_message(session_id, Role::User, message).await?;
    repo.update_last_active(session_id).await
}

async fn record_assistant_turn(repo: &dyn SessionRepository, session_id: &str, text: &str) -> anyhow::Result<()> {
    if !text.is_empty() {
        repo.append_message(session_id, Role::Assistant, text).await?;
    }
    repo.update_last_active(session_id).await
}

async fn record_tool_event(repo: &dyn SessionRepository, session_id: &str, invocation: &ToolInvocation) {
    let event = ToolEvent {
        id: Uuid::new_v4().to_string(),
        tool: invocation.name.clone(),
        arguments: invocation.arguments.clone(),
        result: invocation.result.clone(),
        status: invocation.status.as_str().to_string(),
        created_at: Utc::now(),
    };
    if let Err(e) = repo.append_tool_event(session_id, &event).await {
        warn!(session_id, tool = %invocation.name, error = %e, "failed to record tool event");
    }
}

fn persistence_failure(session_id: &str, e: anyhow::Error) -> StreamEvent {
    error!(session_id, error = %e, "failed to persist turn");
    metrics::counter!("parley_turn_errors_total").increment(1);
    StreamEvent::Error { message: format!("Sorry, the conversation could not be saved: {e}") }
}
