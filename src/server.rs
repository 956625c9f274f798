use std::convert::Infallible;
use std::path::PathBuf;
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    routing::{get, post},
};
use futures_util::stream::{self, Stream};
use metrics_exporter_prometheus::PrometheusHandle;
use rust_mcp_schema::Implementation;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agents::{AGENTS, AgentKind, AgentParts, DEFAULT_AGENT, find_agent};
use crate::engine::{Capability, ConversationEngine, EngineConfig};
use crate::error::{AdapterError, EngineError, ModelError};
use crate::mcp::functions::{call_with_reconnect, tooling_for};
use crate::mcp::{AdapterState, ToolConnectionAdapter, TransportConfig};
use crate::model::{Embedder, LanguageModel, ModelCatalog, ModelSelector};
use crate::multiplexer::{TurnReply, TurnRequest, respond, stream_turn};
use crate::registry::ResourceRegistry;
use crate::retrieval::ChunkingOptions;
use crate::session::{MessageQuery, NewSession, Session, SessionType, new_session_id};
use crate::settings::{
    GlobalConfigDefaults, ModelParams, RequestOverrides, SessionSettings, SessionSettingsPatch,
    resolve_effective_settings,
};
use crate::storage::SessionRepository;
use crate::tools::ToolDescriptor;

pub type EngineRegistry = ResourceRegistry<Mutex<ConversationEngine>>;
pub type AdapterRegistry = ResourceRegistry<Mutex<ToolConnectionAdapter>>;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn SessionRepository>,
    pub model: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub catalog: Arc<dyn ModelCatalog>,
    pub engines: Arc<EngineRegistry>,
    pub adapters: Arc<AdapterRegistry>,
    pub defaults: Arc<GlobalConfigDefaults>,
    pub handshake_timeout: Duration,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        model: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
        catalog: Arc<dyn ModelCatalog>,
        defaults: GlobalConfigDefaults,
    ) -> Self {
        Self {
            repo,
            model,
            embedder,
            catalog,
            engines: Arc::new(ResourceRegistry::new("engine")),
            adapters: Arc::new(ResourceRegistry::new("adapter")),
            defaults: Arc::new(defaults),
            handshake_timeout: crate::mcp::adapter::DEFAULT_HANDSHAKE_TIMEOUT,
            metrics: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ModelError> for ApiError {
    fn from(e: ModelError) -> Self {
        ApiError::Engine(EngineError::Model(e))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Adapter(e) => match e {
                AdapterError::Connection { kind, .. } if kind.is_resource_in_use() => StatusCode::CONFLICT,
                AdapterError::Connection { .. } | AdapterError::Transport(_) => StatusCode::BAD_GATEWAY,
                AdapterError::NotConnected => StatusCode::CONFLICT,
                AdapterError::ToolExecution { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            },
            ApiError::Engine(e) => match e {
                EngineError::Model(ModelError::Unavailable { .. }) | EngineError::NotReady => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                EngineError::Model(_) => StatusCode::BAD_GATEWAY,
                EngineError::MissingCapability { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                EngineError::Unsupported(_) => StatusCode::BAD_REQUEST,
                EngineError::Io(_) | EngineError::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Engine(e) => e.user_message(),
            other => other.to_string(),
        };
        let mut body = json!({ "error": message });
        if let ApiError::Adapter(AdapterError::Connection { kind, .. }) = &self {
            body["failure"] = serde_json::to_value(kind).unwrap_or(Value::Null);
        }
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list_models(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let models = state.catalog.list_models().await?;
    Ok(Json(json!({ "models": models })))
}

async fn list_agents() -> Json<&'static [AgentKind]> {
    Json(AGENTS)
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    pub session_id: Option<String>,
    pub model: Option<String>,
    pub agent: Option<String>,
    pub system_message: Option<String>,
    pub settings: Option<SessionSettings>,
}

/// Persists the session if needed and installs a fresh, initialized engine for it.
async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let agent_id = body.agent.unwrap_or_else(|| DEFAULT_AGENT.to_string());
    if find_agent(&agent_id).is_none() {
        return Err(ApiError::BadRequest(format!("unknown agent `{agent_id}`")));
    }

    // ids are minted here; a supplied id can only re-initialize a live session
    let (session, status) = match &body.session_id {
        Some(id) => (load_session(&state, id).await?, StatusCode::OK),
        None => {
            let model_name = ModelSelector::select(body.model, None, state.defaults.default_model.clone())
                .unwrap_or_else(|| "llama3.2".to_string());
            let new = NewSession {
                session_id: new_session_id(),
                model_name,
                session_type: SessionType::Chatbot,
                agent: agent_id,
                system_message: body.system_message,
                settings: body.settings.unwrap_or_default(),
            };
            (state.repo.create_session(new).await?, StatusCode::CREATED)
        }
    };

    let mut engine = build_engine(&state, &session)?;
    let history = state.repo.query_messages(&session.session_id, &MessageQuery::default()).await?;
    engine.restore_history(&history);
    engine.initialize().await?;
    state.engines.put(&session.session_id, Arc::new(Mutex::new(engine))).await;
    record_live_engines(&state).await;
    info!(session_id = %session.session_id, model = %session.model_name, agent = %session.agent, "session initialized");
    Ok((status, Json(session)))
}

fn build_engine(state: &AppState, session: &Session) -> ApiResult<ConversationEngine> {
    let agent = find_agent(&session.agent)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown agent `{}`", session.agent)))?;
    let effective = resolve_effective_settings(&state.defaults, &session.settings, &RequestOverrides::default());
    let config = EngineConfig {
        model_name: session.model_name.clone(),
        system_message: session.system_message.clone(),
        params: effective.model_params,
        retrieval_top_k: effective.retrieval_top_k,
        chunking: ChunkingOptions::default(),
        capabilities: agent.capabilities,
    };
    Ok(agent.build(AgentParts {
        model: state.model.clone(),
        embedder: state.embedder.clone(),
        config,
    }))
}

async fn record_live_engines(state: &AppState) {
    metrics::gauge!("parley_live_engines").set(state.engines.len().await as f64);
}

async fn load_session(state: &AppState, id: &str) -> ApiResult<Session> {
    state
        .repo
        .get_session(id)
        .await?
        .filter(|s| s.is_active)
        .ok_or_else(|| ApiError::NotFound(id.to_string()))
}

/// Live engine for a session, rebuilt from storage when none is registered.
async fn ensure_engine(state: &AppState, id: &str) -> ApiResult<Arc<Mutex<ConversationEngine>>> {
    if let Some(engine) = state.engines.get(id).await {
        return Ok(engine);
    }
    let engine = state
        .engines
        .get_or_try_insert_with(id, || async {
            let session = load_session(state, id).await?;
            let mut engine = build_engine(state, &session)?;
            let history = state.repo.query_messages(id, &MessageQuery::default()).await?;
            engine.restore_history(&history);
            engine.initialize().await?;
            info!(session_id = id, restored = history.len(), "engine restored from storage");
            Ok::<_, ApiError>(Arc::new(Mutex::new(engine)))
        })
        .await?;
    record_live_engines(state).await;
    Ok(engine)
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    include_inactive: bool,
}

async fn list_sessions(State(state): State<AppState>, Query(q): Query<ListQuery>) -> ApiResult<Json<Value>> {
    let sessions = state.repo.list_sessions(q.include_inactive).await?;
    Ok(Json(json!({ "sessions": sessions })))
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Session>> {
    state
        .repo
        .get_session(&id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    permanent: bool,
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    state.engines.remove(&id).await;
    state.adapters.remove(&id).await;
    record_live_engines(&state).await;
    let found = if q.permanent {
        state.repo.delete_session_permanently(&id).await?
    } else {
        state.repo.deactivate_session(&id).await?
    };
    if !found {
        return Err(ApiError::NotFound(id));
    }
    info!(session_id = %id, permanent = q.permanent, "session deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct SessionSettingsResponse {
    settings: SessionSettings,
}

async fn get_session_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSettingsResponse>> {
    let session = load_session(&state, &id).await?;
    Ok(Json(SessionSettingsResponse { settings: session.settings }))
}

async fn patch_session_settings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<SessionSettingsPatch>,
) -> ApiResult<Json<SessionSettingsResponse>> {
    let mut session = load_session(&state, &id).await?;
    session.settings.apply_patch(patch);
    state.repo.update_settings(&id, &session.settings).await?;
    if let Some(engine) = state.engines.get(&id).await {
        let effective = resolve_effective_settings(&state.defaults, &session.settings, &RequestOverrides::default());
        engine.lock().await.set_params(effective.model_params, effective.retrieval_top_k);
    }
    Ok(Json(SessionSettingsResponse { settings: session.settings }))
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: String,
    #[serde(default)]
    model_params: Option<ModelParams>,
}

async fn turn_request(state: &AppState, id: &str, body: MessageBody) -> ApiResult<TurnRequest> {
    if body.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".into()));
    }
    let session = load_session(state, id).await?;
    let overrides = RequestOverrides { model_params: body.model_params };
    let settings = resolve_effective_settings(&state.defaults, &session.settings, &overrides);
    let tooling = match state.adapters.get(id).await {
        Some(adapter) => match tooling_for(&adapter).await {
            Ok(tooling) => Some(tooling),
            Err(e) => {
                warn!(session_id = id, error = %e, "dropping tool provider that is no longer connected");
                state.adapters.remove(id).await;
                if let Err(e) = state.repo.update_session_type(id, SessionType::Chatbot).await {
                    warn!(session_id = id, error = %e, "failed to reset session type");
                }
                None
            }
        },
        None => None,
    };
    Ok(TurnRequest {
        session_id: id.to_string(),
        message: body.message,
        tooling,
        settings: Some(settings),
    })
}

async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> ApiResult<Json<TurnReply>> {
    let request = turn_request(&state, &id, body).await?;
    let engine = ensure_engine(&state, &id).await?;
    let reply = respond(&engine, state.repo.as_ref(), request).await?;
    Ok(Json(reply))
}

async fn stream_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let request = turn_request(&state, &id, body).await?;
    let engine = ensure_engine(&state, &id).await?;
    let rx = stream_turn(engine, state.repo.clone(), request);
    let events = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let sse = Event::default()
            .event(event.name())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().event("error").data("unencodable event"));
        Some((Ok(sse), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<Json<Value>> {
    if state.repo.get_session(&id).await?.is_none() {
        return Err(ApiError::NotFound(id));
    }
    let messages = state.repo.query_messages(&id, &query).await?;
    Ok(Json(json!({ "messages": messages })))
}

async fn list_tool_events(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    if state.repo.get_session(&id).await?.is_none() {
        return Err(ApiError::NotFound(id));
    }
    let events = state.repo.list_tool_events(&id).await?;
    Ok(Json(json!({ "tool_events": events })))
}

#[derive(Debug, Deserialize)]
struct AddFileBody {
    path: PathBuf,
    display_name: Option<String>,
}

async fn add_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddFileBody>,
) -> ApiResult<Json<Value>> {
    let engine = ensure_engine(&state, &id).await?;
    let display_name = body.display_name.unwrap_or_else(|| {
        body.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| body.path.display().to_string())
    });
    let mut engine = engine.lock().await;
    let chunks = engine.add_file_context(&body.path, &display_name).await?;
    Ok(Json(json!({ "file": display_name, "chunks": chunks, "sources": engine.context_sources() })))
}

#[derive(Debug, Serialize)]
struct AdapterStatus {
    state: AdapterState,
    tools: Vec<ToolDescriptor>,
    server_info: Option<Implementation>,
}

async fn connect_mcp(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<TransportConfig>,
) -> ApiResult<Json<AdapterStatus>> {
    let session = load_session(&state, &id).await?;
    let tool_calling = find_agent(&session.agent).is_some_and(|a| a.supports(Capability::ToolCalling));
    if !tool_calling {
        return Err(ApiError::BadRequest(format!(
            "agent `{}` cannot call tools; create the session with a tool-calling agent",
            session.agent
        )));
    }
    let mut adapter = ToolConnectionAdapter::new(id.clone()).with_handshake_timeout(state.handshake_timeout);
    adapter.connect(config).await?;
    let status = AdapterStatus {
        state: adapter.state(),
        tools: adapter.list_tools()?,
        server_info: adapter.server_info().cloned(),
    };
    state.adapters.put(&id, Arc::new(Mutex::new(adapter))).await;
    state.repo.update_session_type(&id, SessionType::ToolClient).await?;
    info!(session_id = %id, tools = status.tools.len(), "tool provider attached");
    Ok(Json(status))
}

async fn disconnect_mcp(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    if !state.adapters.remove(&id).await {
        return Err(ApiError::NotFound(id));
    }
    if let Err(e) = state.repo.update_session_type(&id, SessionType::Chatbot).await {
        warn!(session_id = %id, error = %e, "failed to reset session type");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn adapter_for(state: &AppState, id: &str) -> ApiResult<Arc<Mutex<ToolConnectionAdapter>>> {
    state
        .adapters
        .get(id)
        .await
        .ok_or(ApiError::Adapter(AdapterError::NotConnected))
}

async fn list_mcp_tools(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let adapter = adapter_for(&state, &id).await?;
    let tools = adapter.lock().await.list_tools()?;
    Ok(Json(json!({ "tools": tools })))
}

async fn call_mcp_tool(
    State(state): State<AppState>,
    Path((id, name)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> ApiResult<Json<Value>> {
    let adapter = adapter_for(&state, &id).await?;
    let arguments = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let result = call_with_reconnect(&adapter, &name, arguments).await?;
    Ok(Json(json!({ "tool": name, "result": result })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/v1/models", get(list_models))
        .route("/v1/agents", get(list_agents))
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route("/v1/sessions/:id", get(get_session).delete(delete_session))
        .route("/v1/sessions/:id/settings", get(get_session_settings).patch(patch_session_settings))
        .route("/v1/sessions/:id/messages", post(post_message).get(list_messages))
        .route("/v1/sessions/:id/stream", post(stream_message))
        .route("/v1/sessions/:id/tool-events", get(list_tool_events))
        .route("/v1/sessions/:id/files", post(add_file))
        .route("/v1/sessions/:id/mcp", post(connect_mcp).delete(disconnect_mcp))
        .route("/v1/sessions/:id/mcp/tools", get(list_mcp_tools))
        .route("/v1/sessions/:id/mcp/tools/:name", post(call_mcp_tool))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down, releasing live sessions");
    state.engines.release_all().await;
    state.adapters.release_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
