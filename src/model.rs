use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ModelError;
use crate::session::Role;
use crate::settings::ModelParams;
use crate::tools::{ToolCallRequest, ToolDescriptor};

/// One message as sent to the inference runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl TurnMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(call: &ToolCallRequest, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call.id.clone()),
            tool_name: Some(call.name.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<TurnMessage>,
    pub tools: Option<Vec<ToolDescriptor>>,
    pub params: ModelParams,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Normalised unit of a streamed reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Text(String),
    ToolCalls(Vec<ToolCallRequest>),
    Done,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, ModelError>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Address reported to users when the runtime cannot be reached.
    fn address(&self) -> &str;
    async fn ping(&self) -> Result<(), ModelError>;
    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, ModelError>;
    async fn generate_stream(&self, req: ModelRequest) -> Result<ChunkStream, ModelError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;
}

/// Models installed in the runtime.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError>;
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector;

impl ModelSelector {
    pub fn select(model_override: Option<String>, session_default: Option<String>, global_default: Option<String>) -> Option<String> {
        model_override.or(session_default).or(global_default)
    }
}

#[derive(Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    embedding_model: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, embedding_model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            embedding_model: embedding_model.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> ModelError {
        if e.is_connect() || e.is_timeout() {
            ModelError::Unavailable {
                address: self.base_url.clone(),
                detail: e.to_string(),
            }
        } else {
            ModelError::Transport(e.to_string())
        }
    }

    async fn check_status(&self, resp: reqwest::Response) -> Result<reqwest::Response, ModelError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(&self.base_url, status.as_u16(), body))
    }
}

pub(crate) fn classify_status(address: &str, status: u16, body: String) -> ModelError {
    let lowered = body.to_lowercase();
    if matches!(status, 502..=504) || lowered.contains("busy") || lowered.contains("overloaded") {
        ModelError::Unavailable {
            address: address.to_string(),
            detail: format!("status {status}"),
        }
    } else {
        ModelError::Http { status, body }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

impl From<&TurnMessage> for OllamaMessage {
    fn from(m: &TurnMessage) -> Self {
        OllamaMessage {
            role: m.role.as_str(),
            content: m.content.clone(),
            tool_calls: m
                .tool_calls
                .iter()
                .map(|c| serde_json::json!({"function": {"name": c.name, "arguments": c.arguments}}))
                .collect(),
            tool_name: m.tool_name.clone(),
        }
    }
}

fn tool_spec(d: &ToolDescriptor) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": d.name,
            "description": d.description,
            "parameters": d.to_json_schema(),
        }
    })
}

impl<'a> OllamaChatRequest<'a> {
    fn from_request(req: &'a ModelRequest, stream: bool) -> Self {
        let p = &req.params;
        let options = if p.temperature.is_some() || p.top_p.is_some() || p.max_tokens.is_some() {
            Some(OllamaOptions {
                temperature: p.temperature,
                top_p: p.top_p,
                num_predict: p.max_tokens,
            })
        } else {
            None
        };
        OllamaChatRequest {
            model: &req.model,
            messages: req.messages.iter().map(OllamaMessage::from).collect(),
            stream,
            tools: req
                .tools
                .as_ref()
                .filter(|t| !t.is_empty())
                .map(|t| t.iter().map(tool_spec).collect()),
            options,
        }
    }
}

fn parse_tool_calls(raw: &Value) -> Vec<ToolCallRequest> {
    let Some(calls) = raw.as_array() else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|c| {
            let function = c.get("function")?;
            let name = function.get("name")?.as_str()?.to_string();
            let arguments = match function.get("arguments") {
                Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::String(s.clone())),
                Some(v) => v.clone(),
                None => Value::Object(Default::default()),
            };
            let id = c
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            Some(ToolCallRequest { id, name, arguments })
        })
        .collect()
}

/// Turns whatever shape the runtime sent into fixed chunks.
///
/// Accepts chat objects (`{"message": {...}}`), generate objects
/// (`{"response": "..."}`), flat `{"content": "..."}` objects and bare strings.
pub fn normalize_chunk(value: &Value) -> Result<Vec<ModelChunk>, ModelError> {
    let mut out = Vec::new();
    match value {
        Value::String(s) => {
            if !s.is_empty() {
                out.push(ModelChunk::Text(s.clone()));
            }
        }
        Value::Object(obj) => {
            if let Some(err) = obj.get("error").and_then(Value::as_str) {
                return Err(ModelError::Transport(err.to_string()));
            }
            let message = obj.get("message");
            let text = message
                .and_then(|m| m.get("content"))
                .or_else(|| obj.get("response"))
                .or_else(|| obj.get("content"))
                .and_then(Value::as_str);
            if let Some(t) = text.filter(|t| !t.is_empty()) {
                out.push(ModelChunk::Text(t.to_string()));
            }
            if let Some(calls) = message.and_then(|m| m.get("tool_calls")) {
                let calls = parse_tool_calls(calls);
                if !calls.is_empty() {
                    out.push(ModelChunk::ToolCalls(calls));
                }
            }
            if obj.get("done").and_then(Value::as_bool).unwrap_or(false) {
                out.push(ModelChunk::Done);
            }
        }
        _ => {}
    }
    Ok(out)
}

fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Result<ModelChunk, ModelError>> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(v) => match normalize_chunk(&v) {
                Ok(chunks) => out.extend(chunks.into_iter().map(Ok)),
                Err(e) => out.push(Err(e)),
            },
            Err(e) => debug!(error = %e, "skipping undecodable stream line"),
        }
    }
    out
}

#[async_trait]
impl LanguageModel for OllamaClient {
    fn address(&self) -> &str {
        &self.base_url
    }

    async fn ping(&self) -> Result<(), ModelError> {
        let resp = self
            .http
            .get(self.url("/api/version"))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        self.check_status(resp).await?;
        Ok(())
    }

    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = OllamaChatRequest::from_request(&req, false);
        let resp = self
            .http
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let resp = self.check_status(resp).await?;
        let v: Value = resp.json().await.map_err(|e| ModelError::Decode(e.to_string()))?;
        let mut out = ModelResponse {
            model: v
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&req.model)
                .to_string(),
            ..Default::default()
        };
        for chunk in normalize_chunk(&v)? {
            match chunk {
                ModelChunk::Text(t) => out.content.push_str(&t),
                ModelChunk::ToolCalls(calls) => out.tool_calls.extend(calls),
                ModelChunk::Done => {}
            }
        }
        Ok(out)
    }

    async fn generate_stream(&self, req: ModelRequest) -> Result<ChunkStream, ModelError> {
        let body = OllamaChatRequest::from_request(&req, true);
        let resp = self
            .http
            .post(self.url("/api/chat"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let resp = self.check_status(resp).await?;

        let chunks = resp.bytes_stream().scan(Vec::<u8>::new(), |buffer, chunk| {
            let out = match chunk {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    drain_lines(buffer)
                }
                Err(e) => vec![Err(ModelError::Transport(e.to_string()))],
            };
            futures_util::future::ready(Some(out))
        });
        Ok(Box::pin(chunks.flat_map(stream::iter)))
    }
}

#[async_trait]
impl ModelCatalog for OllamaClient {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError> {
        let resp = self
            .http
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let resp = self.check_status(resp).await?;
        let tags: OllamaTags = resp.json().await.map_err(|e| ModelError::Decode(e.to_string()))?;
        Ok(tags.models)
    }
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({ "model": self.embedding_model, "input": inputs });
        let resp = self
            .http
            .post(self.url("/api/embed"))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let resp = self.check_status(resp).await?;
        let parsed: OllamaEmbedResponse = resp.json().await.map_err(|e| ModelError::Decode(e.to_string()))?;
        if parsed.embeddings.len() != inputs.len() {
            return Err(ModelError::Decode(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, http::StatusCode, routing::{get, post}};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn normalizes_every_chunk_shape() {
        let chat = serde_json::json!({"message": {"role": "assistant", "content": "Hi"}, "done": false});
        assert_eq!(normalize_chunk(&chat).unwrap(), vec![ModelChunk::Text("Hi".into())]);

        let generated = serde_json::json!({"response": "there", "done": true});
        assert_eq!(
            normalize_chunk(&generated).unwrap(),
            vec![ModelChunk::Text("there".into()), ModelChunk::Done]
        );

        let bare = serde_json::json!("plain");
        assert_eq!(normalize_chunk(&bare).unwrap(), vec![ModelChunk::Text("plain".into())]);

        let err = serde_json::json!({"error": "model not found"});
        assert!(normalize_chunk(&err).is_err());
    }

    #[test]
    fn tool_calls_get_ids_and_parsed_arguments() {
        let v = serde_json::json!({
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [
                    {"function": {"name": "f", "arguments": {"x": 1}}},
                    {"function": {"name": "g", "arguments": "{\"y\":2}"}}
                ]
            },
            "done": true
        });
        let chunks = normalize_chunk(&v).unwrap();
        let ModelChunk::ToolCalls(calls) = &chunks[0] else { panic!("expected tool calls") };
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].arguments, serde_json::json!({"x": 1}));
        assert_eq!(calls[1].arguments, serde_json::json!({"y": 2}));
        assert!(calls[0].id.starts_with("call_"));
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn request_serialization_carries_tools_and_options() {
        let req = ModelRequest {
            model: "llama3.2".into(),
            messages: vec![TurnMessage::user("hi")],
            tools: Some(vec![ToolDescriptor {
                name: "f".into(),
                description: "does f".into(),
                parameters: vec![],
            }]),
            params: ModelParams { temperature: Some(0.5), max_tokens: None, top_p: None },
        };
        let v = serde_json::to_value(OllamaChatRequest::from_request(&req, false)).unwrap();
        assert_eq!(v["messages"][0]["role"], "user");
        assert_eq!(v["tools"][0]["function"]["name"], "f");
        assert_eq!(v["options"]["temperature"], 0.5);
        assert!(v["options"].get("top_p").is_none());
        assert_eq!(v["stream"], false);
    }

    #[test]
    fn partial_lines_stay_buffered() {
        let mut buf = b"{\"message\":{\"content\":\"a\"}}\n{\"message\":{\"con".to_vec();
        let out = drain_lines(&mut buf);
        assert_eq!(out.len(), 1);
        assert_eq!(buf, b"{\"message\":{\"con".to_vec());
    }

    #[tokio::test]
    async fn streams_ndjson_chat_reply() {
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
        );
        let base = serve(Router::new().route("/api/chat", post(move || async move { body }))).await;
        let client = OllamaClient::new(base, "embed");
        let req = ModelRequest { model: "m".into(), messages: vec![TurnMessage::user("hi")], ..Default::default() };
        let chunks: Vec<_> = client.generate_stream(req).await.unwrap().collect().await;
        let chunks: Vec<ModelChunk> = chunks.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            chunks,
            vec![ModelChunk::Text("Hel".into()), ModelChunk::Text("lo".into()), ModelChunk::Done]
        );
    }

    #[tokio::test]
    async fn busy_gateway_is_reported_as_unavailable() {
        let base = serve(Router::new().route(
            "/api/chat",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "server busy") }),
        ))
        .await;
        let client = OllamaClient::new(base.clone(), "embed");
        let err = client.generate(ModelRequest::default()).await.unwrap_err();
        match err {
            ModelError::Unavailable { address, .. } => assert_eq!(address, base),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_reported_as_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = OllamaClient::new(format!("http://{}", addr), "embed");
        assert!(matches!(client.ping().await, Err(ModelError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn lists_installed_models() {
        let base = serve(Router::new().route(
            "/api/tags",
            get(|| async { axum::Json(serde_json::json!({"models": [{"name": "llama3.2:latest", "size": 42}]})) }),
        ))
        .await;
        let models = OllamaClient::new(base, "embed").list_models().await.unwrap();
        assert_eq!(models[0].name, "llama3.2:latest");
        assert_eq!(models[0].size, Some(42));
    }
}
