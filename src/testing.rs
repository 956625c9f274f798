//! In-process fakes shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;

use crate::error::ModelError;
use crate::model::{ChunkStream, Embedder, LanguageModel, ModelCatalog, ModelChunk, ModelInfo, ModelRequest, ModelResponse};
use crate::tools::ToolCallRequest;

/// A language model that replays queued replies and records every request.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ModelResponse>>,
    streams: Mutex<VecDeque<Vec<ModelChunk>>>,
    requests: Mutex<Vec<ModelRequest>>,
    down: bool,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self { down: true, ..Self::default() }
    }

    pub fn reply(self, text: &str) -> Self {
        self.push_reply(ModelResponse { content: text.into(), ..Default::default() });
        self
    }

    pub fn reply_with_call(self, name: &str, arguments: Value) -> Self {
        self.push_reply(ModelResponse {
            tool_calls: vec![ToolCallRequest {
                id: format!("call_{name}"),
                name: name.into(),
                arguments,
            }],
            ..Default::default()
        });
        self
    }

    pub fn stream(self, chunks: Vec<ModelChunk>) -> Self {
        if let Ok(mut s) = self.streams.lock() {
            s.push_back(chunks);
        }
        self
    }

    pub fn push_reply(&self, reply: ModelResponse) {
        if let Ok(mut r) = self.replies.lock() {
            r.push_back(reply);
        }
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(&self, req: ModelRequest) -> Result<(), ModelError> {
        if self.down {
            return Err(self.unavailable());
        }
        if let Ok(mut r) = self.requests.lock() {
            r.push(req);
        }
        Ok(())
    }

    fn unavailable(&self) -> ModelError {
        ModelError::Unavailable { address: self.address().into(), detail: "connection refused".into() }
    }

    fn next_reply(&self) -> Result<ModelResponse, ModelError> {
        self.replies
            .lock()
            .ok()
            .and_then(|mut r| r.pop_front())
            .ok_or_else(|| ModelError::Decode("no scripted reply left".into()))
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn address(&self) -> &str {
        "http://scripted.invalid:11434"
    }

    async fn ping(&self) -> Result<(), ModelError> {
        if self.down { Err(self.unavailable()) } else { Ok(()) }
    }

    async fn generate(&self, req: ModelRequest) -> Result<ModelResponse, ModelError> {
        self.record(req)?;
        self.next_reply()
    }

    async fn generate_stream(&self, req: ModelRequest) -> Result<ChunkStream, ModelError> {
        self.record(req)?;
        let scripted = self.streams.lock().ok().and_then(|mut s| s.pop_front());
        let chunks = match scripted {
            Some(chunks) => chunks,
            None => {
                let reply = self.next_reply()?;
                let mut chunks = Vec::new();
                if !reply.content.is_empty() {
                    chunks.push(ModelChunk::Text(reply.content));
                }
                if !reply.tool_calls.is_empty() {
                    chunks.push(ModelChunk::ToolCalls(reply.tool_calls));
                }
                chunks.push(ModelChunk::Done);
                chunks
            }
        };
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

#[async_trait]
impl ModelCatalog for ScriptedModel {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ModelError> {
        Ok(vec![ModelInfo { name: "llama3.2:latest".into(), size: None, modified_at: None }])
    }
}

/// Hashed bag-of-words vectors: texts sharing words score higher.
pub struct HashEmbedder;

const DIMS: usize = 64;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(inputs
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; DIMS];
                for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
                    let h = word
                        .to_lowercase()
                        .bytes()
                        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
                    v[h % DIMS] += 1.0;
                }
                v
            })
            .collect())
    }
}
