use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};

use crate::error::EngineError;
use crate::model::{Embedder, LanguageModel, ModelChunk, ModelRequest, ModelResponse, TurnMessage};
use crate::registry::Release;
use crate::retrieval::{ChunkingOptions, RetrievalStore, augment_prompt, extract_text, split_text};
use crate::session::{ChatMessage, Role};
use crate::settings::{DEFAULT_RETRIEVAL_TOP_K, ModelParams};
use crate::tools::{AvailableFunctions, InvocationStatus, ToolCallRequest, ToolDescriptor, ToolInvocation};

/// Optional behaviours an engine may declare on top of plain chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Streaming,
    ToolCalling,
    Retrieval,
}

/// Incremental output of a streamed turn.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Token(String),
    Tool(ToolInvocation),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_name: String,
    pub system_message: Option<String>,
    pub params: ModelParams,
    pub retrieval_top_k: usize,
    pub chunking: ChunkingOptions,
    pub capabilities: &'static [Capability],
}

impl EngineConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            system_message: None,
            params: ModelParams::default(),
            retrieval_top_k: DEFAULT_RETRIEVAL_TOP_K,
            chunking: ChunkingOptions::default(),
            capabilities: &[Capability::Streaming, Capability::ToolCalling, Capability::Retrieval],
        }
    }
}

/// One conversation's history plus the model it talks to.
pub struct ConversationEngine {
    model: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    config: EngineConfig,
    history: Vec<TurnMessage>,
    retrieval: Option<RetrievalStore>,
    ready: bool,
    last_invocations: Vec<ToolInvocation>,
}

impl ConversationEngine {
    pub fn new(model: Arc<dyn LanguageModel>, embedder: Arc<dyn Embedder>, config: EngineConfig) -> Self {
        Self {
            model,
            embedder,
            config,
            history: Vec::new(),
            retrieval: None,
            ready: false,
            last_invocations: Vec::new(),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.config.capabilities.contains(&capability)
    }

    #[cfg(test)]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn history(&self) -> &[TurnMessage] {
        &self.history
    }

    /// Tool calls resolved during the most recent turn.
    pub fn last_invocations(&self) -> &[ToolInvocation] {
        &self.last_invocations
    }

    pub fn set_params(&mut self, params: ModelParams, retrieval_top_k: usize) {
        self.config.params = params;
        self.config.retrieval_top_k = retrieval_top_k.max(1);
    }

    /// Replays persisted user and assistant turns into memory.
    pub fn restore_history(&mut self, messages: &[ChatMessage]) {
        self.history = messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| TurnMessage::new(m.role, m.content.clone()))
            .collect();
    }

    /// Checks the model runtime is reachable. A no-op once ready.
    pub async fn initialize(&mut self) -> Result<(), EngineError> {
        if self.ready {
            return Ok(());
        }
        self.model.ping().await?;
        self.ready = true;
        info!(model = %self.config.model_name, "conversation engine ready");
        Ok(())
    }

    /// Runs one turn and returns the reply, or a user-facing error text.
    pub async fn send(
        &mut self,
        message: &str,
        tools: Option<&[ToolDescriptor]>,
        functions: Option<&AvailableFunctions>,
    ) -> String {
        match self.try_send(message, tools, functions).await {
            Ok(text) => text,
            Err(e) => {
                error!(model = %self.config.model_name, error = %e, "turn failed");
                e.user_message()
            }
        }
    }

    pub async fn try_send(
        &mut self,
        message: &str,
        tools: Option<&[ToolDescriptor]>,
        functions: Option<&AvailableFunctions>,
    ) -> Result<String, EngineError> {
        let (tools, functions) = self.begin_turn(tools, functions)?;
        let prompt = self.augmented_prompt(message).await?;
        self.history.push(TurnMessage::user(message));
        let first = self.model.generate(self.request(prompt.as_deref(), tools)).await?;
        self.resolve(first, prompt.as_deref(), functions).await
    }

    /// Like [`send`](Self::send) but forwards text fragments to `sink` as they arrive.
    ///
    /// Tool calls are not streamed: once the model asks for one, the rest of the
    /// turn is resolved like a non-streamed turn and its answer is emitted whole.
    pub async fn send_stream(
        &mut self,
        message: &str,
        tools: Option<&[ToolDescriptor]>,
        functions: Option<&AvailableFunctions>,
        sink: &mpsc::Sender<EngineEvent>,
    ) -> Result<String, EngineError> {
        if !self.supports(Capability::Streaming) {
            let text = self.try_send(message, tools, functions).await?;
            emit(sink, EngineEvent::Token(text.clone())).await;
            self.emit_invocations(sink).await;
            return Ok(text);
        }

        let (tools, functions) = self.begin_turn(tools, functions)?;
        let prompt = self.augmented_prompt(message).await?;
        self.history.push(TurnMessage::user(message));
        let mut stream = self.model.generate_stream(self.request(prompt.as_deref(), tools)).await?;

        let mut text = String::new();
        // text that arrived after a tool call, held back until we know the call is resolved
        let mut held = String::new();
        let mut calls: Vec<ToolCallRequest> = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                ModelChunk::Text(t) if t.is_empty() => {}
                ModelChunk::Text(t) => {
                    text.push_str(&t);
                    if calls.is_empty() {
                        emit(sink, EngineEvent::Token(t)).await;
                    } else {
                        held.push_str(&t);
                    }
                }
                ModelChunk::ToolCalls(c) => calls.extend(c),
                ModelChunk::Done => break,
            }
        }

        if calls.is_empty() || functions.is_none() {
            if !held.is_empty() {
                emit(sink, EngineEvent::Token(held)).await;
            }
            self.history.push(TurnMessage::assistant(text.clone()));
            return Ok(text);
        }

        debug!(calls = calls.len(), "tool calls requested mid-stream, resolving without streaming");
        let response = ModelResponse {
            content: text,
            model: self.config.model_name.clone(),
            tool_calls: calls,
        };
        let answer = self.resolve(response, prompt.as_deref(), functions).await?;
        emit(sink, EngineEvent::Token(answer.clone())).await;
        self.emit_invocations(sink).await;
        Ok(answer)
    }

    /// Checks readiness and drops tools and functions the engine may not use.
    fn begin_turn<'t, 'f>(
        &mut self,
        tools: Option<&'t [ToolDescriptor]>,
        functions: Option<&'f AvailableFunctions>,
    ) -> Result<(Option<&'t [ToolDescriptor]>, Option<&'f AvailableFunctions>), EngineError> {
        if !self.ready {
            return Err(EngineError::NotReady);
        }
        self.last_invocations.clear();
        if !self.supports(Capability::ToolCalling) {
            return Ok((None, None));
        }
        Ok((tools.filter(|t| !t.is_empty()), functions))
    }

    async fn augmented_prompt(&self, message: &str) -> Result<Option<String>, EngineError> {
        let Some(store) = self.retrieval.as_ref().filter(|s| !s.is_empty()) else {
            return Ok(None);
        };
        let query = self.embedder.embed(&[message.to_string()]).await?;
        let Some(embedding) = query.first() else {
            return Ok(None);
        };
        let hits = store.query(embedding, self.config.retrieval_top_k);
        debug!(hits = hits.len(), "retrieved context for turn");
        Ok(Some(augment_prompt(message, &hits)))
    }

    fn request(&self, prompt: Option<&str>, tools: Option<&[ToolDescriptor]>) -> ModelRequest {
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        if let Some(system) = &self.config.system_message {
            messages.push(TurnMessage::system(system.clone()));
        }
        messages.extend(self.history.iter().cloned());
        // only the model sees the retrieved context
        if let Some(prompt) = prompt {
            if let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == Role::User) {
                last_user.content = prompt.to_string();
            }
        }
        ModelRequest {
            model: self.config.model_name.clone(),
            messages,
            tools: tools.map(<[ToolDescriptor]>::to_vec),
            params: self.config.params.clone(),
        }
    }

    async fn resolve(
        &mut self,
        response: ModelResponse,
        prompt: Option<&str>,
        functions: Option<&AvailableFunctions>,
    ) -> Result<String, EngineError> {
        let functions = match functions {
            Some(f) if !response.tool_calls.is_empty() => f,
            _ => {
                self.history.push(TurnMessage::assistant(response.content.clone()));
                return Ok(response.content);
            }
        };

        let mut turn = TurnMessage::assistant(response.content);
        turn.tool_calls = response.tool_calls.clone();
        self.history.push(turn);

        for call in &response.tool_calls {
            let invocation = invoke(functions, call).await;
            metrics::counter!("parley_tool_calls_total", "status" => invocation.status.as_str()).increment(1);
            self.history.push(TurnMessage::tool_result(call, invocation.result.clone()));
            self.last_invocations.push(invocation);
        }

        let follow_up = self.model.generate(self.request(prompt, None)).await?;
        self.history.push(TurnMessage::assistant(follow_up.content.clone()));
        Ok(follow_up.content)
    }

    async fn emit_invocations(&self, sink: &mpsc::Sender<EngineEvent>) {
        for invocation in &self.last_invocations {
            emit(sink, EngineEvent::Tool(invocation.clone())).await;
        }
    }

    /// Extracts, chunks, embeds and indexes a file for later turns.
    pub async fn add_file_context(&mut self, path: &Path, display_name: &str) -> Result<usize, EngineError> {
        if !self.supports(Capability::Retrieval) {
            return Err(EngineError::Unsupported("file context"));
        }
        let text = extract_text(path).await?;
        let opts = self.config.chunking;
        let chunks = tokio::task::spawn_blocking(move || split_text(&text, &opts))
            .await
            .map_err(|e| EngineError::Generation(format!("chunking task failed: {e}")))?;
        if chunks.is_empty() {
            return Ok(0);
        }
        let embeddings = self.embedder.embed(&chunks).await?;
        if self.retrieval.is_none() {
            self.retrieval = Some(RetrievalStore::scratch()?);
        }
        let added = match self.retrieval.as_mut() {
            Some(store) => store.add(display_name, chunks, embeddings)?,
            None => 0,
        };
        info!(file = display_name, chunks = added, "file added to conversation context");
        Ok(added)
    }

    pub fn context_sources(&self) -> Vec<String> {
        self.retrieval.as_ref().map(RetrievalStore::sources).unwrap_or_default()
    }

    /// Drops history, readiness and any scratch index. Idempotent.
    pub fn cleanup(&mut self) {
        if let Some(store) = self.retrieval.take() {
            store.release();
        }
        self.history.clear();
        self.last_invocations.clear();
        self.ready = false;
    }
}

async fn invoke(functions: &AvailableFunctions, call: &ToolCallRequest) -> ToolInvocation {
    let (result, status) = match functions.get(&call.name) {
        None => (format!("Tool '{}' is not available.", call.name), InvocationStatus::Unavailable),
        Some(f) => match f.run(call.arguments.clone()).await {
            Ok(out) => (out, InvocationStatus::Ok),
            Err(e) => {
                debug!(tool = %call.name, error = %e, "tool call failed");
                (format!("Error executing tool '{}': {e}", call.name), InvocationStatus::Error)
            }
        },
    };
    ToolInvocation {
        call_id: call.id.clone(),
        name: call.name.clone(),
        arguments: call.arguments.clone(),
        result,
        status,
    }
}

async fn emit(sink: &mpsc::Sender<EngineEvent>, event: EngineEvent) {
    if sink.send(event).await.is_err() {
        debug!("stream consumer went away");
    }
}

#[async_trait]
impl Release for Mutex<ConversationEngine> {
    async fn release(&self) -> anyhow::Result<()> {
        self.lock().await.cleanup();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use super::*;
    use crate::testing::{HashEmbedder, ScriptedModel};
    use crate::tools::{ToolFunction, ToolFuture, ToolParameter};

    struct CountingAdd {
        calls: Arc<AtomicUsize>,
    }

    impl ToolFunction for CountingAdd {
        fn name(&self) -> &str {
            "f"
        }
        fn run<'a>(&'a self, args: Value) -> ToolFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let x = args.get("x").and_then(Value::as_i64).unwrap_or_default();
                Ok(format!("result={}", x + 1))
            })
        }
    }

    struct Failing;

    impl ToolFunction for Failing {
        fn name(&self) -> &str {
            "broken"
        }
        fn run<'a>(&'a self, _args: Value) -> ToolFuture<'a> {
            Box::pin(async { anyhow::bail!("disk on fire") })
        }
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.into(),
            description: "test tool".into(),
            parameters: vec![ToolParameter {
                name: "x".into(),
                kind: "integer".into(),
                required: true,
                description: None,
            }],
        }
    }

    async fn ready_engine(model: Arc<ScriptedModel>) -> ConversationEngine {
        let mut engine = ConversationEngine::new(model, Arc::new(HashEmbedder), EngineConfig::new("llama3.2"));
        engine.initialize().await.unwrap();
        engine
    }

    #[tokio::test]
    async fn plain_turn_appends_user_and_assistant() {
        let model = Arc::new(ScriptedModel::new().reply("Hi there"));
        let mut engine = ready_engine(model.clone()).await;
        let out = engine.send("Hello", None, None).await;

        assert_eq!(out, "Hi there");
        let h = engine.history();
        assert_eq!(h.len(), 2);
        assert_eq!((h[0].role, h[0].content.as_str()), (Role::User, "Hello"));
        assert_eq!((h[1].role, h[1].content.as_str()), (Role::Assistant, "Hi there"));
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn requested_tool_is_run_once_and_fed_back() {
        let model = Arc::new(ScriptedModel::new().reply_with_call("f", json!({"x": 1})).reply("It is 2."));
        let mut engine = ready_engine(model.clone()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let mut functions = AvailableFunctions::new();
        functions.register(Arc::new(CountingAdd { calls: calls.clone() }));
        let tools = [descriptor("f")];

        let out = engine.send("add", Some(&tools), Some(&functions)).await;

        assert_eq!(out, "It is 2.");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let tool_turn = engine.history().iter().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(tool_turn.content, "result=2");
        assert_eq!(tool_turn.tool_call_id.as_deref(), Some("call_f"));

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].tools.is_some());
        assert!(requests[1].tools.is_none());
        assert!(requests[1].messages.iter().any(|m| m.role == Role::Tool && m.content == "result=2"));
        assert_eq!(engine.last_invocations()[0].status, InvocationStatus::Ok);
    }

    #[tokio::test]
    async fn unknown_and_failing_tools_become_result_turns() {
        let model = Arc::new(
            ScriptedModel::new()
                .reply_with_call("missing", json!({}))
                .reply("no luck")
                .reply_with_call("broken", json!({}))
                .reply("still no luck"),
        );
        let mut engine = ready_engine(model).await;
        let mut functions = AvailableFunctions::new();
        functions.register(Arc::new(Failing));
        let tools = [descriptor("missing"), descriptor("broken")];

        assert_eq!(engine.send("one", Some(&tools), Some(&functions)).await, "no luck");
        let last_tool = engine.history().iter().rev().find(|m| m.role == Role::Tool).unwrap();
        assert_eq!(last_tool.content, "Tool 'missing' is not available.");
        assert_eq!(engine.last_invocations()[0].status, InvocationStatus::Unavailable);

        assert_eq!(engine.send("two", Some(&tools), Some(&functions)).await, "still no luck");
        let last_tool = engine.history().iter().rev().find(|m| m.role == Role::Tool).unwrap();
        assert!(last_tool.content.contains("disk on fire"));
        assert_eq!(engine.last_invocations()[0].status, InvocationStatus::Error);
    }

    #[tokio::test]
    async fn tool_request_without_functions_returns_model_text() {
        let model = Arc::new(ScriptedModel::new());
        model.push_reply(ModelResponse {
            content: "I would call the weather tool.".into(),
            model: "llama3.2".into(),
            tool_calls: vec![ToolCallRequest { id: "c1".into(), name: "weather".into(), arguments: json!({}) }],
        });
        let mut engine = ready_engine(model.clone()).await;
        let tools = [descriptor("weather")];
        let out = engine.send("weather?", Some(&tools), None).await;
        assert_eq!(out, "I would call the weather tool.");
        assert_eq!(model.requests().len(), 1);
    }

    #[tokio::test]
    async fn streamed_turn_forwards_fragments_and_keeps_full_text() {
        let model = Arc::new(ScriptedModel::new().stream(vec![
            ModelChunk::Text("Hel".into()),
            ModelChunk::Text("lo".into()),
            ModelChunk::Done,
        ]));
        let mut engine = ready_engine(model).await;
        let (tx, mut rx) = mpsc::channel(16);
        let out = engine.send_stream("hi", None, None, &tx).await.unwrap();
        drop(tx);

        let mut fragments = Vec::new();
        while let Some(EngineEvent::Token(t)) = rx.recv().await {
            fragments.push(t);
        }
        assert_eq!(fragments, vec!["Hel", "lo"]);
        assert_eq!(out, "Hello");
        assert_eq!(engine.history().last().unwrap().content, "Hello");
    }

    #[tokio::test]
    async fn mid_stream_tool_call_falls_back_to_single_fragment() {
        let model = Arc::new(
            ScriptedModel::new()
                .stream(vec![
                    ModelChunk::ToolCalls(vec![ToolCallRequest {
                        id: "c1".into(),
                        name: "f".into(),
                        arguments: json!({"x": 41}),
                    }]),
                    ModelChunk::Done,
                ])
                .reply("The answer is 42."),
        );
        let mut engine = ready_engine(model).await;
        let mut functions = AvailableFunctions::new();
        functions.register(Arc::new(CountingAdd { calls: Arc::new(AtomicUsize::new(0)) }));
        let tools = [descriptor("f")];
        let (tx, mut rx) = mpsc::channel(16);
        engine.send_stream("q", Some(&tools), Some(&functions), &tx).await.unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], EngineEvent::Token("The answer is 42.".into()));
        assert!(matches!(&events[1], EngineEvent::Tool(inv) if inv.result == "result=42"));
    }

    #[tokio::test]
    async fn text_after_unresolvable_stream_call_is_still_streamed() {
        let model = Arc::new(ScriptedModel::new().stream(vec![
            ModelChunk::ToolCalls(vec![ToolCallRequest {
                id: "c1".into(),
                name: "weather".into(),
                arguments: json!({}),
            }]),
            ModelChunk::Text("I would check the weather tool.".into()),
            ModelChunk::Done,
        ]));
        let mut engine = ready_engine(model).await;
        let tools = [descriptor("weather")];
        let (tx, mut rx) = mpsc::channel(16);
        let out = engine.send_stream("weather?", Some(&tools), None, &tx).await.unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events, vec![EngineEvent::Token("I would check the weather tool.".into())]);
        assert_eq!(out, "I would check the weather tool.");
        assert_eq!(engine.history().last().unwrap().content, "I would check the weather tool.");
    }

    #[tokio::test]
    async fn engines_without_tool_calling_ignore_functions() {
        let model = Arc::new(ScriptedModel::new().reply_with_call("f", json!({"x": 1})));
        let mut config = EngineConfig::new("llama3.2");
        config.capabilities = &[Capability::Streaming];
        let mut engine = ConversationEngine::new(model.clone(), Arc::new(HashEmbedder), config);
        engine.initialize().await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut functions = AvailableFunctions::new();
        functions.register(Arc::new(CountingAdd { calls: calls.clone() }));
        let tools = [descriptor("f")];

        engine.try_send("add", Some(&tools), Some(&functions)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(engine.last_invocations().is_empty());
        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].tools.is_none());
    }

    #[tokio::test]
    async fn failed_initialize_leaves_engine_not_ready() {
        let model = Arc::new(ScriptedModel::unreachable());
        let mut engine = ConversationEngine::new(model, Arc::new(HashEmbedder), EngineConfig::new("llama3.2"));
        assert!(engine.initialize().await.is_err());
        assert!(!engine.is_ready());
        assert!(matches!(engine.try_send("x", None, None).await, Err(EngineError::NotReady)));
    }

    #[tokio::test]
    async fn model_outage_is_reported_as_text() {
        let model = Arc::new(ScriptedModel::new());
        let mut engine = ready_engine(model).await;
        // nothing scripted: the model call itself fails
        let out = engine.send("hello", None, None).await;
        assert!(out.starts_with("Sorry"), "{out}");
    }

    #[tokio::test]
    async fn file_context_augments_only_the_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let notes = dir.path().join("notes.md");
        std::fs::write(&notes, "The launch code word is pineapple.").unwrap();

        let model = Arc::new(ScriptedModel::new().reply("pineapple"));
        let mut engine = ready_engine(model.clone()).await;
        assert_eq!(engine.add_file_context(&notes, "notes.md").await.unwrap(), 1);
        assert_eq!(engine.context_sources(), vec!["notes.md".to_string()]);

        engine.send("What is the launch code word?", None, None).await;
        let sent = &model.requests()[0];
        let user = sent.messages.iter().rfind(|m| m.role == Role::User).unwrap();
        assert!(user.content.contains("pineapple"));
        assert!(user.content.contains("source: notes.md"));
        assert_eq!(engine.history()[0].content, "What is the launch code word?");

        engine.cleanup();
        engine.cleanup();
        assert!(engine.history().is_empty());
        assert!(engine.context_sources().is_empty());
        assert!(!engine.is_ready());
    }

    #[tokio::test]
    async fn engines_without_retrieval_reject_files() {
        let mut config = EngineConfig::new("llama3.2");
        config.capabilities = &[Capability::Streaming];
        let mut engine = ConversationEngine::new(Arc::new(ScriptedModel::new()), Arc::new(HashEmbedder), config);
        let err = engine.add_file_context(Path::new("whatever.txt"), "whatever.txt").await.unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }
}
