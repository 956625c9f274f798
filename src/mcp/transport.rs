use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rust_mcp_schema::RequestId;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient, ServerMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::mcp::protocol::{encode_notification, encode_request};

/// How to reach a tool provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a child process and speak JSON-RPC over its stdin/stdout.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Connect to a remote server-sent-events endpoint.
    Sse { url: String },
}

impl TransportConfig {
    pub fn is_process(&self) -> bool {
        matches!(self, TransportConfig::Stdio { .. })
    }
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("{0}")]
    Transport(String),
    #[error("provider error {code}: {message}")]
    Remote { code: i64, message: String },
    #[error("unexpected reply from tool provider: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, RpcError>;
    async fn notify(&self, notification: NotificationFromClient) -> Result<(), RpcError>;
    /// Releases the underlying pipe or stream. Never fails.
    async fn close(&self);
    /// Whatever the provider printed on its error channel, for failure messages.
    async fn diagnostics(&self) -> String {
        String::new()
    }
}

type Pending = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

fn decode_line(line: &str) -> Vec<ServerMessage> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Array(batch)) => batch
            .into_iter()
            .filter_map(|item| serde_json::from_value::<ServerMessage>(item).ok())
            .collect(),
        Ok(value) => match serde_json::from_value::<ServerMessage>(value) {
            Ok(message) => vec![message],
            Err(e) => {
                debug!(error = %e, "undecodable provider message");
                Vec::new()
            }
        },
        Err(_) => {
            debug!(line, "provider wrote a non-JSON line");
            Vec::new()
        }
    }
}

async fn dispatch(pending: &Pending, message: ServerMessage) {
    let id = match &message {
        ServerMessage::Response(response) => Some(response.id.clone()),
        ServerMessage::Error(error) => error.id.clone(),
        ServerMessage::Request(_) => {
            debug!("ignoring provider-initiated request");
            None
        }
        ServerMessage::Notification(_) => None,
    };
    if let Some(id) = id {
        if let Some(tx) = pending.lock().await.remove(&id) {
            let _ = tx.send(message);
        }
    }
}

async fn await_reply(rx: oneshot::Receiver<ServerMessage>) -> Result<ServerMessage, RpcError> {
    rx.await
        .map_err(|_| RpcError::Transport("connection to tool provider closed".into()))
}

const STDERR_TAIL_LINES: usize = 20;

pub struct StdioTransport {
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    stderr_tail: Arc<std::sync::Mutex<VecDeque<String>>>,
    stderr_task: Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self, RpcError> {
        debug!(command, args = ?args, "starting tool provider process");
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RpcError::Transport(format!("failed to start `{command}`: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Transport("unable to open provider stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Transport("unable to open provider stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RpcError::Transport("unable to open provider stderr".into()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(std::sync::Mutex::new(VecDeque::new()));

        {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    for message in decode_line(line) {
                        dispatch(&pending, message).await;
                    }
                }
                closed.store(true, Ordering::SeqCst);
                pending.lock().await.clear();
            });
        }

        let stderr_task = {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "tool provider stderr");
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            })
        };

        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicI64::new(0),
            closed,
            stderr_tail,
            stderr_task: Mutex::new(Some(stderr_task)),
        })
    }

    async fn write_line(&self, payload: &str) -> Result<(), RpcError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| RpcError::Transport("provider stdin already closed".into()))?;
        let io = |e: std::io::Error| RpcError::Transport(format!("broken pipe to tool provider: {e}"));
        stdin.write_all(payload.as_bytes()).await.map_err(io)?;
        stdin.write_all(b"\n").await.map_err(io)?;
        stdin.flush().await.map_err(io)?;
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for StdioTransport {
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, RpcError> {
        let id = RequestId::Integer(self.next_id.fetch_add(1, Ordering::SeqCst));
        let payload = encode_request(request, id.clone())?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(RpcError::Transport("tool provider process has exited".into()));
        }
        if let Err(e) = self.write_line(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        debug!(id = ?id, "sent request to tool provider");
        await_reply(rx).await
    }

    async fn notify(&self, notification: NotificationFromClient) -> Result<(), RpcError> {
        let payload = encode_notification(notification)?;
        self.write_line(&payload).await
    }

    async fn close(&self) {
        // dropping stdin lets well-behaved providers exit on EOF
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "tool provider already exited");
            }
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "tool provider exited"),
                Ok(Err(e)) => warn!(error = %e, "failed to reap tool provider"),
                Err(_) => warn!("tool provider did not exit in time"),
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();
    }

    async fn diagnostics(&self) -> String {
        if let Some(task) = self.stderr_task.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental parser for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if !self.data.is_empty() || self.event.is_some() {
                    out.push(SseEvent {
                        event: self.event.take().unwrap_or_else(|| "message".into()),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        out
    }
}

pub struct SseTransport {
    http: reqwest::Client,
    endpoint: url::Url,
    pending: Pending,
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Opens the event stream and waits for the server to announce its message endpoint.
    pub async fn connect(url: &str) -> Result<Self, RpcError> {
        let base = url::Url::parse(url).map_err(|e| RpcError::Transport(format!("invalid url {url}: {e}")))?;
        let http = reqwest::Client::new();
        let resp = http
            .get(base.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| RpcError::Transport(format!("{e} ({e:?})")))?;
        if !resp.status().is_success() {
            return Err(RpcError::Transport(format!("event stream returned status {}", resp.status())));
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = {
            let pending = pending.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut endpoint_tx = Some(endpoint_tx);
                let mut parser = SseParser::default();
                let mut body = resp.bytes_stream();
                while let Some(chunk) = body.next().await {
                    let Ok(bytes) = chunk else { break };
                    for ev in parser.push(&String::from_utf8_lossy(&bytes)) {
                        match ev.event.as_str() {
                            "endpoint" => {
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(ev.data);
                                }
                            }
                            "message" => {
                                for message in decode_line(&ev.data) {
                                    dispatch(&pending, message).await;
                                }
                            }
                            other => debug!(event = other, "ignoring SSE event"),
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                pending.lock().await.clear();
            })
        };

        let endpoint = match endpoint_rx.await {
            Ok(path) => base
                .join(path.trim())
                .map_err(|e| RpcError::Transport(format!("invalid endpoint announced by provider: {e}"))),
            Err(_) => Err(RpcError::Transport("event stream ended before announcing an endpoint".into())),
        };
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => {
                reader.abort();
                return Err(e);
            }
        };
        debug!(endpoint = %endpoint, "SSE tool provider endpoint announced");

        Ok(Self {
            http,
            endpoint,
            pending,
            next_id: AtomicI64::new(0),
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn post(&self, body: String) -> Result<(), RpcError> {
        let resp = self
            .http
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(format!("stream to tool provider broke: {e}")))?;
        if !resp.status().is_success() {
            return Err(RpcError::Transport(format!("provider rejected message with status {}", resp.status())));
        }
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for SseTransport {
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("event stream to tool provider closed".into()));
        }
        let id = RequestId::Integer(self.next_id.fetch_add(1, Ordering::SeqCst));
        let payload = encode_request(request, id.clone())?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);
        if let Err(e) = self.post(payload).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        await_reply(rx).await
    }

    async fn notify(&self, notification: NotificationFromClient) -> Result<(), RpcError> {
        self.post(encode_notification(notification)?).await
    }

    async fn close(&self) {
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();
    }
}
