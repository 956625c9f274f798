use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::Implementation;
use rust_mcp_schema::schema_utils::{NotificationFromClient, RequestFromClient};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::AdapterError;
use crate::mcp::classify::{classify_connection_error, describe_failure};
use crate::mcp::protocol::{
    call_result_text, call_tool_request, client_details, descriptor_from_tool, list_tools_request,
    parse_call_tool, parse_initialize_result, parse_list_tools,
};
use crate::mcp::transport::{RpcError, RpcTransport, SseTransport, StdioTransport, TransportConfig};
use crate::registry::Release;
use crate::tools::ToolDescriptor;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// One connection to a tool provider.
pub struct ToolConnectionAdapter {
    name: String,
    config: Option<TransportConfig>,
    state: AdapterState,
    transport: Option<Arc<dyn RpcTransport>>,
    tools: Vec<ToolDescriptor>,
    server_info: Option<Implementation>,
    handshake_timeout: Duration,
}

impl ToolConnectionAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
            state: AdapterState::Disconnected,
            transport: None,
            tools: Vec::new(),
            server_info: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == AdapterState::Connected
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    /// Opens the transport, runs the handshake and caches the tool list.
    ///
    /// A failed connect leaves nothing running and the adapter in `Failed`.
    pub async fn connect(&mut self, config: TransportConfig) -> Result<(), AdapterError> {
        self.disconnect().await;
        self.config = Some(config.clone());
        self.state = AdapterState::Connecting;
        debug!(adapter = %self.name, "connecting to tool provider");

        let transport: Arc<dyn RpcTransport> = match open_transport(&config).await {
            Ok(t) => t,
            Err(e) => return Err(self.fail(&config, &e.to_string(), String::new())),
        };

        let handshake = handshake(transport.as_ref());
        let outcome = if config.is_process() {
            match tokio::time::timeout(self.handshake_timeout, handshake).await {
                Ok(r) => r,
                Err(_) => Err(RpcError::Transport(format!(
                    "handshake timed out after {}s",
                    self.handshake_timeout.as_secs()
                ))),
            }
        } else {
            handshake.await
        };

        match outcome {
            Ok((server_info, tools)) => {
                info!(adapter = %self.name, tools = tools.len(), "tool provider connected");
                self.server_info = Some(server_info);
                self.tools = tools;
                self.transport = Some(transport);
                self.state = AdapterState::Connected;
                Ok(())
            }
            Err(e) => {
                transport.close().await;
                let diagnostics = transport.diagnostics().await;
                Err(self.fail(&config, &e.to_string(), diagnostics))
            }
        }
    }

    fn fail(&mut self, config: &TransportConfig, detail: &str, diagnostics: String) -> AdapterError {
        self.state = AdapterState::Failed;
        self.transport = None;
        self.tools.clear();
        let detail = if diagnostics.trim().is_empty() {
            detail.to_string()
        } else {
            format!("{detail}: {}", diagnostics.trim())
        };
        let kind = classify_connection_error(&detail, Some(config));
        warn!(adapter = %self.name, kind = ?kind, detail = %detail, "tool provider connection failed");
        metrics::counter!("parley_mcp_connect_failures_total").increment(1);
        AdapterError::Connection {
            message: describe_failure(&kind, &detail),
            kind,
        }
    }

    /// Tears down and connects again with the last configuration.
    pub async fn reconnect(&mut self) -> Result<(), AdapterError> {
        let config = self.config.clone().ok_or(AdapterError::NotConnected)?;
        info!(adapter = %self.name, "reconnecting to tool provider");
        self.connect(config).await
    }

    pub fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AdapterError> {
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        Ok(self.tools.clone())
    }

    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<String, AdapterError> {
        let transport = match (&self.transport, self.state) {
            (Some(t), AdapterState::Connected) => t.clone(),
            _ => return Err(AdapterError::NotConnected),
        };
        debug!(adapter = %self.name, tool = name, "calling tool");
        let result = transport
            .request(call_tool_request(name, arguments))
            .await
            .and_then(parse_call_tool);
        match result {
            Ok(result) => {
                let text = call_result_text(&result);
                if result.is_error.unwrap_or(false) {
                    return Err(AdapterError::ToolExecution { tool: name.to_string(), message: text });
                }
                Ok(text)
            }
            Err(RpcError::Remote { message, .. }) | Err(RpcError::Malformed(message)) => {
                Err(AdapterError::ToolExecution { tool: name.to_string(), message })
            }
            Err(RpcError::Transport(message)) => {
                warn!(adapter = %self.name, tool = name, error = %message, "tool provider transport broke");
                self.state = AdapterState::Failed;
                Err(AdapterError::Transport(message))
            }
        }
    }

    /// Releases the transport. Safe to call any number of times.
    pub async fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
            debug!(adapter = %self.name, "tool provider disconnected");
        }
        self.tools.clear();
        self.server_info = None;
        self.state = AdapterState::Disconnected;
    }
}

async fn open_transport(config: &TransportConfig) -> Result<Arc<dyn RpcTransport>, RpcError> {
    Ok(match config {
        TransportConfig::Stdio { command, args, env } => Arc::new(StdioTransport::spawn(command, args, env)?),
        TransportConfig::Sse { url } => Arc::new(SseTransport::connect(url).await?),
    })
}

async fn handshake(transport: &dyn RpcTransport) -> Result<(Implementation, Vec<ToolDescriptor>), RpcError> {
    let init = transport
        .request(RequestFromClient::InitializeRequest(client_details()))
        .await
        .and_then(parse_initialize_result)?;
    debug!(protocol = %init.protocol_version, server = %init.server_info.name, "handshake accepted");
    transport
        .notify(NotificationFromClient::InitializedNotification(None))
        .await?;

    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = transport
            .request(list_tools_request(cursor.take()))
            .await
            .and_then(parse_list_tools)?;
        tools.extend(page.tools.iter().map(descriptor_from_tool));
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }
    Ok((init.server_info, tools))
}

#[async_trait]
impl Release for Mutex<ToolConnectionAdapter> {
    async fn release(&self) -> anyhow::Result<()> {
        self.lock().await.disconnect().await;
        Ok(())
    }
}
