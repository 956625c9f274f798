use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::AdapterError;
use crate::mcp::adapter::ToolConnectionAdapter;
use crate::tools::{AvailableFunctions, ToolFunction, ToolFuture, Tooling};

/// Calls a tool, retrying once through a fresh connection if the transport broke.
pub async fn call_with_reconnect(
    adapter: &Mutex<ToolConnectionAdapter>,
    name: &str,
    arguments: Value,
) -> Result<String, AdapterError> {
    let mut guard = adapter.lock().await;
    match guard.call_tool(name, arguments.clone()).await {
        Err(e) if e.is_transport() => {
            warn!(adapter = %guard.name(), tool = name, error = %e, "retrying tool call after reconnect");
            guard.reconnect().await?;
            guard.call_tool(name, arguments).await
        }
        other => other,
    }
}

/// Exposes one provider tool as a function the engine can run.
pub struct McpToolFunction {
    name: String,
    adapter: Arc<Mutex<ToolConnectionAdapter>>,
}

impl McpToolFunction {
    pub fn new(name: impl Into<String>, adapter: Arc<Mutex<ToolConnectionAdapter>>) -> Self {
        Self { name: name.into(), adapter }
    }
}

impl ToolFunction for McpToolFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn run<'a>(&'a self, args: Value) -> ToolFuture<'a> {
        Box::pin(async move {
            let out = call_with_reconnect(&self.adapter, &self.name, args).await?;
            Ok(out)
        })
    }
}

/// Descriptors and functions for every tool the adapter currently offers.
pub async fn tooling_for(adapter: &Arc<Mutex<ToolConnectionAdapter>>) -> Result<Tooling, AdapterError> {
    let descriptors = adapter.lock().await.list_tools()?;
    let mut functions = AvailableFunctions::new();
    for d in &descriptors {
        functions.register(Arc::new(McpToolFunction::new(d.name.clone(), adapter.clone())));
    }
    Ok(Tooling { descriptors, functions: Some(functions) })
}

#[cfg(all(test, unix))]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mcp::adapter::tests::fake_provider;
    use crate::mcp::transport::TransportConfig;

    #[tokio::test]
    async fn tooling_wraps_every_listed_tool() {
        let mut adapter = ToolConnectionAdapter::new("fake");
        adapter.connect(fake_provider()).await.unwrap();
        let adapter = Arc::new(Mutex::new(adapter));

        let tooling = tooling_for(&adapter).await.unwrap();
        assert_eq!(tooling.descriptors.len(), 1);
        let functions = tooling.functions.unwrap();
        let echo = functions.get("echo").unwrap();
        assert_eq!(echo.run(json!({"text": "x"})).await.unwrap(), "echoed");
    }

    #[tokio::test]
    async fn broken_transport_is_reconnected_once() {
        // answers the handshake of the first process, then dies on any call;
        // the marker file makes the second process behave
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("started");
        let script = format!(
            r#"
first=1
[ -f '{m}' ] && first=0
touch '{m}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{}},"serverInfo":{{"name":"flaky","version":"0"}}}}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"echo","inputSchema":{{"type":"object"}}}}]}}}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      [ "$first" = 1 ] && exit 0
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"second"}}]}}}}\n' "$id" ;;
  esac
done
"#,
            m = marker.display()
        );
        let config = TransportConfig::Stdio {
            command: "sh".into(),
            args: vec!["-c".into(), script],
            env: Default::default(),
        };
        let mut adapter = ToolConnectionAdapter::new("flaky");
        adapter.connect(config).await.unwrap();
        let adapter = Mutex::new(adapter);

        let out = call_with_reconnect(&adapter, "echo", json!({})).await.unwrap();
        assert_eq!(out, "second");
        assert!(adapter.lock().await.is_connected());
    }

    #[tokio::test]
    async fn disconnected_adapter_is_not_retried() {
        let adapter = Mutex::new(ToolConnectionAdapter::new("idle"));
        let err = call_with_reconnect(&adapter, "echo", json!({})).await.unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected));
    }
}
