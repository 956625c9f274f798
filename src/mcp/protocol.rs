//! Typed MCP messages on top of the raw transports.

use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient, ServerMessage,
};
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, ContentBlock, Implementation,
    InitializeRequestParams, InitializeResult, LATEST_PROTOCOL_VERSION, ListToolsResult, PaginatedRequestParams,
    RequestId, Tool,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::mcp::transport::RpcError;
use crate::tools::ToolDescriptor;

pub fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "parley".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Parley".to_string()),
            description: Some("Parley chat backend".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub fn encode_request(request: RequestFromClient, id: RequestId) -> Result<String, RpcError> {
    let message = ClientMessage::from_message(MessageFromClient::RequestFromClient(request), Some(id))
        .map_err(|e| RpcError::Malformed(e.to_string()))?;
    serde_json::to_string(&message).map_err(|e| RpcError::Malformed(e.to_string()))
}

pub fn encode_notification(notification: NotificationFromClient) -> Result<String, RpcError> {
    let message = ClientMessage::from_message(MessageFromClient::NotificationFromClient(notification), None)
        .map_err(|e| RpcError::Malformed(e.to_string()))?;
    serde_json::to_string(&message).map_err(|e| RpcError::Malformed(e.to_string()))
}

pub fn list_tools_request(cursor: Option<String>) -> RequestFromClient {
    let params = cursor.map(|cursor| PaginatedRequestParams { cursor: Some(cursor), meta: None });
    RequestFromClient::ListToolsRequest(params)
}

pub fn call_tool_request(name: &str, arguments: Value) -> RequestFromClient {
    let mut params = CallToolRequestParams::new(name);
    match arguments {
        Value::Object(map) => params = params.with_arguments(map),
        Value::Null => {}
        other => {
            let mut map = serde_json::Map::new();
            map.insert("input".to_string(), other);
            params = params.with_arguments(map);
        }
    }
    RequestFromClient::CallToolRequest(params)
}

/// Unwraps a reply into its typed result, turning JSON-RPC errors into `Remote`.
pub fn parse_response<T: DeserializeOwned>(message: ServerMessage) -> Result<T, RpcError> {
    let value = match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(|e| RpcError::Malformed(e.to_string()))?
        }
        ServerMessage::Error(error) => {
            return Err(RpcError::Remote { code: error.error.code, message: error.error.message });
        }
        _ => return Err(RpcError::Malformed("expected a response from the tool provider".into())),
    };
    serde_json::from_value(value).map_err(|e| RpcError::Malformed(e.to_string()))
}

pub fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, RpcError> {
    let result: InitializeResult = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err(RpcError::Malformed("initialize reply without a protocol version".into()));
    }
    Ok(result)
}

pub fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, RpcError> {
    parse_response(message)
}

pub fn parse_call_tool(message: ServerMessage) -> Result<CallToolResult, RpcError> {
    parse_response(message)
}

pub fn descriptor_from_tool(tool: &Tool) -> ToolDescriptor {
    let schema = serde_json::to_value(&tool.input_schema).unwrap_or(Value::Null);
    ToolDescriptor::from_input_schema(&tool.name, tool.description.as_deref(), &schema)
}

/// Flattens a tool result into text; non-text blocks are kept as JSON.
pub fn call_result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::TextContent(text) => text.text.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
