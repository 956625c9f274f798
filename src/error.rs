use serde::Serialize;
use thiserror::Error;

/// How a failed tool-provider connection should be explained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionFailureKind {
    /// Another process already holds the address or port the provider needs.
    ResourceInUse { resource: Option<String> },
    Generic,
}

impl ConnectionFailureKind {
    pub fn is_resource_in_use(&self) -> bool {
        matches!(self, ConnectionFailureKind::ResourceInUse { .. })
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{message}")]
    Connection {
        kind: ConnectionFailureKind,
        message: String,
    },
    #[error("tool provider is not connected")]
    NotConnected,
    #[error("tool `{tool}` failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("tool provider transport failed: {0}")]
    Transport(String),
}

impl AdapterError {
    pub fn is_transport(&self) -> bool {
        matches!(self, AdapterError::Transport(_))
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("the model runtime at {address} is unavailable ({detail})")]
    Unavailable { address: String, detail: String },
    #[error("model request failed with status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("could not decode model response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("{capability} is not available; {hint}")]
    MissingCapability { capability: String, hint: String },
    #[error("this agent does not support {0}")]
    Unsupported(&'static str),
    #[error("the conversation engine is not initialized")]
    NotReady,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Generation(String),
}

impl EngineError {
    /// Text shown to the user in place of an answer when a turn fails.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::Model(ModelError::Unavailable { address, .. }) => format!(
                "The language model runtime at {address} is not reachable or is busy. Make sure Ollama is running and try again."
            ),
            EngineError::MissingCapability { .. } => self.to_string(),
            other => format!("Sorry, something went wrong while generating a response: {other}"),
        }
    }
}
