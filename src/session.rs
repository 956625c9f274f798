use crate::settings::SessionSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Chatbot,
    ToolClient,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Chatbot => "chatbot",
            SessionType::ToolClient => "tool_client",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chatbot" => Ok(SessionType::Chatbot),
            "tool_client" => Ok(SessionType::ToolClient),
            other => anyhow::bail!("unknown session type: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => anyhow::bail!("unknown role: {other}"),
        }
    }
}

/// Durable record of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub model_name: String,
    pub session_type: SessionType,
    pub agent: String,
    pub system_message: Option<String>,
    pub settings: SessionSettings,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub is_active: bool,
}

/// Parameters for creating a session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: String,
    pub model_name: String,
    pub session_type: SessionType,
    pub agent: String,
    pub system_message: Option<String>,
    pub settings: SessionSettings,
}

impl NewSession {
    pub fn new(model_name: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            session_id: new_session_id(),
            model_name: model_name.into(),
            session_type: SessionType::Chatbot,
            agent: agent.into(),
            system_message: None,
            settings: SessionSettings::default(),
        }
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One tool invocation captured while answering a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEvent {
    pub id: String,
    pub tool: String,
    pub arguments: serde_json::Value,
    pub result: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Filters for reading back a session's history.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageQuery {
    pub role: Option<Role>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}
