use std::sync::Arc;

use serde::Serialize;

use crate::engine::{Capability, ConversationEngine, EngineConfig};
use crate::model::{Embedder, LanguageModel};

pub const DEFAULT_AGENT: &str = "chatbot";

/// Everything a constructor needs to build an engine for one session.
pub struct AgentParts {
    pub model: Arc<dyn LanguageModel>,
    pub embedder: Arc<dyn Embedder>,
    pub config: EngineConfig,
}

/// A named kind of conversation engine.
#[derive(Serialize)]
pub struct AgentKind {
    pub id: &'static str,
    pub description: &'static str,
    pub capabilities: &'static [Capability],
    #[serde(skip)]
    constructor: fn(AgentParts) -> ConversationEngine,
}

impl AgentKind {
    pub fn build(&self, parts: AgentParts) -> ConversationEngine {
        (self.constructor)(parts)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

const CHATBOT: &[Capability] = &[Capability::Streaming, Capability::Retrieval];
const TOOL_AGENT: &[Capability] = &[Capability::Streaming, Capability::ToolCalling, Capability::Retrieval];
const BASIC: &[Capability] = &[];

fn with_capabilities(parts: AgentParts, capabilities: &'static [Capability]) -> ConversationEngine {
    let mut config = parts.config;
    config.capabilities = capabilities;
    ConversationEngine::new(parts.model, parts.embedder, config)
}

fn chatbot(parts: AgentParts) -> ConversationEngine {
    with_capabilities(parts, CHATBOT)
}

fn tool_agent(parts: AgentParts) -> ConversationEngine {
    with_capabilities(parts, TOOL_AGENT)
}

fn basic(parts: AgentParts) -> ConversationEngine {
    with_capabilities(parts, BASIC)
}

pub static AGENTS: &[AgentKind] = &[
    AgentKind {
        id: "chatbot",
        description: "Streaming chat with retrieval over uploaded files",
        capabilities: CHATBOT,
        constructor: chatbot,
    },
    AgentKind {
        id: "tool_agent",
        description: "Chat that can call tools offered by a connected tool provider",
        capabilities: TOOL_AGENT,
        constructor: tool_agent,
    },
    AgentKind {
        id: "basic",
        description: "Single-shot replies without streaming, tools or files",
        capabilities: BASIC,
        constructor: basic,
    },
];

pub fn find_agent(id: &str) -> Option<&'static AgentKind> {
    AGENTS.iter().find(|a| a.id == id)
}
