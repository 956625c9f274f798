use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Static metadata about one invocable tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolDescriptor {
    /// Builds a descriptor from a JSON-schema `object` as tool providers publish it.
    pub fn from_input_schema(name: &str, description: Option<&str>, schema: &Value) -> Self {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let mut parameters: Vec<ToolParameter> = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| {
                props
                    .iter()
                    .map(|(pname, prop)| ToolParameter {
                        name: pname.clone(),
                        kind: prop
                            .get("type")
                            .and_then(Value::as_str)
                            .unwrap_or("string")
                            .to_string(),
                        required: required.contains(&pname.as_str()),
                        description: prop
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        parameters.sort_by(|a, b| b.required.cmp(&a.required).then(a.name.cmp(&b.name)));
        Self {
            name: name.to_string(),
            description: description.unwrap_or_default().to_string(),
            parameters,
        }
    }

    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.parameters {
            let mut prop = Map::new();
            prop.insert("type".into(), Value::String(p.kind.clone()));
            if let Some(d) = &p.description {
                prop.insert("description".into(), Value::String(d.clone()));
            }
            properties.insert(p.name.clone(), Value::Object(prop));
        }
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        json!({ "type": "object", "properties": properties, "required": required })
    }
}

/// A structured tool-call request emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// What happened when one requested call was resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    pub result: String,
    pub status: InvocationStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Ok,
    Error,
    Unavailable,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Ok => "ok",
            InvocationStatus::Error => "error",
            InvocationStatus::Unavailable => "unavailable",
        }
    }
}

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>>;

/// A callable the engine can run when the model requests it.
pub trait ToolFunction: Send + Sync {
    fn name(&self) -> &str;
    fn run<'a>(&'a self, args: Value) -> ToolFuture<'a>;
}

/// Lookup table of functions offered to the model for one turn.
#[derive(Clone, Default)]
pub struct AvailableFunctions {
    functions: HashMap<String, Arc<dyn ToolFunction>>,
}

impl AvailableFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, f: Arc<dyn ToolFunction>) {
        self.functions.insert(f.name().to_string(), f);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolFunction>> {
        self.functions.get(name)
    }
}

/// Descriptors plus the functions backing them, as handed to one turn.
#[derive(Clone, Default)]
pub struct Tooling {
    pub descriptors: Vec<ToolDescriptor>,
    pub functions: Option<AvailableFunctions>,
}
