use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Caller scope that tool authorization is resolved against.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub credential: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            credential: credential.into(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Declared shape of a capability, as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub toolkit: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's arguments
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, toolkit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            toolkit: toolkit.into(),
            description: String::new(),
            parameters: empty_schema(),
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// A capability bound to one identity, invocable by the agent loop.
#[async_trait]
pub trait ToolHandle: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn invoke(&self, parameters: Value) -> Result<Value, ToolError>;
}

impl fmt::Debug for dyn ToolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ToolHandle").field(&self.descriptor().name).finish()
    }
}

/// Resolved tools for one stage, keyed by capability name.
pub type ToolCatalog = BTreeMap<String, Arc<dyn ToolHandle>>;

/// One tool call as seen by the interceptor, just before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub toolkit_name: String,
    pub parameters: Value,
}
