use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tool::{Identity, ToolDescriptor, ToolHandle};

/// State of an identity's link to a third-party toolkit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Active,
    Initializing,
    Failed,
    Disconnected,
}

impl ConnectionStatus {
    /// Map a provider status string; anything unrecognized counts as failed.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "ACTIVE" => Self::Active,
            "INITIALIZING" | "INITIATED" | "PENDING" => Self::Initializing,
            "DISCONNECTED" | "" => Self::Disconnected,
            _ => Self::Failed,
        }
    }

    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

/// A connection that has been started but may still await user consent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub id: String,
    pub toolkit: String,
    pub status: ConnectionStatus,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("No active connection to {toolkit} ({status:?})")]
    NotConnected {
        toolkit: String,
        status: ConnectionStatus,
    },
    /// The credential was refused (401/403)
    #[error("Provider refused credential: {0}")]
    Unauthorized(String),
    #[error("Provider rejected request: {0}")]
    Rejected(String),
    /// Rate limited or failing upstream (429/5xx)
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
    #[error("Provider unreachable: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Whether the failure says something about the identity's access rather
    /// than about the provider's health.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::Unauthorized(_))
    }
}

/// External collaborator that knows which capabilities exist and which
/// identities may use them.
#[async_trait]
pub trait ConnectionBroker: Send + Sync {
    /// Describe a capability by name as seen by `identity`; `Ok(None)` when no
    /// such capability exists.
    async fn describe(
        &self,
        identity: &Identity,
        tool_name: &str,
    ) -> Result<Option<ToolDescriptor>, BrokerError>;

    /// Authorize `identity` against `toolkit` and bind handles for `tools`.
    async fn authorize_and_bind(
        &self,
        identity: &Identity,
        toolkit: &str,
        tools: &[ToolDescriptor],
    ) -> Result<Vec<Arc<dyn ToolHandle>>, BrokerError>;

    async fn status(
        &self,
        identity: &Identity,
        toolkit: &str,
    ) -> Result<ConnectionStatus, BrokerError>;

    /// Start linking `identity` to `toolkit`.
    async fn initiate(
        &self,
        identity: &Identity,
        toolkit: &str,
    ) -> Result<ConnectionRequest, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse() {
        assert_eq!(ConnectionStatus::parse("ACTIVE"), ConnectionStatus::Active);
        assert_eq!(ConnectionStatus::parse("active"), ConnectionStatus::Active);
        assert_eq!(ConnectionStatus::parse("INITIATED"), ConnectionStatus::Initializing);
        assert_eq!(ConnectionStatus::parse("EXPIRED"), ConnectionStatus::Failed);
        assert_eq!(ConnectionStatus::parse(""), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&ConnectionStatus::Initializing).unwrap();
        assert_eq!(json, "\"INITIALIZING\"");
    }
}
