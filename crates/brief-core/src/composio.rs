//! Connection broker backed by the Composio v3 REST API.
//!
//! Every call authenticates with the credential of the identity it is made
//! for, catalog lookups included. [`ComposioConfig::api_key`] is only the
//! credential of the shared identity.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::connection::{BrokerError, ConnectionBroker, ConnectionRequest, ConnectionStatus};
use crate::network::{ApiClient, ClientError, HttpConfig};
use crate::tool::{Identity, ToolDescriptor, ToolError, ToolHandle};

const DEFAULT_BASE_URL: &str = "https://backend.composio.dev";
const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone, Serialize, Deserialize)]
pub struct ComposioConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Credential of the shared identity
    #[serde(default)]
    pub api_key: Option<String>,
    /// Toolkits that need no per-identity connection
    #[serde(default = "default_no_auth_toolkits")]
    pub no_auth_toolkits: Vec<String>,
    /// How connections to each toolkit authenticate; absent means managed
    #[serde(default)]
    pub toolkit_auth: BTreeMap<String, ToolkitAuth>,
}

/// Auth scheme used when creating a toolkit's auth config
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolkitAuth {
    /// OAuth app managed by Composio; the user follows a redirect
    #[default]
    Managed,
    /// Server-held API key; the connection is usable without a redirect
    ApiKey { api_key: String },
}

impl std::fmt::Debug for ToolkitAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Managed => f.write_str("Managed"),
            Self::ApiKey { .. } => f.write_str("ApiKey(<redacted>)"),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_no_auth_toolkits() -> Vec<String> {
    vec!["composio_search".to_string()]
}

impl Default for ComposioConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            no_auth_toolkits: default_no_auth_toolkits(),
            toolkit_auth: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for ComposioConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposioConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("no_auth_toolkits", &self.no_auth_toolkits)
            .field("toolkit_auth", &self.toolkit_auth)
            .finish()
    }
}

pub struct ComposioBroker {
    config: ComposioConfig,
    client: ApiClient,
}

impl ComposioBroker {
    pub fn new(config: ComposioConfig, http: &HttpConfig) -> Result<Self, BrokerError> {
        let client = ApiClient::new(&config.base_url, http).map_err(provider_error)?;
        Ok(Self { config, client })
    }

    fn requires_connection(&self, toolkit: &str) -> bool {
        !self
            .config
            .no_auth_toolkits
            .iter()
            .any(|t| t.eq_ignore_ascii_case(toolkit))
    }

    async fn latest_account(
        &self,
        identity: &Identity,
        toolkit: &str,
    ) -> Result<Option<AccountItem>, BrokerError> {
        let request = self
            .client
            .get("api/v3/connected_accounts")
            .map_err(provider_error)?
            .header(API_KEY_HEADER, &identity.credential)
            .query(&[
                ("user_ids", identity.user_id.as_str()),
                ("toolkit_slugs", toolkit),
            ]);

        let page: AccountPage = self
            .client
            .send_json(request)
            .await
            .map_err(provider_error)?;

        Ok(page.items.into_iter().max_by_key(|a| a.created_at))
    }

    async fn auth_config_id(&self, identity: &Identity, toolkit: &str) -> Result<String, BrokerError> {
        if let Some(ToolkitAuth::ApiKey { api_key }) = self.config.toolkit_auth.get(toolkit) {
            // Custom configs carry the key, so each connection gets a fresh one
            debug!(toolkit, "Creating API key auth config");
            return self
                .create_auth_config(
                    identity,
                    toolkit,
                    json!({
                        "type": "use_custom_auth",
                        "name": toolkit,
                        "authScheme": "API_KEY",
                        "credentials": { "api_key": api_key }
                    }),
                )
                .await;
        }

        let request = self
            .client
            .get("api/v3/auth_configs")
            .map_err(provider_error)?
            .header(API_KEY_HEADER, &identity.credential)
            .query(&[("toolkit_slug", toolkit)]);

        let existing: AuthConfigPage = self
            .client
            .send_json(request)
            .await
            .map_err(provider_error)?;
        if let Some(config) = existing.items.into_iter().next() {
            return Ok(config.id);
        }

        debug!(toolkit, "Creating managed auth config");
        self.create_auth_config(
            identity,
            toolkit,
            json!({ "type": "use_composio_managed_auth" }),
        )
        .await
    }

    async fn create_auth_config(
        &self,
        identity: &Identity,
        toolkit: &str,
        auth_config: Value,
    ) -> Result<String, BrokerError> {
        let request = self
            .client
            .post("api/v3/auth_configs")
            .map_err(provider_error)?
            .header(API_KEY_HEADER, &identity.credential)
            .json(&json!({
                "toolkit": { "slug": toolkit },
                "auth_config": auth_config
            }));

        let created: CreatedAuthConfig = self
            .client
            .send_json(request)
            .await
            .map_err(provider_error)?;
        Ok(created.auth_config.id)
    }
}

#[async_trait]
impl ConnectionBroker for ComposioBroker {
    async fn describe(
        &self,
        identity: &Identity,
        tool_name: &str,
    ) -> Result<Option<ToolDescriptor>, BrokerError> {
        let request = self
            .client
            .get(&format!("api/v3/tools/{tool_name}"))
            .map_err(provider_error)?
            .header(API_KEY_HEADER, &identity.credential);

        match self.client.send_json::<ToolDefinition>(request).await {
            Ok(definition) => Ok(Some(definition.into_descriptor())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(provider_error(e)),
        }
    }

    async fn authorize_and_bind(
        &self,
        identity: &Identity,
        toolkit: &str,
        tools: &[ToolDescriptor],
    ) -> Result<Vec<Arc<dyn ToolHandle>>, BrokerError> {
        if self.requires_connection(toolkit) {
            let status = self.status(identity, toolkit).await?;
            if !status.is_active() {
                return Err(BrokerError::NotConnected {
                    toolkit: toolkit.to_string(),
                    status,
                });
            }
        }

        Ok(tools
            .iter()
            .map(|descriptor| {
                let handle: Arc<dyn ToolHandle> = Arc::new(ComposioTool {
                    descriptor: descriptor.clone(),
                    client: self.client.clone(),
                    identity: identity.clone(),
                });
                handle
            })
            .collect())
    }

    async fn status(
        &self,
        identity: &Identity,
        toolkit: &str,
    ) -> Result<ConnectionStatus, BrokerError> {
        Ok(self
            .latest_account(identity, toolkit)
            .await?
            .map_or(ConnectionStatus::Disconnected, |a| {
                ConnectionStatus::parse(&a.status)
            }))
    }

    async fn initiate(
        &self,
        identity: &Identity,
        toolkit: &str,
    ) -> Result<ConnectionRequest, BrokerError> {
        let auth_config = self.auth_config_id(identity, toolkit).await?;

        let request = self
            .client
            .post("api/v3/connected_accounts")
            .map_err(provider_error)?
            .header(API_KEY_HEADER, &identity.credential)
            .json(&json!({
                "auth_config": { "id": auth_config },
                "connection": { "user_id": identity.user_id }
            }));

        let created: CreatedAccount = self
            .client
            .send_json(request)
            .await
            .map_err(provider_error)?;

        debug!(toolkit, user_id = %identity.user_id, "Connection initiated");
        Ok(ConnectionRequest {
            id: created.id,
            toolkit: toolkit.to_string(),
            status: created
                .status
                .as_deref()
                .map_or(ConnectionStatus::Initializing, ConnectionStatus::parse),
            redirect_url: created.redirect_url,
        })
    }
}

/// Tool bound to one identity, executed remotely by Composio
struct ComposioTool {
    descriptor: ToolDescriptor,
    client: ApiClient,
    identity: Identity,
}

impl ComposioTool {
    fn execute_request(&self, parameters: Value) -> Result<RequestBuilder, ToolError> {
        Ok(self
            .client
            .post(&format!("api/v3/tools/execute/{}", self.descriptor.name))
            .map_err(|e| ToolError::Transport(e.to_string()))?
            .header(API_KEY_HEADER, &self.identity.credential)
            .json(&json!({
                "user_id": self.identity.user_id,
                "arguments": parameters,
            })))
    }
}

#[async_trait]
impl ToolHandle for ComposioTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, parameters: Value) -> Result<Value, ToolError> {
        let request = self.execute_request(parameters)?;
        let result: ExecutionResult = self.client.send_json(request).await.map_err(|e| match e {
            ClientError::Status { status, body } => {
                ToolError::Failed(format!("HTTP {status}: {body}"))
            }
            other => ToolError::Transport(other.to_string()),
        })?;

        if result.successful {
            Ok(result.data)
        } else {
            Err(ToolError::Failed(
                result
                    .error
                    .unwrap_or_else(|| "tool reported failure".to_string()),
            ))
        }
    }
}

fn provider_error(e: ClientError) -> BrokerError {
    match e {
        ClientError::Status { status, body } => {
            let message = format!("HTTP {status}: {body}");
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                BrokerError::Unauthorized(message)
            } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                BrokerError::Unavailable(message)
            } else {
                BrokerError::Rejected(message)
            }
        }
        other => BrokerError::Transport(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ToolDefinition {
    slug: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_parameters: Option<Value>,
    toolkit: ToolkitRef,
}

impl ToolDefinition {
    fn into_descriptor(self) -> ToolDescriptor {
        let descriptor = ToolDescriptor::new(self.slug, self.toolkit.slug.to_ascii_lowercase())
            .with_description(self.description);
        match self.input_parameters {
            Some(schema) if schema.is_object() => descriptor.with_parameters(schema),
            _ => descriptor,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolkitRef {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct AccountPage {
    #[serde(default)]
    items: Vec<AccountItem>,
}

#[derive(Debug, Deserialize)]
struct AccountItem {
    #[serde(default)]
    status: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AuthConfigPage {
    #[serde(default)]
    items: Vec<AuthConfigRef>,
}

#[derive(Debug, Deserialize)]
struct AuthConfigRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedAuthConfig {
    auth_config: AuthConfigRef,
}

#[derive(Debug, Deserialize)]
struct CreatedAccount {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "redirect_uri")]
    redirect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecutionResult {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    successful: bool,
}
