use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{LanguageModel, ModelError, ModelResponse, ToolCall, Turn};
use crate::network::{ApiClient, ClientError, HttpConfig};
use crate::tool::ToolDescriptor;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4.1";

#[derive(Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            temperature: None,
        }
    }
}

impl fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("temperature", &self.temperature)
            .finish()
    }
}

/// Chat-completions model speaking the OpenAI wire format
pub struct OpenAiModel {
    config: OpenAiConfig,
    client: ApiClient,
}

impl OpenAiModel {
    pub fn new(config: OpenAiConfig, http: &HttpConfig) -> Result<Self, ModelError> {
        let client = ApiClient::new(&config.base_url, http)
            .map_err(|e| ModelError::NotConfigured(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn complete(
        &self,
        transcript: &[Turn],
        tools: &[ToolDescriptor],
    ) -> Result<ModelResponse, ModelError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ModelError::NotConfigured("OPENAI_API_KEY is not set".into()))?;

        let body = build_request(&self.config, transcript, tools);
        let request = self
            .client
            .post("chat/completions")
            .map_err(|e| ModelError::NotConfigured(e.to_string()))?
            .bearer_auth(api_key)
            .json(&body);

        let response: ChatResponse = self.client.send_json(request).await.map_err(|e| match e {
            ClientError::Status { status, body } => ModelError::Rejected {
                status: status.as_u16(),
                body,
            },
            other => ModelError::Transport(other.to_string()),
        })?;

        parse_response(response)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: ChatFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ChatFunction<'a>,
}

#[derive(Debug, Serialize)]
struct ChatFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

fn build_request<'a>(
    config: &'a OpenAiConfig,
    transcript: &[Turn],
    tools: &'a [ToolDescriptor],
) -> ChatRequest<'a> {
    let messages = transcript
        .iter()
        .map(|turn| match turn {
            Turn::User { content } => ChatMessage {
                role: "user".into(),
                content: Some(content.clone()),
                tool_calls: None,
                tool_call_id: None,
            },
            Turn::Assistant { content, tool_calls } => ChatMessage {
                role: "assistant".into(),
                content: content.clone(),
                tool_calls: (!tool_calls.is_empty()).then(|| {
                    tool_calls
                        .iter()
                        .map(|call| ChatToolCall {
                            id: call.id.clone(),
                            kind: function_type(),
                            function: ChatFunctionCall {
                                name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        })
                        .collect()
                }),
                tool_call_id: None,
            },
            Turn::Tool { call_id, content, .. } => ChatMessage {
                role: "tool".into(),
                content: Some(content.clone()),
                tool_calls: None,
                tool_call_id: Some(call_id.clone()),
            },
        })
        .collect();

    let tools = tools
        .iter()
        .map(|tool| ChatTool {
            kind: "function",
            function: ChatFunction {
                name: &tool.name,
                description: &tool.description,
                parameters: &tool.parameters,
            },
        })
        .collect();

    ChatRequest {
        model: &config.model,
        messages,
        tools,
        temperature: config.temperature,
    }
}

fn parse_response(response: ChatResponse) -> Result<ModelResponse, ModelError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ModelError::Malformed("response has no choices".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCall {
            id: call.id,
            name: call.function.name,
            arguments: call.function.arguments,
        })
        .collect();

    Ok(ModelResponse {
        text: choice.message.content.filter(|text| !text.is_empty()),
        tool_calls,
    })
}
