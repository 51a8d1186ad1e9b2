use brief_core::{ComposioConfig, HttpConfig, OpenAiConfig, ToolkitAuth};
use serde::{Deserialize, Serialize};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CONNECTION_TTL_SECS: u64 = 600;
const DEFAULT_SHARED_IDENTITY: &str = "default";
const APOLLO_TOOLKIT: &str = "apollo";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory of the web UI; the API is served alone when unset
    pub static_dir: Option<String>,
    /// Deadline for one whole pipeline run
    pub request_timeout_secs: u64,
    /// How long a pending connection request is remembered
    pub connection_ttl_secs: u64,
    /// User id for stages running under the shared credential
    pub shared_identity: String,
    /// Tools the interceptor vetoes before they execute
    #[serde(default)]
    pub denied_tools: Vec<String>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub composio: ComposioConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            static_dir: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connection_ttl_secs: DEFAULT_CONNECTION_TTL_SECS,
            shared_identity: DEFAULT_SHARED_IDENTITY.to_string(),
            denied_tools: Vec::new(),
            http: HttpConfig::default(),
            openai: OpenAiConfig::default(),
            composio: ComposioConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, fallback: u64| {
            var(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(fallback)
        };

        let mut toolkit_auth = defaults.composio.toolkit_auth;
        if let Some(api_key) = var("APOLLO_API_KEY") {
            toolkit_auth.insert(APOLLO_TOOLKIT.to_string(), ToolkitAuth::ApiKey { api_key });
        }

        Self {
            port: var("BRIEF_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            static_dir: var("BRIEF_STATIC"),
            request_timeout_secs: number("BRIEF_REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            connection_ttl_secs: number("BRIEF_CONNECTION_TTL_SECS", defaults.connection_ttl_secs),
            shared_identity: var("BRIEF_SHARED_IDENTITY").unwrap_or(defaults.shared_identity),
            denied_tools: var("BRIEF_DENIED_TOOLS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            http: defaults.http,
            openai: OpenAiConfig {
                base_url: var("OPENAI_BASE_URL").unwrap_or(defaults.openai.base_url),
                model: var("OPENAI_MODEL").unwrap_or(defaults.openai.model),
                api_key: var("OPENAI_API_KEY"),
                temperature: defaults.openai.temperature,
            },
            composio: ComposioConfig {
                base_url: var("COMPOSIO_BASE_URL").unwrap_or(defaults.composio.base_url),
                api_key: var("COMPOSIO_API_KEY"),
                no_auth_toolkits: defaults.composio.no_auth_toolkits,
                toolkit_auth,
            },
        }
    }
}
