use serde::{Deserialize, Serialize};

/// Transport settings shared by every outbound API client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,

    /// Whole-request timeout in seconds; model completions can be slow
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u32,

    /// User agent sent with every request
    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_connect_timeout() -> u32 {
    10
}

fn default_request_timeout() -> u32 {
    120
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_seconds: default_connect_timeout(),
            request_timeout_seconds: default_request_timeout(),
            user_agent: None,
        }
    }
}

impl HttpConfig {
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| concat!("brief-core/", env!("CARGO_PKG_VERSION")).to_string())
    }
}
