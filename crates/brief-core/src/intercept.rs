use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, info};

use crate::tool::ToolInvocation;

#[derive(Debug, Error)]
pub enum InterceptError {
    /// The invocation is vetoed and must not reach the tool.
    #[error("{0}")]
    Rejected(String),
    #[error("Interceptor failed: {0}")]
    Failed(String),
}

/// Hook run synchronously right before every tool call is dispatched.
///
/// May pass the invocation through, rewrite its parameters, or veto it.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, invocation: ToolInvocation) -> Result<ToolInvocation, InterceptError>;
}

impl<F> Interceptor for F
where
    F: Fn(ToolInvocation) -> Result<ToolInvocation, InterceptError> + Send + Sync,
{
    fn intercept(&self, invocation: ToolInvocation) -> Result<ToolInvocation, InterceptError> {
        self(invocation)
    }
}

/// Audit interceptor: records every invocation and passes it through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn intercept(&self, invocation: ToolInvocation) -> Result<ToolInvocation, InterceptError> {
        info!(
            tool = %invocation.tool_name,
            toolkit = %invocation.toolkit_name,
            "Executing tool"
        );
        if let Ok(pretty) = serde_json::to_string_pretty(&invocation.parameters) {
            debug!(tool = %invocation.tool_name, "Tool parameters:\n{pretty}");
        }
        Ok(invocation)
    }
}

/// Vetoes a fixed set of tool names
#[derive(Debug, Default, Clone)]
pub struct DenyList {
    denied: BTreeSet<String>,
}

impl DenyList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            denied: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl Interceptor for DenyList {
    fn intercept(&self, invocation: ToolInvocation) -> Result<ToolInvocation, InterceptError> {
        if self.denied.contains(&invocation.tool_name) {
            return Err(InterceptError::Rejected(format!(
                "{} is on the deny list",
                invocation.tool_name
            )));
        }
        Ok(invocation)
    }
}
