use serde::Serialize;
use thiserror::Error;

/// Failure taxonomy surfaced to pipeline callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    MissingCredential,
    UnauthorizedCapability,
    UnknownCapability,
    ModelUnavailable,
    ToolExecutionFailure,
    InvocationRejected,
    StepBudgetExceeded,
    Cancelled,
    UnknownFailure,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingCredential => "MissingCredential",
            Self::UnauthorizedCapability => "UnauthorizedCapability",
            Self::UnknownCapability => "UnknownCapability",
            Self::ModelUnavailable => "ModelUnavailable",
            Self::ToolExecutionFailure => "ToolExecutionFailure",
            Self::InvocationRejected => "InvocationRejected",
            Self::StepBudgetExceeded => "StepBudgetExceeded",
            Self::Cancelled => "Cancelled",
            Self::UnknownFailure => "UnknownFailure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing credential for {0} scope")]
    MissingCredential(String),

    #[error("Capability {capability} is not authorized (toolkit {toolkit}): {reason}")]
    UnauthorizedCapability {
        capability: String,
        toolkit: String,
        reason: String,
    },

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Tool {tool} failed: {message}")]
    ToolExecutionFailure { tool: String, message: String },

    #[error("Invocation of {tool} rejected: {reason}")]
    InvocationRejected { tool: String, reason: String },

    #[error("Step budget of {budget} rounds exhausted without any model output")]
    StepBudgetExceeded { budget: usize },

    #[error("Pipeline run cancelled")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn in_stage(self, stage: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.into(),
            source: Box::new(self),
        }
    }

    /// Kind of the innermost failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingCredential(_) => ErrorKind::MissingCredential,
            Self::UnauthorizedCapability { .. } => ErrorKind::UnauthorizedCapability,
            Self::UnknownCapability(_) => ErrorKind::UnknownCapability,
            Self::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            Self::ToolExecutionFailure { .. } => ErrorKind::ToolExecutionFailure,
            Self::InvocationRejected { .. } => ErrorKind::InvocationRejected,
            Self::StepBudgetExceeded { .. } => ErrorKind::StepBudgetExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Unknown(_) => ErrorKind::UnknownFailure,
            Self::Stage { source, .. } => source.kind(),
        }
    }

    /// Name of the stage the failure happened in, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
