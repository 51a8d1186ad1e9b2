pub mod brief;
pub mod catalog;
pub mod composio;
pub mod connection;
pub mod error;
pub mod intercept;
pub mod model;
pub mod network;
pub mod orchestrator;
pub mod runner;
pub mod stage;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use brief::meeting_brief_pipeline;
pub use catalog::CatalogResolver;
pub use composio::{ComposioBroker, ComposioConfig, ToolkitAuth};
pub use connection::{BrokerError, ConnectionBroker, ConnectionRequest, ConnectionStatus};
pub use error::{Error, ErrorKind, Result};
pub use intercept::{DenyList, InterceptError, Interceptor, LoggingInterceptor};
pub use model::{LanguageModel, ModelError, ModelResponse, OpenAiConfig, OpenAiModel};
pub use network::{ApiClient, ClientError, HttpConfig};
pub use orchestrator::{Orchestrator, PipelineRequest};
pub use runner::AgentRunner;
pub use stage::{DefinitionError, Pipeline, PipelineContext, StageScope, StageSpec};
pub use tool::{Identity, ToolCatalog, ToolDescriptor, ToolError, ToolHandle, ToolInvocation};
