use std::sync::Arc;
use std::time::Duration;

use brief_core::{
    meeting_brief_pipeline, AgentRunner, CatalogResolver, ComposioBroker, ConnectionBroker,
    ConnectionRequest, DenyList, Identity, InterceptError, Interceptor, LanguageModel,
    LoggingInterceptor, OpenAiModel, Orchestrator, Pipeline, ToolInvocation,
};
use moka::future::Cache;

use crate::config::ServerConfig;

/// Pending connection requests, keyed by (user id, toolkit)
pub type ConnectionStore = Cache<(String, String), ConnectionRequest>;

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub pipeline: Arc<Pipeline>,
    pub broker: Arc<dyn ConnectionBroker>,
    pub connections: ConnectionStore,
}

impl AppState {
    /// Build the state with the OpenAI model and Composio broker from `config`.
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        let model = OpenAiModel::new(config.openai.clone(), &config.http)?;
        let broker = ComposioBroker::new(config.composio.clone(), &config.http)?;
        Self::with_parts(config, Arc::new(model), Arc::new(broker))
    }

    pub fn with_parts(
        config: ServerConfig,
        model: Arc<dyn LanguageModel>,
        broker: Arc<dyn ConnectionBroker>,
    ) -> anyhow::Result<Self> {
        let pipeline = meeting_brief_pipeline()?;

        let shared = config
            .composio
            .api_key
            .clone()
            .map(|key| Identity::new(config.shared_identity.clone(), key));

        let orchestrator = Orchestrator::new(
            CatalogResolver::new(broker.clone()),
            AgentRunner::new(model, interceptor(&config.denied_tools)),
        )
        .with_shared_identity(shared)
        .with_deadline(Duration::from_secs(config.request_timeout_secs));

        let connections = Cache::builder()
            .time_to_live(Duration::from_secs(config.connection_ttl_secs))
            .build();

        Ok(Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            pipeline: Arc::new(pipeline),
            broker,
            connections,
        })
    }
}

/// Audit every tool call, then veto the configured deny list
fn interceptor(denied: &[String]) -> Arc<dyn Interceptor> {
    if denied.is_empty() {
        return Arc::new(LoggingInterceptor);
    }

    let deny = DenyList::new(denied.iter().cloned());
    Arc::new(
        move |invocation: ToolInvocation| -> Result<ToolInvocation, InterceptError> {
            deny.intercept(LoggingInterceptor.intercept(invocation)?)
        },
    )
}
