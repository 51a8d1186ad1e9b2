use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::CatalogResolver;
use crate::error::{Error, Result};
use crate::runner::AgentRunner;
use crate::stage::{Pipeline, PipelineContext, StageScope, StageSpec, NOW_PARAMETER};
use crate::tool::Identity;

/// Inputs of one pipeline run
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub caller: Identity,
    /// Fixed template parameters; `now` is filled in when absent
    pub parameters: BTreeMap<String, String>,
}

impl PipelineRequest {
    pub fn new(caller: Identity) -> Self {
        Self {
            caller,
            parameters: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// Runs the stages of a pipeline strictly in order, threading each stage's
/// output into the prompts of later stages.
///
/// A run either completes every stage or aborts on the first failure; the
/// partial context of an aborted run is discarded.
pub struct Orchestrator {
    resolver: CatalogResolver,
    runner: AgentRunner,
    shared: Option<Identity>,
    deadline: Option<Duration>,
}

impl Orchestrator {
    pub fn new(resolver: CatalogResolver, runner: AgentRunner) -> Self {
        Self {
            resolver,
            runner,
            shared: None,
            deadline: None,
        }
    }

    /// Identity used by stages scoped to the shared, process-level credential.
    #[must_use]
    pub fn with_shared_identity(mut self, identity: Option<Identity>) -> Self {
        self.shared = identity;
        self
    }

    pub fn shared_identity(&self) -> Option<&Identity> {
        self.shared.as_ref()
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn runner(&self) -> &AgentRunner {
        &self.runner
    }

    pub async fn execute(
        &self,
        request: &PipelineRequest,
        pipeline: &Pipeline,
        cancel: CancellationToken,
    ) -> Result<PipelineContext> {
        let run = self.run_stages(request, pipeline, &cancel);

        match self.deadline {
            Some(limit) => {
                if let Ok(outcome) = tokio::time::timeout(limit, run).await {
                    outcome
                } else {
                    cancel.cancel();
                    warn!(deadline_ms = limit.as_millis(), "Pipeline deadline reached");
                    Err(Error::Cancelled)
                }
            }
            None => run.await,
        }
    }

    async fn run_stages(
        &self,
        request: &PipelineRequest,
        pipeline: &Pipeline,
        cancel: &CancellationToken,
    ) -> Result<PipelineContext> {
        let mut parameters = request.parameters.clone();
        parameters
            .entry(NOW_PARAMETER.to_string())
            .or_insert_with(|| Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));

        let mut context = PipelineContext::new();

        for stage in pipeline.stages() {
            let started = Instant::now();
            info!(
                stage = %stage.name,
                tools = stage.tool_names.len(),
                budget = stage.step_budget,
                "Starting stage"
            );

            let output = self
                .run_stage(stage, request, &context, &parameters, cancel)
                .await
                .map_err(|e| {
                    warn!(stage = %stage.name, kind = %e.kind(), error = %e, "Stage failed");
                    e.in_stage(&stage.name)
                })?;

            info!(
                stage = %stage.name,
                elapsed_ms = started.elapsed().as_millis(),
                output_len = output.len(),
                "Stage complete"
            );
            context.record(&stage.name, output);
        }

        Ok(context)
    }

    async fn run_stage(
        &self,
        stage: &StageSpec,
        request: &PipelineRequest,
        context: &PipelineContext,
        parameters: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let identity = self.identity_for(stage.scope, request)?;

        let catalog = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            catalog = self.resolver.resolve(identity, &stage.tool_names) => catalog?,
        };

        let prompt = stage.render(context, parameters)?;
        let budget = NonZeroUsize::new(stage.step_budget).unwrap_or(NonZeroUsize::MIN);

        self.runner.run(&prompt, &catalog, budget, cancel).await
    }

    fn identity_for<'a>(
        &'a self,
        scope: StageScope,
        request: &'a PipelineRequest,
    ) -> Result<&'a Identity> {
        let identity = match scope {
            StageScope::Caller => Some(&request.caller),
            StageScope::Shared => self.shared.as_ref(),
        };

        identity
            .filter(|id| !id.credential.trim().is_empty())
            .ok_or_else(|| {
                Error::MissingCredential(match scope {
                    StageScope::Caller => "caller".to_string(),
                    StageScope::Shared => "shared".to_string(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::error::ErrorKind;
    use crate::intercept::LoggingInterceptor;
    use crate::model::{ModelResponse, Turn};
    use crate::testing::{tool_call, FakeBroker, ScriptedModel};

    fn orchestrator(broker: &FakeBroker, model: &ScriptedModel) -> Orchestrator {
        Orchestrator::new(
            CatalogResolver::new(Arc::new(broker.clone())),
            AgentRunner::new(Arc::new(model.clone()), Arc::new(LoggingInterceptor)),
        )
        .with_shared_identity(Some(Identity::new("shared", "shared-key")))
    }

    fn two_stage_pipeline() -> Pipeline {
        Pipeline::new(
            vec![
                StageSpec::new("stage1", ["CAL_TOOL"], "look up meetings", 2),
                StageSpec::new("stage2", ["DOC_TOOL"], "context: {stage1}", 2),
            ],
            Vec::<String>::new(),
        )
        .unwrap()
    }

    fn broker() -> FakeBroker {
        FakeBroker::new()
            .with_tool("CAL_TOOL", "calendar")
            .with_tool("DOC_TOOL", "docs")
            .authorize("user-1", "calendar")
            .authorize("user-1", "docs")
    }

    fn request() -> PipelineRequest {
        PipelineRequest::new(Identity::new("user-1", "caller-key"))
    }

    #[tokio::test]
    async fn test_output_threads_into_next_prompt() {
        let model = ScriptedModel::new(vec![ModelResponse::text("A"), ModelResponse::text("brief")]);
        let orch = orchestrator(&broker(), &model);

        let context = orch
            .execute(&request(), &two_stage_pipeline(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(model.prompts(), vec!["look up meetings", "context: A"]);
        assert_eq!(context.len(), 2);
        assert_eq!(context.get("stage1"), Some("A"));
        assert_eq!(context.get("stage2"), Some("brief"));
    }

    #[tokio::test]
    async fn test_unauthorized_first_stage_stops_pipeline() {
        let broker = FakeBroker::new()
            .with_tool("CAL_TOOL", "calendar")
            .with_tool("DOC_TOOL", "docs")
            .authorize("user-1", "docs");
        let model = ScriptedModel::repeating(ModelResponse::tool_calls(vec![tool_call(
            "c", "DOC_TOOL", "{}",
        )]));
        let orch = orchestrator(&broker, &model);

        let err = orch
            .execute(&request(), &two_stage_pipeline(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::UnauthorizedCapability);
        assert_eq!(err.stage(), Some("stage1"));
        assert_eq!(broker.bind_calls(), vec!["calendar"]);
        assert!(broker.log().entries().is_empty());
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_in_later_stage_aborts() {
        let model = ScriptedModel::new(vec![ModelResponse::text("A")]);
        let orch = orchestrator(&broker(), &model);

        let err = orch
            .execute(&request(), &two_stage_pipeline(), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
        assert_eq!(err.stage(), Some("stage2"));
    }

    #[tokio::test]
    async fn test_budget_three_policy_through_pipeline() {
        let model = ScriptedModel::repeating(ModelResponse::tool_calls(vec![tool_call(
            "c", "CAL_TOOL", "{}",
        )]));
        let broker = broker();
        let pipeline = Pipeline::new(
            vec![StageSpec::new("stage1", ["CAL_TOOL"], "loop forever", 3)],
            Vec::<String>::new(),
        )
        .unwrap();

        let err = orchestrator(&broker, &model)
            .execute(&request(), &pipeline, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StepBudgetExceeded);
        assert_eq!(model.calls(), 3);
        assert_eq!(broker.log().entries().len(), 3);
    }

    #[tokio::test]
    async fn test_shared_scope_uses_shared_identity() {
        let broker = FakeBroker::new()
            .with_tool("CAL_TOOL", "calendar")
            .with_tool("SEARCH_TOOL", "search")
            .authorize("user-1", "calendar")
            .authorize("shared", "search");
        let pipeline = Pipeline::new(
            vec![
                StageSpec::new("calendar", ["CAL_TOOL"], "meetings", 1),
                StageSpec::new("research", ["SEARCH_TOOL"], "research {calendar}", 1)
                    .with_scope(StageScope::Shared),
            ],
            Vec::<String>::new(),
        )
        .unwrap();
        let model = ScriptedModel::new(vec![ModelResponse::text("m"), ModelResponse::text("r")]);

        let context = orchestrator(&broker, &model)
            .execute(&request(), &pipeline, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(context.get("research"), Some("r"));
    }

    #[tokio::test]
    async fn test_missing_credentials() {
        let model = ScriptedModel::new(vec![ModelResponse::text("A")]);
        let orch = orchestrator(&broker(), &model);
        let blank = PipelineRequest::new(Identity::new("user-1", "  "));

        let err = orch
            .execute(&blank, &two_stage_pipeline(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingCredential);

        let pipeline = Pipeline::new(
            vec![StageSpec::new("research", ["CAL_TOOL"], "x", 1).with_scope(StageScope::Shared)],
            Vec::<String>::new(),
        )
        .unwrap();
        let orch = orchestrator(&broker(), &model).with_shared_identity(None);
        let err = orch
            .execute(&request(), &pipeline, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingCredential);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_now_parameter_is_injected_unless_given() {
        let pipeline = Pipeline::new(
            vec![StageSpec::new("stage1", ["CAL_TOOL"], "after {now}", 1)],
            Vec::<String>::new(),
        )
        .unwrap();

        let model = ScriptedModel::new(vec![ModelResponse::text("x")]);
        orchestrator(&broker(), &model)
            .execute(
                &request().with_parameter("now", "2025-06-01T09:00:00Z"),
                &pipeline,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(model.prompts(), vec!["after 2025-06-01T09:00:00Z"]);

        let model = ScriptedModel::new(vec![ModelResponse::text("x")]);
        orchestrator(&broker(), &model)
            .execute(&request(), &pipeline, CancellationToken::new())
            .await
            .unwrap();
        let prompt = model.prompts().remove(0);
        assert!(prompt.starts_with("after 20"));
        assert!(prompt.ends_with('Z'));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_work() {
        let model = ScriptedModel::new(vec![ModelResponse::text("A")]);
        let broker = broker();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator(&broker, &model)
            .execute(&request(), &two_stage_pipeline(), cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(broker.bind_calls().is_empty());
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_run() {
        let model = SlowModel;
        let orch = Orchestrator::new(
            CatalogResolver::new(Arc::new(broker())),
            AgentRunner::new(Arc::new(model), Arc::new(LoggingInterceptor)),
        )
        .with_deadline(Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let err = orch
            .execute(&request(), &two_stage_pipeline(), cancel.clone())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(cancel.is_cancelled());
    }

    struct SlowModel;

    #[async_trait::async_trait]
    impl crate::model::LanguageModel for SlowModel {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(
            &self,
            _transcript: &[Turn],
            _tools: &[crate::tool::ToolDescriptor],
        ) -> std::result::Result<ModelResponse, crate::model::ModelError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ModelResponse::text("too late"))
        }
    }
}
