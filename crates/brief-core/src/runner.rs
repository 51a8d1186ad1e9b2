use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::intercept::{InterceptError, Interceptor};
use crate::model::{LanguageModel, ToolCall, Turn};
use crate::tool::{ToolCatalog, ToolDescriptor, ToolInvocation};

/// Transcript and budget for one stage's loop; dropped when the stage ends.
struct AgentLoopState {
    transcript: Vec<Turn>,
    remaining: usize,
    last_text: Option<String>,
}

impl AgentLoopState {
    fn new(prompt: &str, budget: NonZeroUsize) -> Self {
        Self {
            transcript: vec![Turn::User {
                content: prompt.to_string(),
            }],
            remaining: budget.get(),
            last_text: None,
        }
    }
}

/// Drives a bounded reason-and-act loop for a single stage.
///
/// A round is one model query plus every tool call it requests. The loop
/// never runs more rounds than the step budget; when the budget runs out
/// the last text the model produced is returned, and only if there is none
/// does the run fail with `StepBudgetExceeded`.
pub struct AgentRunner {
    model: Arc<dyn LanguageModel>,
    interceptor: Arc<dyn Interceptor>,
}

impl AgentRunner {
    pub fn new(model: Arc<dyn LanguageModel>, interceptor: Arc<dyn Interceptor>) -> Self {
        Self { model, interceptor }
    }

    pub fn model(&self) -> &dyn LanguageModel {
        self.model.as_ref()
    }

    pub async fn run(
        &self,
        prompt: &str,
        tools: &ToolCatalog,
        step_budget: NonZeroUsize,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let descriptors: Vec<ToolDescriptor> =
            tools.values().map(|t| t.descriptor().clone()).collect();
        let mut state = AgentLoopState::new(prompt, step_budget);

        while state.remaining > 0 {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            state.remaining -= 1;
            let round = step_budget.get() - state.remaining;

            let response = until_cancelled(cancel, self.model.complete(&state.transcript, &descriptors))
                .await?
                .map_err(|e| Error::ModelUnavailable(e.to_string()))?;

            debug!(
                round,
                budget = step_budget.get(),
                tool_calls = response.tool_calls.len(),
                "Model round complete"
            );

            if let Some(text) = response.text.as_ref().filter(|t| !t.trim().is_empty()) {
                state.last_text = Some(text.clone());
            }

            if response.is_final() {
                // A bare stop after tool rounds keeps the last thing the model said
                return Ok(state.last_text.unwrap_or_default());
            }

            state.transcript.push(Turn::Assistant {
                content: response.text.clone(),
                tool_calls: response.tool_calls.clone(),
            });

            for call in &response.tool_calls {
                let observation = self.dispatch(call, tools, cancel).await?;
                state.transcript.push(Turn::Tool {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    content: observation,
                });
            }
        }

        warn!(budget = step_budget.get(), "Step budget exhausted before a final answer");
        state.last_text.ok_or(Error::StepBudgetExceeded {
            budget: step_budget.get(),
        })
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        tools: &ToolCatalog,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let handle = tools.get(&call.name).ok_or_else(|| Error::ToolExecutionFailure {
            tool: call.name.clone(),
            message: "tool is not available in this stage".to_string(),
        })?;

        let parameters = parse_arguments(&call.arguments).map_err(|e| Error::ToolExecutionFailure {
            tool: call.name.clone(),
            message: format!("invalid arguments: {e}"),
        })?;

        let invocation = ToolInvocation {
            tool_name: call.name.clone(),
            toolkit_name: handle.descriptor().toolkit.clone(),
            parameters,
        };

        let invocation = self.interceptor.intercept(invocation).map_err(|e| match e {
            InterceptError::Rejected(reason) => Error::InvocationRejected {
                tool: call.name.clone(),
                reason,
            },
            InterceptError::Failed(message) => Error::ToolExecutionFailure {
                tool: call.name.clone(),
                message,
            },
        })?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let result = until_cancelled(cancel, handle.invoke(invocation.parameters))
            .await?
            .map_err(|e| Error::ToolExecutionFailure {
                tool: call.name.clone(),
                message: e.to_string(),
            })?;

        Ok(observation_text(result))
    }
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        output = fut => Ok(output),
    }
}

fn parse_arguments(raw: &str) -> serde_json::Result<Value> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}

fn observation_text(result: Value) -> String {
    match result {
        Value::String(text) => text,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::intercept::LoggingInterceptor;
    use crate::model::ModelResponse;
    use crate::testing::{catalog_of, tool_call, EventLog, RecordingTool, ScriptedModel};

    fn budget(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    fn runner(model: &ScriptedModel) -> AgentRunner {
        AgentRunner::new(Arc::new(model.clone()), Arc::new(LoggingInterceptor))
    }

    #[tokio::test]
    async fn test_final_answer_on_first_round() {
        let model = ScriptedModel::new(vec![ModelResponse::text("A")]);

        let out = runner(&model)
            .run("go", &ToolCatalog::new(), budget(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, "A");
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_tool_result_is_fed_back() {
        let log = EventLog::default();
        let tool = RecordingTool::new("GOOGLECALENDAR_FIND_EVENT", "googlecalendar", &log)
            .returning(serde_json::json!({ "events": ["standup"] }));
        let model = ScriptedModel::new(vec![
            ModelResponse::tool_calls(vec![tool_call("c1", "GOOGLECALENDAR_FIND_EVENT", "{}")]),
            ModelResponse::text("found standup"),
        ]);

        let out = runner(&model)
            .run("go", &catalog_of(vec![tool.clone()]), budget(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, "found standup");
        let transcript = model.last_transcript();
        assert_eq!(transcript.len(), 3);
        match &transcript[2] {
            Turn::Tool { call_id, content, .. } => {
                assert_eq!(call_id, "c1");
                assert!(content.contains("standup"));
            }
            other => panic!("expected tool turn, got {other:?}"),
        }
        assert_eq!(tool.invocations(), 1);
    }

    #[tokio::test]
    async fn test_budget_is_a_hard_ceiling() {
        let log = EventLog::default();
        let tool = RecordingTool::new("COMPOSIO_SEARCH_SEARCH", "composio_search", &log);
        let model = ScriptedModel::repeating(ModelResponse::tool_calls(vec![tool_call(
            "c",
            "COMPOSIO_SEARCH_SEARCH",
            "{}",
        )]));

        let err = runner(&model)
            .run("go", &catalog_of(vec![tool.clone()]), budget(3), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StepBudgetExceeded);
        assert_eq!(model.calls(), 3);
        assert_eq!(tool.invocations(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_budget_returns_last_text() {
        let log = EventLog::default();
        let tool = RecordingTool::new("COMPOSIO_SEARCH_SEARCH", "composio_search", &log);
        let mut thinking =
            ModelResponse::tool_calls(vec![tool_call("c", "COMPOSIO_SEARCH_SEARCH", "{}")]);
        thinking.text = Some("partial findings".into());
        let model = ScriptedModel::repeating(thinking);

        let out = runner(&model)
            .run("go", &catalog_of(vec![tool]), budget(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, "partial findings");
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn test_final_without_text_keeps_earlier_text() {
        let log = EventLog::default();
        let tool = RecordingTool::new("GOOGLECALENDAR_FIND_EVENT", "googlecalendar", &log);
        let mut drafting =
            ModelResponse::tool_calls(vec![tool_call("c", "GOOGLECALENDAR_FIND_EVENT", "{}")]);
        drafting.text = Some("Standup with Ada at 10:00".into());
        let model = ScriptedModel::new(vec![
            drafting,
            ModelResponse {
                text: None,
                tool_calls: Vec::new(),
            },
        ]);

        let out = runner(&model)
            .run("go", &catalog_of(vec![tool]), budget(5), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, "Standup with Ada at 10:00");
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_final_without_any_text_is_empty() {
        let model = ScriptedModel::new(vec![ModelResponse::text("  ")]);

        let out = runner(&model)
            .run("go", &ToolCatalog::new(), budget(2), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn test_interceptor_runs_once_before_each_tool() {
        let log = EventLog::default();
        let tool = RecordingTool::new("APOLLO_PEOPLE_SEARCH", "apollo", &log);
        let hook_log = log.clone();
        let interceptor = move |inv: ToolInvocation| {
            hook_log.push(format!("intercept:{}:{}", inv.tool_name, inv.toolkit_name));
            Ok::<_, InterceptError>(inv)
        };
        let model = ScriptedModel::new(vec![
            ModelResponse::tool_calls(vec![
                tool_call("c1", "APOLLO_PEOPLE_SEARCH", r#"{"name":"Ada"}"#),
                tool_call("c2", "APOLLO_PEOPLE_SEARCH", r#"{"name":"Grace"}"#),
            ]),
            ModelResponse::text("done"),
        ]);
        let runner = AgentRunner::new(Arc::new(model.clone()), Arc::new(interceptor));

        runner
            .run("go", &catalog_of(vec![tool]), budget(4), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            log.entries(),
            vec![
                "intercept:APOLLO_PEOPLE_SEARCH:apollo",
                r#"invoke:APOLLO_PEOPLE_SEARCH:{"name":"Ada"}"#,
                "intercept:APOLLO_PEOPLE_SEARCH:apollo",
                r#"invoke:APOLLO_PEOPLE_SEARCH:{"name":"Grace"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_interceptor_rewrites_reach_the_tool() {
        let log = EventLog::default();
        let tool = RecordingTool::new("GOOGLECALENDAR_FIND_EVENT", "googlecalendar", &log);
        let interceptor = |mut inv: ToolInvocation| {
            inv.parameters = serde_json::json!({ "max_results": 5 });
            Ok::<_, InterceptError>(inv)
        };
        let model = ScriptedModel::new(vec![
            ModelResponse::tool_calls(vec![tool_call("c1", "GOOGLECALENDAR_FIND_EVENT", "")]),
            ModelResponse::text("ok"),
        ]);
        let runner = AgentRunner::new(Arc::new(model), Arc::new(interceptor));

        runner
            .run("go", &catalog_of(vec![tool]), budget(2), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            log.entries(),
            vec![r#"invoke:GOOGLECALENDAR_FIND_EVENT:{"max_results":5}"#]
        );
    }

    #[tokio::test]
    async fn test_rejection_prevents_execution() {
        let log = EventLog::default();
        let tool = RecordingTool::new("HUBSPOT_CREATE_CONTACT_OBJECT_WITH_PROPERTIES", "hubspot", &log);
        let model = ScriptedModel::new(vec![ModelResponse::tool_calls(vec![tool_call(
            "c1",
            "HUBSPOT_CREATE_CONTACT_OBJECT_WITH_PROPERTIES",
            "{}",
        )])]);
        let runner = AgentRunner::new(
            Arc::new(model),
            Arc::new(crate::intercept::DenyList::new([
                "HUBSPOT_CREATE_CONTACT_OBJECT_WITH_PROPERTIES",
            ])),
        );

        let err = runner
            .run("go", &catalog_of(vec![tool.clone()]), budget(3), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvocationRejected);
        assert_eq!(tool.invocations(), 0);
    }

    #[tokio::test]
    async fn test_interceptor_failure_is_tool_failure() {
        let log = EventLog::default();
        let tool = RecordingTool::new("APOLLO_PEOPLE_SEARCH", "apollo", &log);
        let interceptor =
            |_: ToolInvocation| Err::<ToolInvocation, _>(InterceptError::Failed("audit sink down".into()));
        let model = ScriptedModel::new(vec![ModelResponse::tool_calls(vec![tool_call(
            "c1",
            "APOLLO_PEOPLE_SEARCH",
            "{}",
        )])]);
        let runner = AgentRunner::new(Arc::new(model.clone()), Arc::new(interceptor));

        let err = runner
            .run("go", &catalog_of(vec![tool.clone()]), budget(3), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ToolExecutionFailure);
        assert_eq!(tool.invocations(), 0);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_tool_error_aborts_loop() {
        let log = EventLog::default();
        let tool = RecordingTool::new("APOLLO_PEOPLE_SEARCH", "apollo", &log).failing("rate limited");
        let model = ScriptedModel::repeating(ModelResponse::tool_calls(vec![tool_call(
            "c1",
            "APOLLO_PEOPLE_SEARCH",
            "{}",
        )]));

        let err = runner(&model)
            .run("go", &catalog_of(vec![tool]), budget(5), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ToolExecutionFailure);
        assert!(err.to_string().contains("rate limited"));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments_fail() {
        let model = ScriptedModel::new(vec![ModelResponse::tool_calls(vec![tool_call(
            "c1", "NOT_BOUND", "{}",
        )])]);
        let err = runner(&model)
            .run("go", &ToolCatalog::new(), budget(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolExecutionFailure);

        let log = EventLog::default();
        let tool = RecordingTool::new("APOLLO_PEOPLE_SEARCH", "apollo", &log);
        let model = ScriptedModel::new(vec![ModelResponse::tool_calls(vec![tool_call(
            "c1",
            "APOLLO_PEOPLE_SEARCH",
            "{not json",
        )])]);
        let err = runner(&model)
            .run("go", &catalog_of(vec![tool.clone()]), budget(2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolExecutionFailure);
        assert_eq!(tool.invocations(), 0);
    }

    #[tokio::test]
    async fn test_model_failure_is_model_unavailable() {
        let model = ScriptedModel::new(vec![]);

        let err = runner(&model)
            .run("go", &ToolCatalog::new(), budget(2), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_round() {
        let model = ScriptedModel::new(vec![ModelResponse::text("never")]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = runner(&model)
            .run("go", &ToolCatalog::new(), budget(2), &cancel)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn test_observation_text() {
        assert_eq!(observation_text(Value::String("plain".into())), "plain");
        assert_eq!(observation_text(serde_json::json!({"a": 1})), r#"{"a":1}"#);
    }
}
