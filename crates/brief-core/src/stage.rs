use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::error::{Error, Result};

/// Parameter injected into every run: the run's start time, RFC 3339 UTC.
pub const NOW_PARAMETER: &str = "now";

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is valid")
});

/// Whose credentials a stage resolves its tools under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageScope {
    /// The requesting user's identity and credential
    Caller,
    /// The process-wide shared identity and credential
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSpec {
    pub name: String,
    pub tool_names: BTreeSet<String>,
    pub prompt_template: String,
    pub step_budget: usize,
    pub scope: StageScope,
}

impl StageSpec {
    pub fn new<I, S>(name: &str, tool_names: I, prompt_template: &str, step_budget: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            tool_names: tool_names.into_iter().map(Into::into).collect(),
            prompt_template: prompt_template.to_string(),
            step_budget,
            scope: StageScope::Caller,
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: StageScope) -> Self {
        self.scope = scope;
        self
    }

    /// Placeholder names in the template, in order of first appearance.
    pub fn placeholders(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        TOKEN
            .captures_iter(&self.prompt_template)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    /// Substitute placeholders from prior outputs first, then fixed parameters.
    pub fn render(
        &self,
        context: &PipelineContext,
        parameters: &BTreeMap<String, String>,
    ) -> Result<String> {
        let template = &self.prompt_template;
        let mut out = String::with_capacity(template.len());
        let mut cursor = 0;

        for caps in TOKEN.captures_iter(template) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            out.push_str(&template[cursor..whole.start()]);
            cursor = whole.end();

            match caps.get(1) {
                Some(name) => {
                    let name = name.as_str();
                    let value = context
                        .get(name)
                        .or_else(|| parameters.get(name).map(String::as_str))
                        .ok_or_else(|| {
                            Error::Unknown(format!(
                                "No value for placeholder {{{name}}} in stage {}",
                                self.name
                            ))
                        })?;
                    out.push_str(value);
                }
                None => out.push_str(&whole.as_str()[..1]),
            }
        }

        out.push_str(&template[cursor..]);
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Pipeline has no stages")]
    Empty,
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),
    #[error("Stage {0} declares no tools")]
    NoTools(String),
    #[error("Stage {0} has a step budget of zero")]
    ZeroBudget(String),
    #[error("Stage {stage} references {placeholder}, which has not run yet")]
    ForwardReference { stage: String, placeholder: String },
    #[error("Stage {stage} references unknown placeholder {placeholder}")]
    UnknownPlaceholder { stage: String, placeholder: String },
    #[error("Stage {stage} does not include the output of earlier stage {earlier}")]
    UnreferencedStage { stage: String, earlier: String },
}

/// A validated, ordered list of stages
#[derive(Debug, Clone, Serialize)]
pub struct Pipeline {
    stages: Vec<StageSpec>,
    parameters: BTreeSet<String>,
}

impl Pipeline {
    /// Validate `stages` against the declared fixed `parameters`.
    ///
    /// Every stage must reference the output of every earlier stage and
    /// nothing later than itself.
    pub fn new<I, S>(stages: Vec<StageSpec>, parameters: I) -> std::result::Result<Self, DefinitionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if stages.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let mut parameters: BTreeSet<String> = parameters.into_iter().map(Into::into).collect();
        parameters.insert(NOW_PARAMETER.to_string());

        let all_names: HashSet<&str> = stages.iter().map(|s| s.name.as_str()).collect();
        let mut earlier: Vec<&str> = Vec::new();

        for stage in &stages {
            if earlier.contains(&stage.name.as_str()) {
                return Err(DefinitionError::DuplicateStage(stage.name.clone()));
            }
            if stage.tool_names.is_empty() {
                return Err(DefinitionError::NoTools(stage.name.clone()));
            }
            if stage.step_budget == 0 {
                return Err(DefinitionError::ZeroBudget(stage.name.clone()));
            }

            let placeholders = stage.placeholders();
            for placeholder in &placeholders {
                if earlier.contains(&placeholder.as_str()) {
                    continue;
                }
                if all_names.contains(placeholder.as_str()) {
                    return Err(DefinitionError::ForwardReference {
                        stage: stage.name.clone(),
                        placeholder: placeholder.clone(),
                    });
                }
                if !parameters.contains(placeholder) {
                    return Err(DefinitionError::UnknownPlaceholder {
                        stage: stage.name.clone(),
                        placeholder: placeholder.clone(),
                    });
                }
            }

            let unreferenced = earlier
                .iter()
                .find(|e| !placeholders.iter().any(|p| p.as_str() == **e));
            if let Some(missing) = unreferenced {
                return Err(DefinitionError::UnreferencedStage {
                    stage: stage.name.clone(),
                    earlier: (*missing).to_string(),
                });
            }

            earlier.push(&stage.name);
        }

        Ok(Self { stages, parameters })
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn parameters(&self) -> &BTreeSet<String> {
        &self.parameters
    }

    /// Scope of the first stage using a tool from `toolkit`
    /// (`apollo` matches `APOLLO_PEOPLE_SEARCH`).
    pub fn scope_of_toolkit(&self, toolkit: &str) -> Option<StageScope> {
        let prefix = format!("{}_", toolkit.to_ascii_uppercase());
        self.stages
            .iter()
            .find(|stage| stage.tool_names.iter().any(|t| t.starts_with(&prefix)))
            .map(|stage| stage.scope)
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }
}

/// Stage outputs recorded so far, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineContext {
    outputs: Vec<(String, String)>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stage: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, output)| output.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.outputs.iter().map(|(n, o)| (n.as_str(), o.as_str()))
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Output of the most recently completed stage.
    pub fn last(&self) -> Option<&str> {
        self.outputs.last().map(|(_, o)| o.as_str())
    }

    /// Record a completed stage; a stage is recorded at most once.
    pub(crate) fn record(&mut self, stage: &str, output: String) -> bool {
        if self.get(stage).is_some() {
            return false;
        }
        self.outputs.push((stage.to_string(), output));
        true
    }
}

impl Serialize for PipelineContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.outputs.len()))?;
        for (name, output) in &self.outputs {
            map.serialize_entry(name, output)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, template: &str) -> StageSpec {
        StageSpec::new(name, ["TOOL"], template, 3)
    }

    fn context(entries: &[(&str, &str)]) -> PipelineContext {
        let mut ctx = PipelineContext::new();
        for (name, output) in entries {
            ctx.record(name, (*output).to_string());
        }
        ctx
    }

    #[test]
    fn test_render_prior_output() {
        let ctx = context(&[("stage1", "A")]);

        let rendered = stage("stage2", "context: {stage1}")
            .render(&ctx, &BTreeMap::new())
            .unwrap();

        assert_eq!(rendered, "context: A");
    }

    #[test]
    fn test_render_parameters_and_escapes() {
        let params = BTreeMap::from([("now".to_string(), "2025-01-01T00:00:00Z".to_string())]);

        let rendered = stage("s", "At {now} emit {{\"json\": true}}")
            .render(&PipelineContext::new(), &params)
            .unwrap();

        assert_eq!(rendered, "At 2025-01-01T00:00:00Z emit {\"json\": true}");
    }

    #[test]
    fn test_render_leaves_non_placeholders() {
        let rendered = stage("s", "{not a placeholder} and {}")
            .render(&PipelineContext::new(), &BTreeMap::new())
            .unwrap();

        assert_eq!(rendered, "{not a placeholder} and {}");
    }

    #[test]
    fn test_render_missing_value_fails() {
        let err = stage("s", "{missing}")
            .render(&PipelineContext::new(), &BTreeMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_placeholders_deduplicated() {
        let spec = stage("s", "{a} {b} {a} {{c}}");
        assert_eq!(spec.placeholders(), vec!["a", "b"]);
    }

    #[test]
    fn test_valid_pipeline() {
        let pipeline = Pipeline::new(
            vec![
                stage("calendar", "meetings after {now}"),
                stage("research", "research {calendar}"),
                stage("document", "write {calendar} {research}"),
            ],
            Vec::<String>::new(),
        )
        .unwrap();

        assert_eq!(
            pipeline.stage_names().collect::<Vec<_>>(),
            vec!["calendar", "research", "document"]
        );
        assert!(pipeline.parameters().contains("now"));
    }

    #[test]
    fn test_rejects_forward_and_self_reference() {
        let err = Pipeline::new(
            vec![stage("a", "{b}"), stage("b", "{a}")],
            Vec::<String>::new(),
        )
        .unwrap_err();
        assert!(matches!(err, DefinitionError::ForwardReference { .. }));

        let err = Pipeline::new(vec![stage("a", "{a}")], Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, DefinitionError::ForwardReference { .. }));
    }

    #[test]
    fn test_rejects_unreferenced_earlier_stage() {
        let err = Pipeline::new(
            vec![stage("a", "x"), stage("b", "{a}"), stage("c", "{b}")],
            Vec::<String>::new(),
        )
        .unwrap_err();

        assert_eq!(
            err,
            DefinitionError::UnreferencedStage {
                stage: "c".into(),
                earlier: "a".into()
            }
        );
    }

    #[test]
    fn test_rejects_structural_problems() {
        assert_eq!(
            Pipeline::new(vec![], Vec::<String>::new()).unwrap_err(),
            DefinitionError::Empty
        );
        assert!(matches!(
            Pipeline::new(vec![stage("a", "x"), stage("a", "{a}")], Vec::<String>::new()),
            Err(DefinitionError::DuplicateStage(_))
        ));
        assert!(matches!(
            Pipeline::new(vec![StageSpec::new("a", Vec::<String>::new(), "x", 1)], Vec::<String>::new()),
            Err(DefinitionError::NoTools(_))
        ));
        assert!(matches!(
            Pipeline::new(vec![StageSpec::new("a", ["T"], "x", 0)], Vec::<String>::new()),
            Err(DefinitionError::ZeroBudget(_))
        ));
        assert!(matches!(
            Pipeline::new(vec![stage("a", "{who}")], Vec::<String>::new()),
            Err(DefinitionError::UnknownPlaceholder { .. })
        ));
        assert!(Pipeline::new(vec![stage("a", "{who}")], ["who"]).is_ok());
    }

    #[test]
    fn test_context_records_once_in_order() {
        let mut ctx = PipelineContext::new();
        assert!(ctx.record("first", "1".into()));
        assert!(ctx.record("second", "2".into()));
        assert!(!ctx.record("first", "again".into()));

        assert_eq!(ctx.get("first"), Some("1"));
        assert_eq!(ctx.last(), Some("2"));
        assert_eq!(ctx.iter().map(|(n, _)| n).collect::<Vec<_>>(), vec!["first", "second"]);
    }

    #[test]
    fn test_context_serializes_in_execution_order() {
        let ctx = context(&[("zeta", "z"), ("alpha", "a")]);
        assert_eq!(serde_json::to_string(&ctx).unwrap(), r#"{"zeta":"z","alpha":"a"}"#);
    }
}
