//! In-process fakes for the model, tools and broker.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::connection::{BrokerError, ConnectionBroker, ConnectionRequest, ConnectionStatus};
use crate::model::{LanguageModel, ModelError, ModelResponse, ToolCall, Turn};
use crate::tool::{Identity, ToolCatalog, ToolDescriptor, ToolError, ToolHandle};

pub fn names(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

pub fn tool_call(id: &str, name: &str, arguments: &str) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
    }
}

pub fn catalog_of(tools: Vec<RecordingTool>) -> ToolCatalog {
    tools
        .into_iter()
        .map(|t| {
            let handle: Arc<dyn ToolHandle> = Arc::new(t);
            (handle.descriptor().name.clone(), handle)
        })
        .collect()
}

/// Ordered record of side effects across fakes
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Clone)]
pub struct RecordingTool {
    descriptor: ToolDescriptor,
    log: EventLog,
    result: Value,
    failure: Option<String>,
    count: Arc<Mutex<usize>>,
}

impl RecordingTool {
    pub fn new(name: &str, toolkit: &str, log: &EventLog) -> Self {
        Self {
            descriptor: ToolDescriptor::new(name, toolkit),
            log: log.clone(),
            result: Value::String(format!("{name} ok")),
            failure: None,
            count: Arc::new(Mutex::new(0)),
        }
    }

    pub fn returning(mut self, result: Value) -> Self {
        self.result = result;
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn invocations(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

#[async_trait]
impl ToolHandle for RecordingTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, parameters: Value) -> Result<Value, ToolError> {
        *self.count.lock().unwrap() += 1;
        self.log
            .push(format!("invoke:{}:{}", self.descriptor.name, parameters));
        match &self.failure {
            Some(message) => Err(ToolError::Failed(message.clone())),
            None => Ok(self.result.clone()),
        }
    }
}

struct ScriptState {
    script: Vec<ModelResponse>,
    repeat: Option<ModelResponse>,
    transcripts: Vec<Vec<Turn>>,
}

/// Model that replays a fixed list of responses and records every prompt
#[derive(Clone)]
pub struct ScriptedModel {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<ModelResponse>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                script,
                repeat: None,
                transcripts: Vec::new(),
            })),
        }
    }

    pub fn repeating(response: ModelResponse) -> Self {
        let model = Self::new(Vec::new());
        model.state.lock().unwrap().repeat = Some(response);
        model
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().transcripts.len()
    }

    pub fn transcripts(&self) -> Vec<Vec<Turn>> {
        self.state.lock().unwrap().transcripts.clone()
    }

    pub fn last_transcript(&self) -> Vec<Turn> {
        self.transcripts().pop().unwrap_or_default()
    }

    /// First user prompt of every model call, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.transcripts()
            .into_iter()
            .filter_map(|t| match t.first() {
                Some(Turn::User { content }) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        transcript: &[Turn],
        _tools: &[ToolDescriptor],
    ) -> Result<ModelResponse, ModelError> {
        let mut state = self.state.lock().unwrap();
        state.transcripts.push(transcript.to_vec());
        if !state.script.is_empty() {
            return Ok(state.script.remove(0));
        }
        state
            .repeat
            .clone()
            .ok_or_else(|| ModelError::Transport("script exhausted".into()))
    }
}

#[derive(Default)]
struct BrokerState {
    tools: HashMap<String, String>,
    authorized: HashSet<(String, String)>,
    bind_calls: Vec<String>,
    lookups: Vec<String>,
    initiated: Vec<String>,
    lookup_failure: Option<BrokerError>,
    status_failure: Option<BrokerError>,
    log: EventLog,
}

/// Broker over a fixed tool table; binds `RecordingTool`s sharing one log
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(self, name: &str, toolkit: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .tools
            .insert(name.to_string(), toolkit.to_string());
        self
    }

    pub fn authorize(self, user_id: &str, toolkit: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .authorized
            .insert((user_id.to_string(), toolkit.to_string()));
        self
    }

    /// Every lookup fails with `error`
    pub fn with_lookup_failure(self, error: BrokerError) -> Self {
        self.state.lock().unwrap().lookup_failure = Some(error);
        self
    }

    /// Every status check and bind fails with `error`
    pub fn with_status_failure(self, error: BrokerError) -> Self {
        self.state.lock().unwrap().status_failure = Some(error);
        self
    }

    pub fn bind_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().bind_calls.clone()
    }

    /// `user:tool` for every lookup
    pub fn lookups(&self) -> Vec<String> {
        self.state.lock().unwrap().lookups.clone()
    }

    /// `user:toolkit` for every initiated connection
    pub fn initiated(&self) -> Vec<String> {
        self.state.lock().unwrap().initiated.clone()
    }

    pub fn log(&self) -> EventLog {
        self.state.lock().unwrap().log.clone()
    }
}

#[async_trait]
impl ConnectionBroker for FakeBroker {
    async fn describe(
        &self,
        identity: &Identity,
        tool_name: &str,
    ) -> Result<Option<ToolDescriptor>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state
            .lookups
            .push(format!("{}:{tool_name}", identity.user_id));
        if let Some(error) = &state.lookup_failure {
            return Err(error.clone());
        }
        Ok(state
            .tools
            .get(tool_name)
            .map(|toolkit| ToolDescriptor::new(tool_name, toolkit.as_str())))
    }

    async fn authorize_and_bind(
        &self,
        identity: &Identity,
        toolkit: &str,
        tools: &[ToolDescriptor],
    ) -> Result<Vec<Arc<dyn ToolHandle>>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.bind_calls.push(toolkit.to_string());
        if let Some(error) = &state.status_failure {
            return Err(error.clone());
        }
        if !state
            .authorized
            .contains(&(identity.user_id.clone(), toolkit.to_string()))
        {
            return Err(BrokerError::NotConnected {
                toolkit: toolkit.to_string(),
                status: ConnectionStatus::Disconnected,
            });
        }
        let log = state.log.clone();
        Ok(tools
            .iter()
            .map(|d| {
                let handle: Arc<dyn ToolHandle> =
                    Arc::new(RecordingTool::new(&d.name, &d.toolkit, &log));
                handle
            })
            .collect())
    }

    async fn status(
        &self,
        identity: &Identity,
        toolkit: &str,
    ) -> Result<ConnectionStatus, BrokerError> {
        let state = self.state.lock().unwrap();
        if let Some(error) = &state.status_failure {
            return Err(error.clone());
        }
        if state
            .authorized
            .contains(&(identity.user_id.clone(), toolkit.to_string()))
        {
            Ok(ConnectionStatus::Active)
        } else {
            Ok(ConnectionStatus::Disconnected)
        }
    }

    async fn initiate(
        &self,
        identity: &Identity,
        toolkit: &str,
    ) -> Result<ConnectionRequest, BrokerError> {
        self.state
            .lock()
            .unwrap()
            .initiated
            .push(format!("{}:{toolkit}", identity.user_id));
        Ok(ConnectionRequest {
            id: format!("conn-{}-{toolkit}", identity.user_id),
            toolkit: toolkit.to_string(),
            status: ConnectionStatus::Initializing,
            redirect_url: Some(format!("https://auth.example.com/{toolkit}")),
        })
    }
}
