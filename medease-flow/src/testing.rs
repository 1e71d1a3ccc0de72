//! Scripted stand-ins for the external capabilities, for tests in this crate and in
//! dependents that enable the `testing` feature.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::{
    chat::actions::{ActionDispatcher, ActionKind, ActionOutcome},
    classify::{ClassificationResult, Classifier, MEDICAL_LABEL},
    error::{FlowError, Result},
    generate::{ActionSchema, AssistantTurn, FragmentStream, Generator},
    message::{ChatMessage, FunctionCall},
};

/// Classifier returning the same scores for every input
pub struct FixedClassifier {
    scores: Option<Vec<(String, f64)>>,
    seen: Mutex<Vec<Vec<String>>>,
}

impl FixedClassifier {
    pub fn new(scores: Vec<(&str, f64)>) -> Self {
        Self {
            scores: Some(scores.into_iter().map(|(l, s)| (l.to_string(), s)).collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn medical() -> Self {
        Self::new(vec![
            (MEDICAL_LABEL, 0.82),
            ("educational content", 0.07),
            ("technical documentation", 0.05),
            ("news article", 0.03),
            ("personal message", 0.03),
        ])
    }

    pub fn non_medical() -> Self {
        Self::new(vec![
            ("casual conversation", 0.61),
            ("personal message", 0.21),
            ("social media post", 0.1),
            (MEDICAL_LABEL, 0.08),
        ])
    }

    pub fn failing() -> Self {
        Self {
            scores: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Label sets passed to each `classify` call
    pub fn seen_labels(&self) -> Vec<Vec<String>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, _text: &str, labels: &[&str]) -> Result<ClassificationResult> {
        self.seen
            .lock()
            .unwrap()
            .push(labels.iter().map(|l| l.to_string()).collect());
        match &self.scores {
            Some(scores) => Ok(ClassificationResult::new(scores.clone())),
            None => Err(FlowError::ClassificationFailed(
                "classifier unavailable".to_string(),
            )),
        }
    }
}

/// Scripted reply for one `Generator::stream` call
pub enum StreamScript {
    Fragments(Vec<String>),
    FailOpen(String),
    FailAfter(Vec<String>, String),
}

impl StreamScript {
    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StreamScript::Fragments(fragments.into_iter().map(Into::into).collect())
    }

    pub fn fail_after<I, S>(fragments: I, message: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StreamScript::FailAfter(
            fragments.into_iter().map(Into::into).collect(),
            message.to_string(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorCall {
    Generate {
        prompt: String,
        instruction: String,
    },
    Stream {
        prompt: String,
        instruction: String,
    },
    Converse {
        history: Vec<ChatMessage>,
        offered: Vec<String>,
    },
}

/// Generator answering from queues, recording every call
#[derive(Default)]
pub struct ScriptedGenerator {
    replies: Mutex<VecDeque<Result<String>>>,
    streams: Mutex<VecDeque<StreamScript>>,
    turns: Mutex<VecDeque<Result<AssistantTurn>>>,
    calls: Mutex<Vec<GeneratorCall>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push_turn(Ok(AssistantTurn::Text(text.into())));
    }

    pub fn push_call(&self, id: &str, name: &str, arguments: Value) {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.push_turn(Ok(AssistantTurn::Call(FunctionCall::new(id, name, arguments))));
    }

    pub fn push_turn(&self, turn: Result<AssistantTurn>) {
        self.turns.lock().unwrap().push_back(turn);
    }

    pub fn calls(&self) -> Vec<GeneratorCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn converse_calls(&self) -> Vec<(Vec<ChatMessage>, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                GeneratorCall::Converse { history, offered } => Some((history, offered)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: GeneratorCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, instruction: &str) -> Result<String> {
        self.record(GeneratorCall::Generate {
            prompt: prompt.to_string(),
            instruction: instruction.to_string(),
        });
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FlowError::GenerationFailed("no scripted reply".into())))
    }

    async fn stream(&self, prompt: &str, instruction: &str) -> Result<FragmentStream> {
        self.record(GeneratorCall::Stream {
            prompt: prompt.to_string(),
            instruction: instruction.to_string(),
        });
        let script = self.streams.lock().unwrap().pop_front();
        let items: Vec<Result<String>> = match script {
            Some(StreamScript::Fragments(fragments)) => fragments.into_iter().map(Ok).collect(),
            Some(StreamScript::FailAfter(fragments, message)) => fragments
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(FlowError::GenerationFailed(message))))
                .collect(),
            Some(StreamScript::FailOpen(message)) => {
                return Err(FlowError::GenerationFailed(message));
            }
            None => return Err(FlowError::GenerationFailed("no scripted stream".into())),
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn converse(
        &self,
        history: &[ChatMessage],
        actions: &[ActionSchema],
    ) -> Result<AssistantTurn> {
        self.record(GeneratorCall::Converse {
            history: history.to_vec(),
            offered: actions.iter().map(|a| a.name.clone()).collect(),
        });
        self.turns
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FlowError::GenerationFailed("no scripted turn".into())))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRecord {
    pub action: ActionKind,
    pub arguments: Map<String, Value>,
    pub credential: Option<String>,
}

/// Dispatcher answering with a fixed outcome
pub struct RecordingDispatcher {
    outcome: ActionOutcome,
    records: Mutex<Vec<DispatchRecord>>,
}

impl RecordingDispatcher {
    pub fn new(outcome: ActionOutcome) -> Self {
        Self {
            outcome,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(ActionOutcome::new(200, json!({"message": "ok"})))
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        action: ActionKind,
        arguments: &Map<String, Value>,
        credential: Option<&str>,
    ) -> ActionOutcome {
        self.records.lock().unwrap().push(DispatchRecord {
            action,
            arguments: arguments.clone(),
            credential: credential.map(str::to_string),
        });
        self.outcome.clone()
    }
}
