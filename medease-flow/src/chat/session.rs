use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::actions::{ActionKind, is_blank};
use crate::message::ChatMessage;

/// Where a session stands between two user messages
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum SessionState {
    /// No pending function call
    #[default]
    Idle,
    /// A call was proposed with required arguments missing; the next user message
    /// supplies them
    AwaitingFunctionArgs {
        action: ActionKind,
        arguments: Map<String, Value>,
    },
}

/// State of one live chat connection.
///
/// History only grows for the lifetime of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    #[serde(skip)]
    credential: Option<String>,
    history: Vec<ChatMessage>,
    state: SessionState,
}

impl ChatSession {
    pub fn new(id: impl Into<String>, credential: Option<String>, instruction: &str) -> Self {
        Self {
            id: id.into(),
            credential,
            history: vec![ChatMessage::system(instruction)],
            state: SessionState::Idle,
        }
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.history.push(message);
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Fill gaps in a newly proposed call with arguments collected earlier for the same
    /// action. Newer values win.
    pub fn merge_pending(
        &self,
        action: ActionKind,
        mut arguments: Map<String, Value>,
    ) -> Map<String, Value> {
        if let SessionState::AwaitingFunctionArgs {
            action: pending,
            arguments: known,
        } = &self.state
        {
            if *pending == action {
                for (key, value) in known {
                    if is_blank(arguments.get(key)) {
                        arguments.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        arguments
    }
}
