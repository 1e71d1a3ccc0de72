use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role tag of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    /// Result of a dispatched (or rejected) function call
    Function,
}

/// A structured action proposed by the generation stub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl FunctionCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// One turn of a chat session history.
///
/// Assistant turns either carry text or a `function_call`; function turns carry the
/// serialized result in `content` and point back at the call through `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            function_call: None,
            call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    pub fn function_call(call: FunctionCall) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: String::new(),
            function_call: Some(call),
            call_id: None,
            name: None,
        }
    }

    pub fn function_result(call: &FunctionCall, result: &Value) -> Self {
        Self {
            role: MessageRole::Function,
            content: result.to_string(),
            function_call: None,
            call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
        }
    }

    pub fn is_function_call(&self) -> bool {
        self.function_call.is_some()
    }
}
