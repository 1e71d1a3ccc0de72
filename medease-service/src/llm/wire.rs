//! OpenAI-compatible chat completion payloads and conversion from session history.

use medease_flow::{ActionSchema, ChatMessage, FunctionCall, MessageRole};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl WireMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub tool_type: String,
    pub function: WireFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunction {
    pub name: String,
    /// JSON-encoded argument object
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub struct RequestBody {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
pub struct Completion {
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
pub struct CompletionChoice {
    pub message: WireMessage,
}

#[derive(Debug, Deserialize)]
pub struct Delta {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    pub delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChunk {
    pub choices: Option<Vec<StreamChoice>>,
    pub error: Option<Value>,
}

impl StreamChunk {
    /// Concatenated content deltas of this chunk
    pub fn text(&self) -> String {
        self.choices
            .iter()
            .flatten()
            .filter_map(|choice| choice.delta.as_ref())
            .filter_map(|delta| delta.content.as_deref())
            .collect()
    }
}

/// Map session history onto chat-completion messages. Function calls become assistant
/// `tool_calls`, function results become `tool` messages.
pub fn to_wire_messages(history: &[ChatMessage]) -> Vec<WireMessage> {
    history.iter().map(to_wire_message).collect()
}

fn to_wire_message(message: &ChatMessage) -> WireMessage {
    match message.role {
        MessageRole::System => WireMessage::text("system", &message.content),
        MessageRole::User => WireMessage::text("user", &message.content),
        MessageRole::Assistant => match &message.function_call {
            Some(call) => WireMessage {
                role: "assistant".to_string(),
                content: None,
                tool_calls: Some(vec![WireToolCall {
                    id: call.id.clone(),
                    tool_type: function_type(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: Value::Object(call.arguments.clone()).to_string(),
                    },
                }]),
                tool_call_id: None,
            },
            None => WireMessage::text("assistant", &message.content),
        },
        MessageRole::Function => WireMessage {
            role: "tool".to_string(),
            content: Some(message.content.clone()),
            tool_calls: None,
            tool_call_id: message.call_id.clone(),
        },
    }
}

pub fn to_wire_tools(actions: &[ActionSchema]) -> Option<Vec<Value>> {
    if actions.is_empty() {
        return None;
    }
    Some(
        actions
            .iter()
            .map(|action| {
                json!({
                    "type": "function",
                    "function": {
                        "name": action.name,
                        "description": action.description,
                        "parameters": action.parameters,
                    }
                })
            })
            .collect(),
    )
}

/// Decode a proposed tool call. Unparseable arguments become an empty mapping, which the
/// session then treats as missing fields.
pub fn to_function_call(call: &WireToolCall) -> FunctionCall {
    let arguments = match serde_json::from_str::<Value>(&call.function.arguments) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    FunctionCall::new(call.id.clone(), call.function.name.clone(), arguments)
}
