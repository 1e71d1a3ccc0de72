use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::Result,
    message::{ChatMessage, FunctionCall},
};

/// Live sequence of text fragments in emission order
pub type FragmentStream = BoxStream<'static, Result<String>>;

/// Description of a callable action offered to the generation stub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSchema {
    pub name: String,
    pub description: String,
    /// JSON schema object with `properties` and `required`
    pub parameters: Value,
}

/// What the generation stub answered in structured-call mode
#[derive(Debug, Clone, PartialEq)]
pub enum AssistantTurn {
    Text(String),
    Call(FunctionCall),
    /// Neither text nor a function call came back
    Empty,
}

/// External text-generation capability
#[async_trait]
pub trait Generator: Send + Sync {
    /// Single prompt under a system instruction, full reply
    async fn generate(&self, prompt: &str, instruction: &str) -> Result<String>;

    /// Same as [`Generator::generate`] but yields fragments as they are produced
    async fn stream(&self, prompt: &str, instruction: &str) -> Result<FragmentStream>;

    /// Next assistant turn over a full history. `actions` may be empty, in which case
    /// the reply is expected to be plain text.
    async fn converse(
        &self,
        history: &[ChatMessage],
        actions: &[ActionSchema],
    ) -> Result<AssistantTurn>;
}
