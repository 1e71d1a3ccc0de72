use async_trait::async_trait;
use axum::body::Bytes;
use futures::{StreamExt, stream::BoxStream};
use medease_flow::{
    ActionSchema, AssistantTurn, ChatMessage, FlowError, FragmentStream, Generator, Result,
};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use rig::{agent::Agent, client::CompletionClient, completion::Prompt, providers::openrouter};
use std::collections::VecDeque;
use tracing::{debug, error, warn};

use super::{
    sse::{SseDecoder, SseEvent},
    wire::{
        Completion, RequestBody, StreamChunk, WireMessage, to_function_call, to_wire_messages,
        to_wire_tools,
    },
};
use crate::config::Config;

/// Generation through OpenRouter. Full-text prompts go through a rig agent; streaming
/// and tool calling talk to the OpenAI-compatible endpoint directly.
pub struct OpenRouterGenerator {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenRouterGenerator {
    pub fn new(api_key: &str, model: &str, base_url: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| anyhow::anyhow!("Invalid authorization header: {}", e))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            &config.openrouter_api_key,
            &config.llm_model,
            &config.llm_base_url,
        )
    }

    fn agent(&self, preamble: &str) -> Agent<openrouter::CompletionModel> {
        let client = openrouter::Client::new(&self.api_key);
        client.agent(&self.model).preamble(preamble).build()
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn post(&self, body: &RequestBody) -> anyhow::Result<reqwest::Response> {
        let response = self.http.post(self.endpoint()).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            anyhow::bail!("completion request failed with {}: {}", status, details);
        }
        Ok(response)
    }
}

fn generation_failed(e: impl std::fmt::Display) -> FlowError {
    FlowError::GenerationFailed(e.to_string())
}

#[async_trait]
impl Generator for OpenRouterGenerator {
    async fn generate(&self, prompt: &str, instruction: &str) -> Result<String> {
        let agent = self.agent(instruction);
        let reply = agent.prompt(prompt).await.map_err(|e| {
            error!("Prompt failed: {}", e);
            generation_failed(e)
        })?;
        debug!(reply_chars = reply.len(), "Prompt completed");
        Ok(reply)
    }

    async fn stream(&self, prompt: &str, instruction: &str) -> Result<FragmentStream> {
        let body = RequestBody {
            model: self.model.clone(),
            messages: to_wire_messages(&[
                ChatMessage::system(instruction),
                ChatMessage::user(prompt),
            ]),
            stream: true,
            tools: None,
        };
        let response = self.post(&body).await.map_err(generation_failed)?;

        let state = StreamState {
            bytes: response.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            failure: None,
            finished: false,
        };
        Ok(Box::pin(futures::stream::unfold(
            state,
            |mut state| async move { state.next_fragment().await.map(|item| (item, state)) },
        )))
    }

    async fn converse(
        &self,
        history: &[ChatMessage],
        actions: &[ActionSchema],
    ) -> Result<AssistantTurn> {
        let body = RequestBody {
            model: self.model.clone(),
            messages: to_wire_messages(history),
            stream: false,
            tools: to_wire_tools(actions),
        };
        let response = self.post(&body).await.map_err(generation_failed)?;
        let completion: Completion = response.json().await.map_err(generation_failed)?;
        Ok(interpret(completion))
    }
}

/// First tool call wins over text; a reply with neither is `Empty`
fn interpret(completion: Completion) -> AssistantTurn {
    let Some(choice) = completion.choices.into_iter().next() else {
        warn!("Completion returned no choices");
        return AssistantTurn::Empty;
    };
    let WireMessage {
        content,
        tool_calls,
        ..
    } = choice.message;

    if let Some(call) = tool_calls.as_ref().and_then(|calls| calls.first()) {
        return AssistantTurn::Call(to_function_call(call));
    }
    match content {
        Some(text) if !text.trim().is_empty() => AssistantTurn::Text(text),
        _ => AssistantTurn::Empty,
    }
}

struct StreamState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    failure: Option<FlowError>,
    finished: bool,
}

impl StreamState {
    async fn next_fragment(&mut self) -> Option<Result<String>> {
        loop {
            if let Some(fragment) = self.ready.pop_front() {
                return Some(Ok(fragment));
            }
            if let Some(e) = self.failure.take() {
                self.finished = true;
                return Some(Err(e));
            }
            if self.finished {
                return None;
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = self.decoder.push(&chunk);
                    self.accept(events);
                }
                Some(Err(e)) => self.failure = Some(generation_failed(e)),
                None => {
                    let tail = self.decoder.finish().into_iter().collect();
                    self.accept(tail);
                    self.finished = true;
                }
            }
        }
    }

    /// Queue the text of decoded events; an error chunk is kept until queued text is out
    fn accept(&mut self, events: Vec<SseEvent>) {
        for event in events {
            match event {
                SseEvent::Done => {
                    self.finished = true;
                    break;
                }
                SseEvent::Data(payload) => {
                    let chunk: StreamChunk = match serde_json::from_str(&payload) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            debug!(error = %e, "Skipping unparseable stream chunk");
                            continue;
                        }
                    };
                    if let Some(err) = chunk.error {
                        self.failure = Some(FlowError::GenerationFailed(err.to_string()));
                        break;
                    }
                    let text = chunk.text();
                    if !text.is_empty() {
                        self.ready.push_back(text);
                    }
                }
            }
        }
    }
}
