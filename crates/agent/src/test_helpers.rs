//! Shared test doubles for the agent tests.

use async_trait::async_trait;
use docchat_core::error::{ProviderError, ToolError};
use docchat_core::message::{Message, MessageToolCall};
use docchat_core::provider::{
    EmbeddingRequest, EmbeddingResponse, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage,
};
use docchat_core::tool::{Tool, ToolResult, text_input, text_input_schema};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One scripted provider step.
#[derive(Clone)]
pub enum Step {
    Respond(ProviderResponse),
    /// Fail before producing anything.
    Fail(String),
    /// Stream this text, then fail.
    PartialThenFail(String, String),
}

/// A mock provider that plays back scripted steps in order.
///
/// Streaming splits text into deltas of `chunk_chars` characters. When the script
/// runs out the last step repeats if `repeat_last` is set, otherwise calls fail.
pub struct SequentialMockProvider {
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    repeat_last: bool,
    chunk_chars: usize,
    pub requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            last: Mutex::new(None),
            repeat_last: false,
            chunk_chars: 5,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn single_text(text: &str) -> Self {
        Self::new(vec![Step::Respond(make_text_response(text))])
    }

    pub fn tool_then_answer(tool_calls: Vec<MessageToolCall>, answer: &str) -> Self {
        Self::new(vec![
            Step::Respond(make_tool_call_response(tool_calls, "")),
            Step::Respond(make_text_response(answer)),
        ])
    }

    /// Repeat the last step forever.
    pub fn repeating(mut self) -> Self {
        self.repeat_last = true;
        self
    }

    pub fn with_chunk_chars(mut self, n: usize) -> Self {
        self.chunk_chars = n.max(1);
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: ProviderRequest) -> Result<Step, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let mut script = self.script.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match script.pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                Ok(step)
            }
            None if self.repeat_last => last
                .clone()
                .ok_or_else(|| ProviderError::NotConfigured("empty script".into())),
            None => Err(ProviderError::NotConfigured("script exhausted".into())),
        }
    }

    fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars.chunks(self.chunk_chars).map(|c| c.iter().collect()).collect()
    }
}

fn api_error(message: &str) -> ProviderError {
    ProviderError::ApiError {
        status_code: 500,
        message: message.to_string(),
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next(request)? {
            Step::Respond(response) => Ok(response),
            Step::Fail(message) | Step::PartialThenFail(_, message) => Err(api_error(&message)),
        }
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let (deltas, tool_calls, failure) = match self.next(request)? {
            Step::Respond(response) => (
                self.split(&response.message.content),
                response.message.tool_calls,
                None,
            ),
            Step::Fail(message) => return Err(api_error(&message)),
            Step::PartialThenFail(text, message) => (self.split(&text), Vec::new(), Some(message)),
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for delta in deltas {
                let chunk = StreamChunk {
                    content: Some(delta),
                    tool_calls: Vec::new(),
                    done: false,
                    usage: None,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            let last = match failure {
                Some(message) => Err(ProviderError::StreamInterrupted(message)),
                None => Ok(StreamChunk {
                    content: None,
                    tool_calls,
                    done: true,
                    usage: None,
                }),
            };
            let _ = tx.send(last).await;
        });
        Ok(rx)
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        Ok(EmbeddingResponse {
            embeddings: request.inputs.iter().map(|t| hash_embed(t)).collect(),
            model: request.model,
            usage: None,
        })
    }

    fn supports_embeddings(&self) -> bool {
        true
    }
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 16];
    for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let h = word.bytes().fold(7u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        v[(h % 16) as usize] += 1.0;
    }
    v
}

pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
        metadata: serde_json::Map::new(),
    }
}

pub fn make_tool_call_response(tool_calls: Vec<MessageToolCall>, thought: &str) -> ProviderResponse {
    let mut response = make_text_response(thought);
    response.message.tool_calls = tool_calls;
    response
}

pub fn make_tool_call(name: &str, args: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: format!("call_{name}"),
        name: name.to_string(),
        arguments: serde_json::to_string(&args).unwrap(),
    }
}

/// A tool that answers with a fixed output and records every input it saw.
pub struct RecordingTool {
    name: String,
    output: String,
    pub inputs: Arc<Mutex<Vec<String>>>,
}

impl RecordingTool {
    pub fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Records its input and returns a fixed output"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        text_input_schema("anything")
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let input = text_input(&arguments)?;
        self.inputs.lock().unwrap().push(input);
        Ok(ToolResult::ok(self.output.clone()))
    }
}
