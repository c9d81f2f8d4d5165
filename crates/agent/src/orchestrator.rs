//! ReAct orchestrator: Reason → Act → Observe until the model answers.
//!
//! Each iteration sends the whole working context to the model. The model either
//! answers (no tool calls) or asks for tools; every requested tool runs in order,
//! its output is appended as an observation, and the loop continues. The loop is
//! bounded by `max_iterations` model calls.
//!
//! ```text
//! Idle → Reasoning → { ToolCall → Observing → Reasoning }* → Finished
//!                                                         | IterationLimitExceeded
//!                                                         | Errored
//! ```
//!
//! Every exit yields the text produced so far; nothing here panics or returns an
//! error to the caller.

use crate::stream_event::{AgentStreamEvent, RunEnd};
use docchat_core::message::{Message, MessageToolCall};
use docchat_core::provider::{Provider, ProviderRequest, ToolDefinition};
use docchat_core::tool::{ToolCall, ToolRegistry};
use docchat_memory::ChatMemory;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Text used when the ceiling is hit before the model said anything.
pub const ITERATION_LIMIT_NOTICE: &str =
    "I've reached the maximum number of reasoning steps before finding a final answer.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Reasoning,
    ToolCall,
    Observing,
    Finished,
    IterationLimitExceeded,
    Errored,
}

/// Per-run knobs resolved from the chat and the configuration.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: Option<u64>,
    pub max_iterations: usize,
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// All text the model produced, in order.
    pub text: String,
    pub end: RunEnd,
    /// Underlying cause when `end` is `Errored`.
    pub error: Option<String>,
    pub iterations: usize,
    /// Names of the tools invoked, in order.
    pub tool_calls: Vec<String>,
    /// Every state the run passed through.
    pub states: Vec<AgentState>,
}

/// A tool-using agent bound to one turn's tools and configuration.
#[derive(Clone)]
pub struct Agent {
    system_prompt: String,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn Provider>,
    options: AgentOptions,
}

/// Build an agent. The system prompt given here heads every model request.
pub fn create_agent(
    system_prompt: impl Into<String>,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn Provider>,
    options: AgentOptions,
) -> Agent {
    Agent {
        system_prompt: system_prompt.into(),
        tools,
        llm,
        options,
    }
}

/// Bookkeeping for one run.
struct Run {
    text: String,
    iterations: usize,
    tool_calls: Vec<String>,
    states: Vec<AgentState>,
}

impl Run {
    fn new() -> Self {
        Self {
            text: String::new(),
            iterations: 0,
            tool_calls: Vec::new(),
            states: vec![AgentState::Idle],
        }
    }

    fn enter(&mut self, state: AgentState) {
        self.states.push(state);
    }

    fn finish(mut self, end: RunEnd, error: Option<String>) -> AgentOutcome {
        self.enter(match end {
            RunEnd::Finished => AgentState::Finished,
            RunEnd::IterationLimitExceeded => AgentState::IterationLimitExceeded,
            RunEnd::Errored => AgentState::Errored,
        });
        AgentOutcome {
            text: self.text,
            end,
            error,
            iterations: self.iterations,
            tool_calls: self.tool_calls,
            states: self.states,
        }
    }
}

type Sink<'a> = Option<&'a mpsc::Sender<AgentStreamEvent>>;

async fn emit(sink: Sink<'_>, event: AgentStreamEvent) -> Result<(), String> {
    match sink {
        Some(tx) => tx.send(event).await.map_err(|_| "stream receiver closed".to_string()),
        None => Ok(()),
    }
}

/// Tool arguments arrive as a JSON string; anything unparsable is passed on as text.
fn parse_arguments(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

impl Agent {
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.names()
    }

    /// Run to completion and return the outcome.
    pub async fn complete(&self, input: &str, memory: &ChatMemory) -> AgentOutcome {
        self.drive(input, memory, None).await
    }

    /// Run in the background, streaming events.
    ///
    /// The channel holds at most one event, so each delta is handed over before
    /// the next one is requested. Exactly one terminal event (`Done` or `Error`)
    /// ends the stream.
    pub fn stream(&self, input: impl Into<String>, memory: ChatMemory) -> mpsc::Receiver<AgentStreamEvent> {
        let (tx, rx) = mpsc::channel(1);
        let this = self.clone();
        let input = input.into();
        tokio::spawn(async move {
            let outcome = this.drive(&input, &memory, Some(&tx)).await;
            let terminal = match outcome.end {
                RunEnd::Errored => AgentStreamEvent::Error {
                    message: outcome.error.unwrap_or_else(|| "unknown error".into()),
                },
                end => AgentStreamEvent::Done {
                    end,
                    iterations: outcome.iterations,
                    tool_calls_made: outcome.tool_calls.len(),
                },
            };
            deliver_terminal(&tx, terminal).await;
        });
        rx
    }

    fn request(&self, messages: &[Message], tools: &[ToolDefinition], stream: bool) -> ProviderRequest {
        // Rebuilt per call so the configured prompt always leads.
        let mut all = Vec::with_capacity(messages.len() + 1);
        all.push(Message::system(&self.system_prompt));
        all.extend_from_slice(messages);
        ProviderRequest {
            model: self.options.model.clone(),
            messages: all,
            temperature: self.options.temperature,
            max_tokens: None,
            tools: tools.to_vec(),
            stream,
            stop: vec![],
            timeout_secs: self.options.timeout_secs,
        }
    }

    async fn drive(&self, input: &str, memory: &ChatMemory, sink: Sink<'_>) -> AgentOutcome {
        let mut run = Run::new();
        let tool_defs = self.tools.definitions();

        let mut messages = match memory.get(input).await {
            Ok(history) => history,
            Err(e) => return run.finish(RunEnd::Errored, Some(format!("memory: {e}"))),
        };
        messages.push(Message::user(input));

        info!(
            model = %self.options.model,
            max_iter = self.options.max_iterations,
            tools = tool_defs.len(),
            "ReAct loop starting"
        );

        while run.iterations < self.options.max_iterations {
            run.iterations += 1;
            run.enter(AgentState::Reasoning);
            debug!(iteration = run.iterations, "ReAct iteration");

            let request = self.request(&messages, &tool_defs, sink.is_some());
            let step = match sink {
                Some(_) => self.stream_step(request, sink, &mut run.text).await,
                None => self.complete_step(request, &mut run.text).await,
            };
            let (content, tool_calls) = match step {
                Ok(step) => step,
                Err(e) => {
                    warn!(iteration = run.iterations, error = %e, "ReAct loop errored");
                    return run.finish(RunEnd::Errored, Some(e));
                }
            };

            if tool_calls.is_empty() {
                info!(
                    iterations = run.iterations,
                    tool_calls = run.tool_calls.len(),
                    "ReAct loop completed"
                );
                return run.finish(RunEnd::Finished, None);
            }

            messages.push(Message::assistant(content).with_tool_calls(tool_calls.clone()));
            for tc in &tool_calls {
                run.enter(AgentState::ToolCall);
                run.tool_calls.push(tc.name.clone());
                let arguments = parse_arguments(&tc.arguments);
                if let Err(e) = emit(
                    sink,
                    AgentStreamEvent::ToolCall {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input: arguments.clone(),
                    },
                )
                .await
                {
                    return run.finish(RunEnd::Errored, Some(e));
                }

                let call = ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments,
                };
                let start = std::time::Instant::now();
                let (output, success) = match self.tools.execute(&call).await {
                    Ok(result) => (result.output, result.success),
                    Err(e) => (format!("Error: {e}"), false),
                };
                debug!(
                    tool = %tc.name,
                    success,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Tool executed"
                );

                run.enter(AgentState::Observing);
                if let Err(e) = emit(
                    sink,
                    AgentStreamEvent::ToolResult {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        output: output.clone(),
                        success,
                    },
                )
                .await
                {
                    return run.finish(RunEnd::Errored, Some(e));
                }
                messages.push(Message::tool_result(&tc.id, output));
            }
        }

        warn!(max_iterations = self.options.max_iterations, "ReAct: max iterations reached");
        if run.text.trim().is_empty() {
            if let Err(e) = emit(
                sink,
                AgentStreamEvent::Chunk {
                    content: ITERATION_LIMIT_NOTICE.into(),
                },
            )
            .await
            {
                return run.finish(RunEnd::Errored, Some(e));
            }
            run.text.push_str(ITERATION_LIMIT_NOTICE);
        }
        run.finish(RunEnd::IterationLimitExceeded, None)
    }

    async fn complete_step(
        &self,
        request: ProviderRequest,
        text: &mut String,
    ) -> Result<(String, Vec<MessageToolCall>), String> {
        let response = self.llm.complete(request).await.map_err(|e| e.to_string())?;
        text.push_str(&response.message.content);
        Ok((response.message.content, response.message.tool_calls))
    }

    /// One streamed model call. Deltas are forwarded as they arrive; tool call
    /// fragments are merged by id.
    async fn stream_step(
        &self,
        request: ProviderRequest,
        sink: Sink<'_>,
        text: &mut String,
    ) -> Result<(String, Vec<MessageToolCall>), String> {
        let mut rx = self.llm.stream(request).await.map_err(|e| e.to_string())?;
        let mut content = String::new();
        let mut tool_calls: Vec<MessageToolCall> = Vec::new();

        while let Some(chunk) = rx.recv().await {
            let chunk = chunk.map_err(|e| e.to_string())?;
            if let Some(delta) = chunk.content
                && !delta.is_empty()
            {
                content.push_str(&delta);
                text.push_str(&delta);
                emit(sink, AgentStreamEvent::Chunk { content: delta }).await?;
            }
            for tc in chunk.tool_calls {
                match tool_calls.iter_mut().find(|t| t.id == tc.id) {
                    Some(existing) => existing.arguments.push_str(&tc.arguments),
                    None => tool_calls.push(tc),
                }
            }
        }
        Ok((content, tool_calls))
    }
}

/// Send the run's last event. Returns false when the consumer has already gone.
async fn deliver_terminal(tx: &mpsc::Sender<AgentStreamEvent>, terminal: AgentStreamEvent) -> bool {
    match tx.send(terminal).await {
        Ok(()) => true,
        Err(_) => {
            debug!("Stream consumer dropped before the terminal event");
            false
        }
    }
}
