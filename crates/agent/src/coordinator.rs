//! Streaming persistence coordinator.
//!
//! Relays the orchestrator's deltas to the client one at a time and stores the
//! exchange (user message, then assistant message) exactly once, whichever way
//! the turn ends: normal completion, iteration ceiling, model error, or the
//! client going away mid-stream.
//!
//! The exchange is owned by a [`Finalizer`]. The terminal path persists it before
//! the terminal wire event is yielded; if the stream is dropped first, the
//! finalizer's `Drop` hands the pending exchange to the runtime instead.

use crate::orchestrator::Agent;
use crate::stream_event::{AgentStreamEvent, GENERIC_STREAM_ERROR, RunEnd, WireEvent};
use docchat_core::chat::ChatMessage;
use docchat_core::store::RelationalStore;
use docchat_memory::ChatMemory;
use futures::Stream;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Appended to the stored answer when the model failed mid-turn.
pub const ERROR_SUFFIX: &str = "[Error: the response could not be completed]";

/// Appended to the stored answer when the client disconnected mid-turn.
pub const INTERRUPTED_SUFFIX: &str = "[Response interrupted]";

/// What happened to the exchange at finalize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persisted {
    Committed,
    /// The chat was deleted before the turn ended; nothing was written.
    ChatMissing,
    /// The write failed and was rolled back; the exchange is lost.
    Failed,
}

struct PendingTurn {
    store: Arc<dyn RelationalStore>,
    chat_id: String,
    user_text: String,
    assistant_text: String,
}

fn with_suffix(text: &str, suffix: &str) -> String {
    let text = text.trim_end();
    if text.is_empty() {
        suffix.to_string()
    } else {
        format!("{text}\n\n{suffix}")
    }
}

impl PendingTurn {
    async fn persist(self) -> Persisted {
        let chat_id = self.chat_id.as_str();
        let mut session = match self.store.begin().await {
            Ok(session) => session,
            Err(e) => {
                error!(chat_id, error = %e, "Could not open session; turn not persisted");
                return Persisted::Failed;
            }
        };

        match session.get_chat(chat_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                error!(chat_id, "Chat not found at finalize time; turn not persisted");
                let _ = session.rollback().await;
                return Persisted::ChatMissing;
            }
            Err(e) => {
                error!(chat_id, error = %e, "Chat lookup failed at finalize time; turn not persisted");
                let _ = session.rollback().await;
                return Persisted::Failed;
            }
        }

        let user = ChatMessage::user(chat_id, self.user_text);
        let assistant = ChatMessage::assistant(chat_id, self.assistant_text.trim());
        // The assistant reply is always stamped after its prompt.
        let stamped_at = assistant.created_at;

        let written = async {
            session.append_message(user).await?;
            session.append_message(assistant).await?;
            session.touch_chat(chat_id, stamped_at).await
        }
        .await;
        if let Err(e) = written {
            error!(chat_id, error = %e, "Writing the turn failed; rolling back (data loss)");
            if let Err(e) = session.rollback().await {
                warn!(chat_id, error = %e, "Rollback failed");
            }
            return Persisted::Failed;
        }

        match session.commit().await {
            Ok(()) => {
                debug!(chat_id, "Turn persisted");
                Persisted::Committed
            }
            Err(e) => {
                // Commit consumed the session; the store discards uncommitted writes.
                error!(chat_id, error = %e, "Commit failed; turn lost (data loss)");
                Persisted::Failed
            }
        }
    }
}

/// Owns one turn's exchange until it has been handed to the store.
pub struct Finalizer {
    pending: Option<PendingTurn>,
}

impl Finalizer {
    pub fn new(store: Arc<dyn RelationalStore>, chat_id: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            pending: Some(PendingTurn {
                store,
                chat_id: chat_id.into(),
                user_text: user_text.into(),
                assistant_text: String::new(),
            }),
        }
    }

    pub fn push(&mut self, delta: &str) {
        if let Some(pending) = self.pending.as_mut() {
            pending.assistant_text.push_str(delta);
        }
    }

    /// Persist the exchange, marking the answer with `suffix` when given.
    /// Returns `None` if it was already finalized.
    ///
    /// The write runs on its own task: dropping this future mid-write leaves
    /// the write running to completion.
    pub async fn finish(&mut self, suffix: Option<&str>) -> Option<Persisted> {
        let mut pending = self.pending.take()?;
        if let Some(suffix) = suffix {
            pending.assistant_text = with_suffix(&pending.assistant_text, suffix);
        }
        let chat_id = pending.chat_id.clone();
        match tokio::spawn(pending.persist()).await {
            Ok(persisted) => Some(persisted),
            Err(e) => {
                error!(chat_id = %chat_id, error = %e, "Persist task failed; turn not persisted");
                Some(Persisted::Failed)
            }
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };
        pending.assistant_text = with_suffix(&pending.assistant_text, INTERRUPTED_SUFFIX);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(chat_id = %pending.chat_id, "Stream dropped before completion; persisting partial answer");
                handle.spawn(async move {
                    pending.persist().await;
                });
            }
            Err(_) => {
                error!(chat_id = %pending.chat_id, "Stream dropped outside a runtime; turn not persisted");
            }
        }
    }
}

struct TurnStream {
    events: mpsc::Receiver<AgentStreamEvent>,
    finalizer: Finalizer,
    finished: bool,
}

/// Run one streaming turn.
///
/// Yields zero or more `Value` events, one per model delta and in model order,
/// then exactly one `Done` or `Error`. The exchange is committed before the
/// terminal event is yielded.
pub fn stream_turn<C: Into<String>, I: Into<String>>(
    agent: &Agent,
    memory: ChatMemory,
    store: Arc<dyn RelationalStore>,
    chat_id: C,
    input: I,
) -> impl Stream<Item = WireEvent> + Send + 'static + use<C, I> {
    let chat_id = chat_id.into();
    let input = input.into();
    info!(chat_id = %chat_id, "Streaming turn started");

    let state = TurnStream {
        events: agent.stream(input.clone(), memory),
        finalizer: Finalizer::new(store, chat_id, input),
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            let terminal = match state.events.recv().await {
                Some(AgentStreamEvent::Chunk { content }) => {
                    state.finalizer.push(&content);
                    return Some((WireEvent::Value(content), state));
                }
                Some(AgentStreamEvent::ToolCall { name, .. }) => {
                    debug!(tool = %name, "Tool call in progress");
                    continue;
                }
                Some(AgentStreamEvent::ToolResult { name, success, .. }) => {
                    debug!(tool = %name, success, "Tool call finished");
                    continue;
                }
                Some(AgentStreamEvent::Done { end, iterations, .. }) => {
                    if end == RunEnd::IterationLimitExceeded {
                        warn!(iterations, "Turn ended at the iteration ceiling");
                    }
                    state.finalizer.finish(None).await;
                    WireEvent::Done
                }
                Some(AgentStreamEvent::Error { message }) => {
                    error!(error = %message, "Streaming turn failed");
                    state.finalizer.finish(Some(ERROR_SUFFIX)).await;
                    WireEvent::Error(GENERIC_STREAM_ERROR.into())
                }
                None => {
                    error!("Agent stream closed without a terminal event");
                    state.finalizer.finish(Some(ERROR_SUFFIX)).await;
                    WireEvent::Error(GENERIC_STREAM_ERROR.into())
                }
            };
            state.finished = true;
            return Some((terminal, state));
        }
    })
}

/// Result of a non-streaming turn.
#[derive(Debug, Clone)]
pub struct TurnAnswer {
    pub text: String,
    pub end: RunEnd,
    pub persisted: Persisted,
}

/// Run one turn to completion and persist it through the same finalizer.
pub async fn complete_turn(
    agent: &Agent,
    memory: &ChatMemory,
    store: Arc<dyn RelationalStore>,
    chat_id: &str,
    input: &str,
) -> TurnAnswer {
    let mut finalizer = Finalizer::new(store, chat_id, input);
    let outcome = agent.complete(input, memory).await;
    finalizer.push(&outcome.text);

    let suffix = match outcome.end {
        RunEnd::Errored => {
            error!(chat_id, error = outcome.error.as_deref().unwrap_or("unknown"), "Turn failed");
            Some(ERROR_SUFFIX)
        }
        _ => None,
    };
    let persisted = finalizer.finish(suffix).await.unwrap_or(Persisted::Failed);
    let text = match suffix {
        Some(suffix) => with_suffix(&outcome.text, suffix),
        None => outcome.text.trim().to_string(),
    };
    TurnAnswer {
        text,
        end: outcome.end,
        persisted,
    }
}
