//! Per-session state machine.
//!
//! ```text
//!            SEND                STREAM_START             COMPLETE
//!   idle ───────────▶ sending ──────────────▶ streaming ──────────▶ complete
//!    ▲                 │  ▲                     │   ▲ CHUNK            │
//!    │                 │  │ RETRY               │   └──────┘           │ SEND
//!    │ RESET     ERROR │  │ (recoverable only)  │ ERROR                ▼
//!    └──────────── error ◀──────────────────────┘                   sending
//! ```
//!
//! [`transition`] is the pure table. [`SessionMachine::apply`] runs it and
//! applies the data changes, returning [`Effect`]s for the caller to carry
//! out. Ids and timestamps come in with the input; nothing here does I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::message::{Message, MessageId, ToolCall};
use crate::ids::RequestId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Sending,
    Streaming,
    Complete,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Sending => "sending",
            SessionState::Streaming => "streaming",
            SessionState::Complete => "complete",
            SessionState::Error => "error",
        }
    }

    /// A request is outstanding.
    pub fn is_busy(self) -> bool {
        matches!(self, SessionState::Sending | SessionState::Streaming)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage reported by a `complete` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionInfo {
    /// Backend session id, used to resume the conversation.
    pub sdk_session_id: Option<String>,
    pub cost_usd: f64,
    pub token_count: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFailure {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MachineInput {
    Send {
        request_id: RequestId,
        prompt: String,
        message_id: MessageId,
        at: DateTime<Utc>,
    },
    StreamStart {
        request_id: RequestId,
        message_id: MessageId,
        at: DateTime<Utc>,
    },
    Chunk {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolStart {
        tool_id: String,
        name: String,
        input: Value,
    },
    ToolComplete {
        tool_id: String,
        result: Value,
        duration_ms: u64,
    },
    Complete(CompletionInfo),
    Error(SessionFailure),
    /// Resubmit the last prompt under a new request id.
    Retry {
        request_id: RequestId,
    },
    Reset,
}

impl MachineInput {
    pub fn name(&self) -> &'static str {
        match self {
            MachineInput::Send { .. } => "SEND",
            MachineInput::StreamStart { .. } => "STREAM_START",
            MachineInput::Chunk { .. } => "CHUNK",
            MachineInput::Thinking { .. } => "THINKING",
            MachineInput::ToolStart { .. } => "TOOL_START",
            MachineInput::ToolComplete { .. } => "TOOL_COMPLETE",
            MachineInput::Complete(_) => "COMPLETE",
            MachineInput::Error(_) => "ERROR",
            MachineInput::Retry { .. } => "RETRY",
            MachineInput::Reset => "RESET",
        }
    }
}

/// Work the caller must perform after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    IssueQuery {
        request_id: RequestId,
        prompt: String,
    },
    Persist(Message),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{input} is not valid in state {state}")]
    Invalid {
        state: SessionState,
        input: &'static str,
    },

    #[error("Last error is not recoverable")]
    NotRecoverable,

    #[error("Nothing to retry")]
    NothingToRetry,

    #[error("Stream start for {got} does not match current request {expected}")]
    StaleRequest { expected: RequestId, got: RequestId },

    #[error("Unknown tool id: {0}")]
    UnknownTool(String),
}

/// The transition table. Pure: no data is touched.
pub fn transition(
    state: SessionState,
    input: &MachineInput,
) -> Result<SessionState, TransitionError> {
    use MachineInput as I;
    use SessionState as S;

    let next = match (state, input) {
        (S::Idle | S::Complete | S::Error, I::Send { .. }) => S::Sending,
        (S::Sending, I::StreamStart { .. }) => S::Streaming,
        (S::Sending | S::Streaming, I::Error(_)) => S::Error,
        (
            S::Streaming,
            I::Chunk { .. } | I::Thinking { .. } | I::ToolStart { .. } | I::ToolComplete { .. },
        ) => S::Streaming,
        (S::Streaming, I::Complete(_)) => S::Complete,
        (S::Error, I::Retry { .. }) => S::Sending,
        (S::Complete | S::Error, I::Reset) => S::Idle,
        (state, input) => {
            return Err(TransitionError::Invalid {
                state,
                input: input.name(),
            })
        }
    };
    Ok(next)
}

/// State plus the data it governs.
#[derive(Debug, Clone, Default)]
pub struct SessionMachine {
    state: SessionState,
    messages: Vec<Message>,
    request_id: Option<RequestId>,
    /// Index of the assistant message being streamed into.
    streaming: Option<usize>,
    last_prompt: Option<String>,
    last_failure: Option<SessionFailure>,
    last_completion: Option<CompletionInfo>,
}

impl SessionMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Machine seeded with persisted history.
    pub fn with_history(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn has_active_request(&self) -> bool {
        self.request_id.is_some()
    }

    pub fn last_prompt(&self) -> Option<&str> {
        self.last_prompt.as_deref()
    }

    pub fn last_failure(&self) -> Option<&SessionFailure> {
        self.last_failure.as_ref()
    }

    pub fn last_completion(&self) -> Option<&CompletionInfo> {
        self.last_completion.as_ref()
    }

    /// Apply one input. On error nothing changes.
    pub fn apply(&mut self, input: MachineInput) -> Result<Vec<Effect>, TransitionError> {
        let next = transition(self.state, &input)?;
        let effects = match input {
            MachineInput::Send {
                request_id,
                prompt,
                message_id,
                at,
            } => {
                let message = Message::user(message_id, prompt.clone(), at);
                self.messages.push(message.clone());
                self.streaming = None;
                self.last_failure = None;
                self.last_prompt = Some(prompt.clone());
                self.request_id = Some(request_id.clone());
                vec![
                    Effect::Persist(message),
                    Effect::IssueQuery { request_id, prompt },
                ]
            }

            MachineInput::StreamStart {
                request_id,
                message_id,
                at,
            } => {
                if let Some(expected) = self.request_id.as_ref().filter(|id| **id != request_id) {
                    return Err(TransitionError::StaleRequest {
                        expected: expected.clone(),
                        got: request_id,
                    });
                }
                self.messages
                    .push(Message::streaming_assistant(message_id, at));
                self.streaming = Some(self.messages.len() - 1);
                Vec::new()
            }

            MachineInput::Chunk { text } => {
                if let Some(message) = self.streaming_message() {
                    message.content.push_str(&text);
                }
                Vec::new()
            }

            MachineInput::Thinking { text } => {
                if let Some(message) = self.streaming_message() {
                    message.thinking.push_str(&text);
                }
                Vec::new()
            }

            MachineInput::ToolStart {
                tool_id,
                name,
                input,
            } => {
                if let Some(message) = self.streaming_message() {
                    message.tool_calls.push(ToolCall {
                        tool_id,
                        name,
                        input,
                        result: None,
                        duration_ms: None,
                    });
                }
                Vec::new()
            }

            MachineInput::ToolComplete {
                tool_id,
                result,
                duration_ms,
            } => {
                let call = self.streaming_message().and_then(|message| {
                    message
                        .tool_calls
                        .iter_mut()
                        .rev()
                        .find(|call| call.tool_id == tool_id)
                });
                match call {
                    Some(call) => {
                        call.result = Some(result);
                        call.duration_ms = Some(duration_ms);
                    }
                    None => return Err(TransitionError::UnknownTool(tool_id)),
                }
                Vec::new()
            }

            MachineInput::Complete(info) => {
                self.request_id = None;
                self.last_completion = Some(info);
                self.finish_streaming().map(Effect::Persist).into_iter().collect()
            }

            MachineInput::Error(failure) => {
                self.request_id = None;
                self.last_failure = Some(failure);
                self.finish_streaming()
                    .filter(|message| !message.is_blank())
                    .map(Effect::Persist)
                    .into_iter()
                    .collect()
            }

            MachineInput::Retry { request_id } => {
                let recoverable = self.last_failure.as_ref().is_some_and(|f| f.recoverable);
                if !recoverable {
                    return Err(TransitionError::NotRecoverable);
                }
                let prompt = self
                    .last_prompt
                    .clone()
                    .ok_or(TransitionError::NothingToRetry)?;
                self.last_failure = None;
                self.request_id = Some(request_id.clone());
                vec![Effect::IssueQuery { request_id, prompt }]
            }

            MachineInput::Reset => {
                *self = Self::default();
                Vec::new()
            }
        };

        self.state = next;
        Ok(effects)
    }

    fn streaming_message(&mut self) -> Option<&mut Message> {
        let index = self.streaming?;
        self.messages.get_mut(index)
    }

    /// Close the streaming assistant message and return a copy of it.
    fn finish_streaming(&mut self) -> Option<Message> {
        let index = self.streaming.take()?;
        let message = self.messages.get_mut(index)?;
        message.is_streaming = false;
        Some(message.clone())
    }
}
