//! One session: its machine, its ids and the request it is waiting on.
//!
//! The actor turns wire events into machine inputs and machine effects into
//! wire commands. It never performs I/O itself; the manager carries out the
//! commands and persistence it returns.

use chrono::Utc;
use serde::Serialize;

use super::machine::{
    CompletionInfo, Effect, MachineInput, SessionFailure, SessionMachine, SessionState,
};
use super::message::{Message, MessageId};
use super::SessionError;
use crate::ids::{ConversationId, RequestId, SessionId};
use crate::protocol::{Command, Event, QueryOptions};

/// Commands to send and messages to persist after an actor call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActorStep {
    pub commands: Vec<Command>,
    pub persist: Vec<Message>,
}

/// Result of feeding one event to an actor.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// The event changed the session. Dropped events leave it untouched.
    pub applied: bool,
    pub persist: Vec<Message>,
    pub snapshot: SessionSnapshot,
}

/// Everything a UI needs to render one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    pub display_name: Option<String>,
    pub state: SessionState,
    pub messages: Vec<Message>,
    pub current_request_id: Option<RequestId>,
    pub has_active_request: bool,
    pub last_error: Option<SessionFailure>,
    pub last_usage: Option<CompletionInfo>,
    pub sdk_session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionActor {
    session_id: SessionId,
    conversation_id: ConversationId,
    display_name: Option<String>,
    machine: SessionMachine,
    options: QueryOptions,
    sdk_session_id: Option<String>,
}

impl SessionActor {
    pub fn new(session_id: SessionId, conversation_id: ConversationId) -> Self {
        Self {
            session_id,
            conversation_id,
            display_name: None,
            machine: SessionMachine::new(),
            options: QueryOptions::default(),
            sdk_session_id: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    /// Resume a backend conversation remembered from an earlier run.
    pub fn with_sdk_session_id(mut self, sdk_session_id: Option<String>) -> Self {
        self.sdk_session_id = sdk_session_id;
        self
    }

    /// Seed the idle actor with previously stored messages.
    pub fn with_history(mut self, messages: Vec<Message>) -> Self {
        self.machine = SessionMachine::with_history(messages);
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    pub fn messages(&self) -> &[Message] {
        self.machine.messages()
    }

    pub fn current_request_id(&self) -> Option<&RequestId> {
        self.machine.request_id()
    }

    pub fn has_active_request(&self) -> bool {
        self.machine.has_active_request()
    }

    pub fn sdk_session_id(&self) -> Option<&str> {
        self.sdk_session_id.as_deref()
    }

    /// Start a new turn.
    pub fn send(&mut self, prompt: impl Into<String>) -> Result<ActorStep, SessionError> {
        if self.has_active_request() {
            return Err(SessionError::Busy(self.session_id.clone()));
        }
        let effects = self.machine.apply(MachineInput::Send {
            request_id: RequestId::new(),
            prompt: prompt.into(),
            message_id: MessageId::new(),
            at: Utc::now(),
        })?;
        Ok(self.step(effects))
    }

    /// Resubmit the last prompt after a recoverable error.
    pub fn retry(&mut self) -> Result<ActorStep, SessionError> {
        let effects = self.machine.apply(MachineInput::Retry {
            request_id: RequestId::new(),
        })?;
        Ok(self.step(effects))
    }

    /// Back to idle with an empty history. The next query starts a fresh
    /// backend conversation.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.machine.apply(MachineInput::Reset)?;
        self.sdk_session_id = None;
        Ok(())
    }

    /// Interrupt for the outstanding request, if any.
    pub fn cancel(&self) -> Option<Command> {
        self.current_request_id()
            .map(|request_id| Command::Interrupt {
                request_id: request_id.clone(),
            })
    }

    /// Feed one wire event. Events for any request other than the current
    /// one, and events the machine rejects, are dropped with a diagnostic.
    pub fn dispatch(&mut self, event: &Event) -> DispatchOutcome {
        let Some(request_id) = event.request_id() else {
            return self.outcome(false, Vec::new());
        };
        if self.current_request_id() != Some(request_id) {
            log::warn!(
                "Session {}: dropping {} for stale request {request_id}",
                self.session_id,
                event.kind()
            );
            return self.outcome(false, Vec::new());
        }

        // Set once the synthesized stream start has changed the session, so a
        // rejected input after it still reports the change.
        let mut started = false;
        if self.state() == SessionState::Sending && !matches!(event, Event::Error { .. }) {
            let start = self.machine.apply(MachineInput::StreamStart {
                request_id: request_id.clone(),
                message_id: MessageId::new(),
                at: Utc::now(),
            });
            if let Err(e) = start {
                log::warn!("Session {}: cannot start stream: {e}", self.session_id);
                return self.outcome(false, Vec::new());
            }
            started = true;
        }

        let input = match event {
            Event::Text { content, .. } => MachineInput::Chunk {
                text: content.clone(),
            },
            Event::Thinking { content, .. } => MachineInput::Thinking {
                text: content.clone(),
            },
            Event::ToolStart {
                tool_id,
                name,
                input,
                ..
            } => MachineInput::ToolStart {
                tool_id: tool_id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
            Event::ToolComplete {
                tool_id,
                result,
                duration_ms,
                ..
            } => MachineInput::ToolComplete {
                tool_id: tool_id.clone(),
                result: result.clone(),
                duration_ms: *duration_ms,
            },
            Event::Complete {
                session_id,
                cost_usd,
                token_count,
                duration_ms,
                ..
            } => MachineInput::Complete(CompletionInfo {
                sdk_session_id: session_id.clone(),
                cost_usd: *cost_usd,
                token_count: *token_count,
                duration_ms: *duration_ms,
            }),
            Event::Error {
                code,
                message,
                recoverable,
                ..
            } => MachineInput::Error(SessionFailure {
                code: code.clone(),
                message: message.clone(),
                recoverable: *recoverable,
            }),
            Event::Pong => return self.outcome(started, Vec::new()),
        };

        match self.machine.apply(input) {
            Ok(effects) => {
                if let Event::Complete {
                    session_id: Some(sdk_session_id),
                    ..
                } = event
                {
                    self.sdk_session_id = Some(sdk_session_id.clone());
                }
                let persist = self.step(effects).persist;
                self.outcome(true, persist)
            }
            Err(e) => {
                log::warn!(
                    "Session {}: dropping {} event: {e}",
                    self.session_id,
                    event.kind()
                );
                self.outcome(started, Vec::new())
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            display_name: self.display_name.clone(),
            state: self.state(),
            messages: self.messages().to_vec(),
            current_request_id: self.current_request_id().cloned(),
            has_active_request: self.has_active_request(),
            last_error: self.machine.last_failure().cloned(),
            last_usage: self.machine.last_completion().cloned(),
            sdk_session_id: self.sdk_session_id.clone(),
        }
    }

    fn step(&self, effects: Vec<Effect>) -> ActorStep {
        let mut step = ActorStep::default();
        for effect in effects {
            match effect {
                Effect::IssueQuery { request_id, prompt } => step.commands.push(Command::Query {
                    request_id,
                    prompt,
                    options: self.query_options(),
                }),
                Effect::Persist(message) => step.persist.push(message),
            }
        }
        step
    }

    /// Session options, resuming the backend session when one is known.
    fn query_options(&self) -> QueryOptions {
        let mut options = self.options.clone();
        if options.session_id.is_none() {
            options.session_id = self.sdk_session_id.clone();
        }
        options
    }

    fn outcome(&self, applied: bool, persist: Vec<Message>) -> DispatchOutcome {
        DispatchOutcome {
            applied,
            persist,
            snapshot: self.snapshot(),
        }
    }
}
