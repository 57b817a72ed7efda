//! Sessions: the pure state machine, the actor that wraps it, and the
//! manager that owns every actor.

mod actor;
mod creator;
mod machine;
mod manager;
mod message;

pub use actor::{ActorStep, DispatchOutcome, SessionActor, SessionSnapshot};
pub use creator::{LocalSessionCreator, SessionCreator, SessionRecord};
pub use machine::{
    transition, CompletionInfo, Effect, MachineInput, SessionFailure, SessionMachine,
    SessionState, TransitionError,
};
pub use manager::{RecentSession, RetentionPolicy, SessionManager, SessionSummary};
pub use message::{Message, MessageId, Role, ToolCall};

use thiserror::Error;

use crate::ids::{IdError, SessionId};
use crate::sidecar::SidecarError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error(transparent)]
    InvalidSessionId(#[from] IdError),

    #[error("Invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("Session {0} already has a request in flight")]
    Busy(SessionId),

    #[error("Failed to create session: {0}")]
    Create(String),

    #[error("Failed to submit to sidecar: {0}")]
    Submit(#[from] SidecarError),
}
