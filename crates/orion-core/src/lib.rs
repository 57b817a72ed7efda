//! # orion-core
//!
//! Session engine for Orion, a multi-session AI assistant host.
//!
//! Many conversations share one long-lived sidecar process. Each conversation
//! is a session with its own state machine; the sidecar's event stream is
//! routed back to sessions by request id, so sessions in the background keep
//! streaming while another one is in view.
//!
//! ## Key Concepts
//!
//! - **Session**: one conversation thread, `<namespace>-<type>-<identifier>`
//! - **Request**: one query/response cycle; at most one per session at a time
//! - **Sidecar**: the child process speaking newline-delimited JSON
//! - **Conversation id**: the storage key derived from a session id

pub mod config;
pub mod event_bus;
pub mod ids;
pub mod logging;
pub mod paths;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod shell;
pub mod sidecar;
pub mod spawn;

// Re-export commonly used types
pub use config::EngineConfig;
pub use ids::{ConversationId, RequestId, SessionId, SessionType};
pub use protocol::{Command, Event};
pub use session::{SessionManager, SessionSnapshot};
pub use sidecar::SidecarAdapter;
