//! Child runtime adapter.
//!
//! One long-lived sidecar process serves every session. Requests are
//! multiplexed over its stdin by request id; its stdout is decoded on a
//! reader thread and fanned out to subscribers through an [`EventHub`].

mod adapter;
mod hub;
mod launcher;

pub use adapter::{AdapterOptions, AdapterStatus, RestartPolicy, SidecarAdapter};
pub use hub::{EventHub, Subscription};
pub use launcher::{
    LineWriter, MemoryChild, MemoryLauncher, ProcessLauncher, SidecarLauncher, SidecarLink,
};

use thiserror::Error;

use crate::ids::RequestId;
use crate::protocol::{CodecError, Command};
use crate::spawn::SpawnError;

#[derive(Error, Debug)]
pub enum SidecarError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("Failed to write to sidecar: {0}")]
    Write(#[from] std::io::Error),

    #[error("Sidecar is unavailable (restart limit reached or shut down)")]
    Unavailable,

    #[error("Sidecar is restarting")]
    Restarting,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Where sessions send their commands.
///
/// [`SidecarAdapter`] is the production implementation; the session manager
/// only sees this trait.
pub trait CommandDispatcher: Send + Sync {
    fn submit(&self, command: Command) -> Result<(), SidecarError>;

    /// Advisory cancel. `Ok(false)` when the request is not in flight.
    fn interrupt(&self, request_id: &RequestId) -> Result<bool, SidecarError>;
}
