//! Snapshot broadcasting to UI front-ends.
//!
//! Every change to a session is published as a [`BroadcastEvent`] whose
//! `event_type` names the topic:
//!
//! | topic | payload |
//! |---|---|
//! | `session:snapshot:<sessionId>` | [`SessionSnapshot`] |
//! | `session:active` | `{"sessionId": ...}` |
//! | `session:evicted:<sessionId>` | `{"sessionId": ...}` |
//!
//! Broadcast is lossy for subscribers that fall behind by more than the
//! channel capacity; they see `Lagged` and should re-pull snapshots from the
//! manager.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use crate::ids::SessionId;
use crate::session::SessionSnapshot;

const DEFAULT_CAPACITY: usize = 1024;

pub const ACTIVE_CHANGED_TOPIC: &str = "session:active";

pub fn snapshot_topic(session_id: &SessionId) -> String {
    format!("session:snapshot:{session_id}")
}

pub fn evicted_topic(session_id: &SessionId) -> String {
    format!("session:evicted:{session_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl BroadcastEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Serialize `payload` and publish it under `event_type`. Returns the
    /// number of subscribers reached.
    pub fn emit<T: Serialize>(&self, event_type: &str, payload: &T) -> usize {
        match serde_json::to_value(payload) {
            Ok(value) => self.emit_raw(BroadcastEvent::new(event_type, value)),
            Err(e) => {
                log::warn!("Failed to serialize {event_type} payload: {e}");
                0
            }
        }
    }

    pub fn emit_raw(&self, event: BroadcastEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn emit_snapshot(&self, snapshot: &SessionSnapshot) -> usize {
        self.emit(&snapshot_topic(&snapshot.session_id), snapshot)
    }

    pub fn emit_active_changed(&self, session_id: &SessionId) -> usize {
        self.emit(ACTIVE_CHANGED_TOPIC, &json!({ "sessionId": session_id }))
    }

    pub fn emit_evicted(&self, session_id: &SessionId) -> usize {
        self.emit(&evicted_topic(session_id), &json!({ "sessionId": session_id }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
