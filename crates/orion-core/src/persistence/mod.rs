//! Where finished messages go.
//!
//! The session manager hands every finalized message to a [`MessageSink`],
//! keyed by conversation id, along with a [`SessionIndexEntry`] per session.
//! [`JsonlMessageStore`] keeps one append-only JSON-lines file per
//! conversation next to a `sessions.json` index; [`MemoryMessageSink`] keeps
//! both in memory.

mod index;
mod jsonl;
mod validate;

pub use index::{
    find_session_entry, load_session_index, save_session_index, sort_recent,
    upsert_session_entry, SessionIndex, SessionIndexEntry, SESSION_INDEX_FILE,
};
pub use jsonl::JsonlMessageStore;
pub use validate::{validate_message_id, validate_path_component, MAX_MESSAGE_ID_LEN};

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::ids::{ConversationId, SessionId};
use crate::session::Message;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message id: {0}")]
    InvalidMessageId(String),

    #[error("Invalid path component: {0:?}")]
    InvalidPathComponent(String),
}

pub trait MessageSink: Send + Sync {
    fn append(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<(), PersistenceError>;

    /// Stored messages of a conversation, oldest first. Used to rehydrate a
    /// session that is not resident.
    fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, PersistenceError> {
        let _ = conversation_id;
        Ok(Vec::new())
    }

    /// Record a session's metadata, replacing any earlier entry.
    fn save_session(&self, entry: &SessionIndexEntry) -> Result<(), PersistenceError> {
        let _ = entry;
        Ok(())
    }

    fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionIndexEntry>, PersistenceError> {
        let _ = session_id;
        Ok(None)
    }

    /// Every recorded session, in no particular order.
    fn list_sessions(&self) -> Result<Vec<SessionIndexEntry>, PersistenceError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
pub struct MemoryMessageSink {
    conversations: Mutex<HashMap<ConversationId, Vec<Message>>>,
    sessions: Mutex<HashMap<SessionId, SessionIndexEntry>>,
}

impl MemoryMessageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn conversation_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<ConversationId> = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }
}

impl MessageSink for MemoryMessageSink {
    fn append(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<(), PersistenceError> {
        validate_message_id(message.id.as_str())?;
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(conversation_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, PersistenceError> {
        Ok(self.messages(conversation_id))
    }

    fn save_session(&self, entry: &SessionIndexEntry) -> Result<(), PersistenceError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.session_id.clone(), entry.clone());
        Ok(())
    }

    fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionIndexEntry>, PersistenceError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned())
    }

    fn list_sessions(&self) -> Result<Vec<SessionIndexEntry>, PersistenceError> {
        Ok(self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MessageId;
    use chrono::Utc;

    #[test]
    fn memory_sink_groups_by_conversation() {
        let sink = MemoryMessageSink::new();
        let a = ConversationId("conv_adhoc-a".to_string());
        let b = ConversationId("conv_adhoc-b".to_string());

        sink.append(&a, &Message::user(MessageId::new(), "one", Utc::now()))
            .unwrap();
        sink.append(&b, &Message::user(MessageId::new(), "two", Utc::now()))
            .unwrap();
        sink.append(&a, &Message::user(MessageId::new(), "three", Utc::now()))
            .unwrap();

        let contents: Vec<String> = sink.load(&a).unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["one", "three"]);
        assert_eq!(sink.conversation_ids(), vec![a, b]);
    }

    #[test]
    fn memory_sink_keeps_one_entry_per_session() {
        let sink = MemoryMessageSink::new();
        let id = SessionId::from("orion-adhoc-a");
        let conv = crate::ids::conversation_id_for(&id);
        let mut entry = SessionIndexEntry::new(id.clone(), conv, Utc::now());
        sink.save_session(&entry).unwrap();
        entry.sdk_session_id = Some("sdk-3".to_string());
        sink.save_session(&entry).unwrap();

        assert_eq!(sink.list_sessions().unwrap().len(), 1);
        let loaded = sink.load_session(&id).unwrap().unwrap();
        assert_eq!(loaded.sdk_session_id.as_deref(), Some("sdk-3"));
        assert!(sink
            .load_session(&SessionId::from("orion-adhoc-b"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn memory_sink_rejects_bad_message_id() {
        let sink = MemoryMessageSink::new();
        let conv = ConversationId("conv_adhoc-a".to_string());
        let message = Message::user(MessageId("-bad".to_string()), "x", Utc::now());
        assert!(matches!(
            sink.append(&conv, &message),
            Err(PersistenceError::InvalidMessageId(_))
        ));
    }
}
