//! JSON-lines message store: `{dir}/{conversation_id}.jsonl`, one message
//! per line, append-only. Session metadata goes to `{dir}/sessions.json`.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use super::index::{
    find_session_entry, load_session_index, save_session_index, upsert_session_entry,
    SessionIndexEntry,
};
use super::validate::{validate_message_id, validate_path_component};
use super::{MessageSink, PersistenceError};
use crate::ids::{conversation_id_for, ConversationId, SessionId};
use crate::session::Message;

pub struct JsonlMessageStore {
    dir: PathBuf,
    // Appends must not interleave within a line, and index updates are
    // read-modify-write.
    write_lock: Mutex<()>,
}

impl JsonlMessageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn conversation_path(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<PathBuf, PersistenceError> {
        validate_path_component(conversation_id.as_str())?;
        Ok(self.dir.join(format!("{conversation_id}.jsonl")))
    }

    /// Storage location of a session's messages.
    pub fn session_path(&self, session_id: &SessionId) -> Result<PathBuf, PersistenceError> {
        self.conversation_path(&conversation_id_for(session_id))
    }

    /// Read a conversation back. A missing file is an empty conversation;
    /// corrupt lines are skipped with a warning.
    pub fn load_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<Message>, PersistenceError> {
        let path = self.conversation_path(conversation_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(&path)?);
        let mut messages = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => messages.push(message),
                Err(e) => log::warn!(
                    "Skipping corrupt line {} of {}: {e}",
                    index + 1,
                    path.display()
                ),
            }
        }
        Ok(messages)
    }

    pub fn load_session_messages(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<Message>, PersistenceError> {
        self.load_messages(&conversation_id_for(session_id))
    }
}

impl MessageSink for JsonlMessageStore {
    fn append(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<(), PersistenceError> {
        validate_message_id(message.id.as_str())?;
        let path = self.conversation_path(conversation_id)?;
        let line = serde_json::to_string(message)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn load(&self, conversation_id: &ConversationId) -> Result<Vec<Message>, PersistenceError> {
        self.load_messages(conversation_id)
    }

    fn save_session(&self, entry: &SessionIndexEntry) -> Result<(), PersistenceError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut index = load_session_index(&self.dir)?;
        upsert_session_entry(&mut index, entry.clone());
        save_session_index(&self.dir, &index)
    }

    fn load_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionIndexEntry>, PersistenceError> {
        let index = load_session_index(&self.dir)?;
        Ok(find_session_entry(&index, session_id).cloned())
    }

    fn list_sessions(&self) -> Result<Vec<SessionIndexEntry>, PersistenceError> {
        Ok(load_session_index(&self.dir)?.sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MessageId, Role};
    use chrono::Utc;
    use tempfile::tempdir;

    fn conv(id: &str) -> ConversationId {
        ConversationId(id.to_string())
    }

    #[test]
    fn append_then_load() {
        let dir = tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path().join("messages"));
        let conversation = conv("conv_adhoc-1");

        let mut reply = Message::streaming_assistant(MessageId::new(), Utc::now());
        reply.content = "Hi there".to_string();
        reply.is_streaming = false;

        store
            .append(&conversation, &Message::user(MessageId::new(), "Hello", Utc::now()))
            .unwrap();
        store.append(&conversation, &reply).unwrap();

        let loaded = store.load_messages(&conversation).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].role, Role::User);
        assert_eq!(loaded[1], reply);
    }

    #[test]
    fn missing_conversation_is_empty() {
        let dir = tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path());
        assert!(store.load_messages(&conv("conv_nothing-here")).unwrap().is_empty());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path());
        let conversation = conv("conv_adhoc-2");
        store
            .append(&conversation, &Message::user(MessageId::new(), "kept", Utc::now()))
            .unwrap();

        let path = store.conversation_path(&conversation).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{truncated").unwrap();
        writeln!(file).unwrap();

        let loaded = store.load_messages(&conversation).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "kept");
    }

    #[test]
    fn rejects_traversal_in_conversation_id() {
        let dir = tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path());
        let message = Message::user(MessageId::new(), "x", Utc::now());
        assert!(matches!(
            store.append(&conv("../escape"), &message),
            Err(PersistenceError::InvalidPathComponent(_))
        ));
    }

    #[test]
    fn rejects_invalid_message_id() {
        let dir = tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path());
        let message = Message::user(MessageId("bad id".to_string()), "x", Utc::now());
        assert!(matches!(
            store.append(&conv("conv_adhoc-3"), &message),
            Err(PersistenceError::InvalidMessageId(_))
        ));
    }

    #[test]
    fn session_index_survives_a_new_store() {
        let dir = tempdir().unwrap();
        let session = SessionId::from("orion-project-web");
        let mut entry = SessionIndexEntry::new(session.clone(), conv("conv_project-web"), Utc::now());
        entry.sdk_session_id = Some("sdk-5".to_string());
        entry.message_count = 2;

        JsonlMessageStore::new(dir.path().join("messages"))
            .save_session(&entry)
            .unwrap();

        let reopened = JsonlMessageStore::new(dir.path().join("messages"));
        assert_eq!(reopened.load_session(&session).unwrap(), Some(entry));
        assert_eq!(reopened.list_sessions().unwrap().len(), 1);
        assert!(dir.path().join("messages").join("sessions.json").exists());
    }

    #[test]
    fn session_path_uses_shared_derivation() {
        let dir = tempdir().unwrap();
        let store = JsonlMessageStore::new(dir.path());
        let session = SessionId::from("orion-project-orion-clone");
        assert_eq!(
            store.session_path(&session).unwrap(),
            dir.path().join("conv_project-orion-clone.jsonl")
        );
    }
}
