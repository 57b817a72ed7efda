//! Session index: `sessions.json`, lightweight metadata for every session
//! that ever stored a message or was created.
//!
//! Messages live in per-conversation files and are only read when a session
//! is activated; the index is what lists sessions and remembers the backend
//! session to resume.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PersistenceError;
use crate::ids::{parse_session_id, ConversationId, SessionId, SessionType};

pub const SESSION_INDEX_FILE: &str = "sessions.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndexEntry {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Backend conversation to resume on the next query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    pub last_active: DateTime<Utc>,
    #[serde(default)]
    pub message_count: usize,
}

impl SessionIndexEntry {
    pub fn new(session_id: SessionId, conversation_id: ConversationId, at: DateTime<Utc>) -> Self {
        let session_type = parse_session_id(&session_id)
            .map(|parts| SessionType::parse(parts.session_type))
            .unwrap_or(SessionType::Adhoc);
        Self {
            session_id,
            conversation_id,
            session_type,
            display_name: None,
            sdk_session_id: None,
            last_active: at,
            message_count: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionIndex {
    #[serde(default)]
    pub sessions: Vec<SessionIndexEntry>,
}

/// Write the index atomically through a temp file.
pub fn save_session_index(dir: &Path, index: &SessionIndex) -> Result<(), PersistenceError> {
    fs::create_dir_all(dir)?;

    let file_path = dir.join(SESSION_INDEX_FILE);
    let temp_path = dir.join(format!("{SESSION_INDEX_FILE}.tmp"));

    let json = serde_json::to_string_pretty(index)?;
    fs::write(&temp_path, json)?;
    fs::rename(&temp_path, &file_path)?;
    Ok(())
}

/// Returns an empty index if the file doesn't exist.
pub fn load_session_index(dir: &Path) -> Result<SessionIndex, PersistenceError> {
    let file_path = dir.join(SESSION_INDEX_FILE);
    if !file_path.exists() {
        return Ok(SessionIndex::default());
    }

    let contents = fs::read_to_string(&file_path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Replace the entry with the same session id, or add it.
pub fn upsert_session_entry(index: &mut SessionIndex, entry: SessionIndexEntry) {
    index.sessions.retain(|s| s.session_id != entry.session_id);
    index.sessions.push(entry);
}

pub fn find_session_entry<'a>(
    index: &'a SessionIndex,
    session_id: &SessionId,
) -> Option<&'a SessionIndexEntry> {
    index.sessions.iter().find(|s| &s.session_id == session_id)
}

/// Most recently active first. Ties keep id order so listings are stable.
pub fn sort_recent(entries: &mut [SessionIndexEntry]) {
    entries.sort_by(|a, b| {
        b.last_active
            .cmp(&a.last_active)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn entry(id: &str, minute: u32) -> SessionIndexEntry {
        let session_id = SessionId::from(id);
        let conversation_id = crate::ids::conversation_id_for(&session_id);
        let at = Utc.with_ymd_and_hms(2026, 1, 27, 9, minute, 0).unwrap();
        SessionIndexEntry::new(session_id, conversation_id, at)
    }

    #[test]
    fn missing_index_is_empty() {
        let dir = tempdir().unwrap();
        assert_eq!(load_session_index(dir.path()).unwrap(), SessionIndex::default());
    }

    #[test]
    fn save_then_load_keeps_entries() {
        let dir = tempdir().unwrap();
        let mut index = SessionIndex::default();
        let mut daily = entry("orion-daily-2026-01-27", 5);
        daily.sdk_session_id = Some("sdk-9".to_string());
        daily.message_count = 4;
        upsert_session_entry(&mut index, daily.clone());

        save_session_index(dir.path(), &index).unwrap();
        assert!(!dir.path().join("sessions.json.tmp").exists());

        let loaded = load_session_index(dir.path()).unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.sessions[0].session_type, SessionType::Daily);
    }

    #[test]
    fn serializes_type_and_camel_case() {
        let value = serde_json::to_value(entry("orion-project-web", 0)).unwrap();
        assert_eq!(value["type"], "project");
        assert_eq!(value["conversationId"], "conv_project-web");
        assert_eq!(value["messageCount"], 0);
        assert!(value.get("sdkSessionId").is_none());
    }

    #[test]
    fn upsert_replaces_by_session_id() {
        let mut index = SessionIndex::default();
        upsert_session_entry(&mut index, entry("orion-adhoc-a", 1));
        let mut newer = entry("orion-adhoc-a", 2);
        newer.message_count = 2;
        upsert_session_entry(&mut index, newer);

        assert_eq!(index.sessions.len(), 1);
        let found = find_session_entry(&index, &SessionId::from("orion-adhoc-a")).unwrap();
        assert_eq!(found.message_count, 2);
    }

    #[test]
    fn sort_recent_orders_by_last_active() {
        let mut entries = vec![
            entry("orion-adhoc-old", 1),
            entry("orion-adhoc-new", 9),
            entry("orion-adhoc-b", 5),
            entry("orion-adhoc-a", 5),
        ];
        sort_recent(&mut entries);
        let ids: Vec<&str> = entries.iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["orion-adhoc-new", "orion-adhoc-a", "orion-adhoc-b", "orion-adhoc-old"]
        );
    }
}
