//! Session creation.
//!
//! Ids follow `<namespace>-<type>-<identifier>`. Daily and inbox sessions are
//! keyed by UTC date, so creating one twice on the same day yields the same
//! id; project sessions by project id; ad-hoc sessions by a fresh UUID.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SessionError;
use crate::ids::{conversation_id_for, ConversationId, SessionId, SessionType};

/// A newly created session as handed to the host for persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub conversation_id: ConversationId,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

pub trait SessionCreator: Send + Sync {
    fn create_session(
        &self,
        session_type: SessionType,
        project_id: Option<&str>,
    ) -> Result<SessionRecord, SessionError>;
}

#[derive(Debug, Clone)]
pub struct LocalSessionCreator {
    namespace: String,
}

impl LocalSessionCreator {
    /// The namespace must be non-empty ASCII alphanumerics.
    pub fn new(namespace: impl Into<String>) -> Result<Self, SessionError> {
        let namespace = namespace.into();
        if namespace.is_empty() || !namespace.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(SessionError::Create(format!(
                "Invalid namespace {namespace:?}: expected ASCII letters and digits"
            )));
        }
        Ok(Self { namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Create a session as of `now`.
    pub fn create_at(
        &self,
        session_type: SessionType,
        project_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, SessionError> {
        let project_id = project_id.map(str::trim).filter(|p| !p.is_empty());
        let ns = &self.namespace;

        let (identifier, display_name) = match session_type {
            SessionType::Daily => (
                now.format("%Y-%m-%d").to_string(),
                format!("Daily - {}", now.format("%B %d, %Y")),
            ),
            SessionType::Project => (
                project_id.unwrap_or("default").to_string(),
                format!("Project: {}", project_id.unwrap_or("Untitled")),
            ),
            SessionType::Inbox => (
                now.format("%Y-%m-%d").to_string(),
                "Inbox Processing".to_string(),
            ),
            SessionType::Adhoc => (
                Uuid::new_v4().to_string(),
                format!("Session at {}", now.format("%H:%M")),
            ),
        };

        let session_id = SessionId(format!("{ns}-{}-{identifier}", session_type.as_str()));
        let conversation_id = conversation_id_for(&session_id);
        log::debug!("Created session {session_id} ({conversation_id})");

        Ok(SessionRecord {
            session_id,
            conversation_id,
            session_type,
            display_name,
            created_at: now,
        })
    }
}

impl SessionCreator for LocalSessionCreator {
    fn create_session(
        &self,
        session_type: SessionType,
        project_id: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        self.create_at(session_type, project_id, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::derive_conversation_id;
    use chrono::TimeZone;

    fn creator() -> LocalSessionCreator {
        LocalSessionCreator::new("orion").unwrap()
    }

    fn morning() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 27, 9, 5, 0).unwrap()
    }

    #[test]
    fn daily_session() {
        let record = creator()
            .create_at(SessionType::Daily, None, morning())
            .unwrap();
        assert_eq!(record.session_id.as_str(), "orion-daily-2026-01-27");
        assert_eq!(record.conversation_id.as_str(), "conv_daily-2026-01-27");
        assert_eq!(record.display_name, "Daily - January 27, 2026");
    }

    #[test]
    fn project_session_with_and_without_id() {
        let with = creator()
            .create_at(SessionType::Project, Some("website"), morning())
            .unwrap();
        assert_eq!(with.session_id.as_str(), "orion-project-website");
        assert_eq!(with.display_name, "Project: website");

        let without = creator()
            .create_at(SessionType::Project, Some("  "), morning())
            .unwrap();
        assert_eq!(without.session_id.as_str(), "orion-project-default");
        assert_eq!(without.display_name, "Project: Untitled");
    }

    #[test]
    fn inbox_session() {
        let record = creator()
            .create_at(SessionType::Inbox, None, morning())
            .unwrap();
        assert_eq!(record.session_id.as_str(), "orion-inbox-2026-01-27");
        assert_eq!(record.display_name, "Inbox Processing");
    }

    #[test]
    fn adhoc_sessions_are_unique() {
        let a = creator().create_at(SessionType::Adhoc, None, morning()).unwrap();
        let b = creator().create_at(SessionType::Adhoc, None, morning()).unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert!(a.session_id.as_str().starts_with("orion-adhoc-"));
        assert_eq!(a.display_name, "Session at 09:05");
    }

    #[test]
    fn conversation_id_matches_storage_derivation() {
        for session_type in [
            SessionType::Daily,
            SessionType::Project,
            SessionType::Inbox,
            SessionType::Adhoc,
        ] {
            let record = creator()
                .create_at(session_type, Some("orion-clone"), morning())
                .unwrap();
            assert_eq!(
                record.conversation_id,
                derive_conversation_id(&record.session_id).unwrap()
            );
        }
    }

    #[test]
    fn rejects_bad_namespace() {
        assert!(LocalSessionCreator::new("").is_err());
        assert!(LocalSessionCreator::new("my-app").is_err());
        assert!(LocalSessionCreator::new("dev2").is_ok());
    }

    #[test]
    fn record_serializes_type_field() {
        let record = creator()
            .create_at(SessionType::Inbox, None, morning())
            .unwrap();
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "inbox");
        assert_eq!(value["sessionId"], "orion-inbox-2026-01-27");
        assert_eq!(value["displayName"], "Inbox Processing");
    }
}
