//! Session, conversation and request identifiers.
//!
//! A session id has the shape `<namespace>-<type>-<identifier>`, for example
//! `orion-adhoc-550e8400-e29b-41d4-a716-446655440000`. Stored messages are
//! grouped by a conversation id derived from it:
//!
//! ```text
//! orion-adhoc-550e8400-e29b-41d4-a716-446655440000
//!       └──────────────┬───────────────────────────┘
//! conv_adhoc-550e8400-e29b-41d4-a716-446655440000
//! ```
//!
//! Every component that needs a conversation id (session creation, the
//! message store, the session manager) calls [`conversation_id_for`] or
//! [`derive_conversation_id`]. There is no second implementation.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Prefix of every derived conversation id.
pub const CONVERSATION_PREFIX: &str = "conv_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("Malformed session id (expected <namespace>-<type>-<identifier>): {0:?}")]
    MalformedSessionId(String),
}

/// Identifier of one conversation thread. Persisted by the host across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Storage key for the messages of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Host-generated id of one query/response cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Kind of conversation encoded in the `<type>` part of a session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Daily,
    Project,
    Inbox,
    Adhoc,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionType::Daily => "daily",
            SessionType::Project => "project",
            SessionType::Inbox => "inbox",
            SessionType::Adhoc => "adhoc",
        }
    }

    /// Parse a type name. Anything unrecognized is an ad-hoc session.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "daily" => SessionType::Daily,
            "project" => SessionType::Project,
            "inbox" => SessionType::Inbox,
            _ => SessionType::Adhoc,
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three parts of a well-formed session id, borrowed from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdParts<'a> {
    pub namespace: &'a str,
    pub session_type: &'a str,
    pub identifier: &'a str,
}

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<namespace>[A-Za-z0-9]+)-(?P<type>[^-]+)-(?P<identifier>.+)$")
            .unwrap_or_else(|e| panic!("session id pattern failed to compile: {e}"))
    })
}

/// Split a session id into namespace, type and identifier.
pub fn parse_session_id(session_id: &SessionId) -> Result<SessionIdParts<'_>, IdError> {
    let raw = session_id.as_str();
    let captures = session_id_pattern()
        .captures(raw)
        .ok_or_else(|| IdError::MalformedSessionId(raw.to_string()))?;

    let part = |name: &str| captures.name(name).map(|m| m.as_str()).unwrap_or_default();
    Ok(SessionIdParts {
        namespace: part("namespace"),
        session_type: part("type"),
        identifier: part("identifier"),
    })
}

/// Derive the conversation id for a session id.
///
/// Strips the leading `<namespace>-` and prefixes [`CONVERSATION_PREFIX`].
/// Everything after the namespace separator is kept verbatim, including
/// further separators and any later occurrence of the namespace text.
pub fn derive_conversation_id(session_id: &SessionId) -> Result<ConversationId, IdError> {
    let parts = parse_session_id(session_id)?;
    let rest = &session_id.as_str()[parts.namespace.len() + 1..];
    Ok(ConversationId(format!("{CONVERSATION_PREFIX}{rest}")))
}

/// Infallible derivation used wherever a conversation id must exist.
///
/// A malformed session id is a contract violation: debug builds panic, release
/// builds log it and fall back to `conv_<session id>`.
pub fn conversation_id_for(session_id: &SessionId) -> ConversationId {
    match derive_conversation_id(session_id) {
        Ok(id) => id,
        Err(err) => {
            debug_assert!(false, "{err}");
            log::error!("{err}; falling back to {CONVERSATION_PREFIX}{session_id}");
            ConversationId(format!("{CONVERSATION_PREFIX}{session_id}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod derivation {
        use super::*;

        #[test]
        fn adhoc_uuid_session() {
            let id = SessionId::from("orion-adhoc-550e8400-e29b-41d4-a716-446655440000");
            let conv = derive_conversation_id(&id).unwrap();
            assert_eq!(conv.as_str(), "conv_adhoc-550e8400-e29b-41d4-a716-446655440000");
        }

        #[test]
        fn representative_shapes() {
            let cases = [
                ("orion-daily-2026-01-27", "conv_daily-2026-01-27"),
                ("orion-inbox-2026-01-27", "conv_inbox-2026-01-27"),
                ("orion-project-default", "conv_project-default"),
                ("orion-project-website-redesign", "conv_project-website-redesign"),
                ("orion-project-orion-clone", "conv_project-orion-clone"),
                ("orion-adhoc-a", "conv_adhoc-a"),
                ("dev2-adhoc-x_y-z", "conv_adhoc-x_y-z"),
            ];

            for (session, expected) in cases {
                let conv = derive_conversation_id(&SessionId::from(session)).unwrap();
                assert_eq!(conv.as_str(), expected, "session {session}");
            }
        }

        #[test]
        fn is_deterministic() {
            let id = SessionId::from("orion-project-alpha-beta");
            assert_eq!(
                derive_conversation_id(&id).unwrap(),
                derive_conversation_id(&id).unwrap()
            );
            assert_eq!(derive_conversation_id(&id).unwrap(), conversation_id_for(&id));
        }

        #[test]
        fn rejects_malformed_ids() {
            for raw in ["", "orion", "orion-adhoc", "orion-adhoc-", "-adhoc-x", "or ion-adhoc-x", "orion--x"] {
                let result = derive_conversation_id(&SessionId::from(raw));
                assert_eq!(
                    result,
                    Err(IdError::MalformedSessionId(raw.to_string())),
                    "input {raw:?}"
                );
            }
        }

        #[test]
        #[cfg_attr(debug_assertions, should_panic(expected = "Malformed session id"))]
        fn infallible_entry_is_loud_on_malformed_input() {
            let conv = conversation_id_for(&SessionId::from("garbage"));
            assert_eq!(conv.as_str(), "conv_garbage");
        }
    }

    mod parts {
        use super::*;

        #[test]
        fn splits_namespace_type_identifier() {
            let id = SessionId::from("orion-project-my-project");
            let parts = parse_session_id(&id).unwrap();
            assert_eq!(parts.namespace, "orion");
            assert_eq!(parts.session_type, "project");
            assert_eq!(parts.identifier, "my-project");
        }
    }

    mod session_type {
        use super::*;

        #[test]
        fn parse_known_and_unknown() {
            assert_eq!(SessionType::parse("daily"), SessionType::Daily);
            assert_eq!(SessionType::parse("PROJECT"), SessionType::Project);
            assert_eq!(SessionType::parse(" inbox "), SessionType::Inbox);
            assert_eq!(SessionType::parse("whatever"), SessionType::Adhoc);
        }

        #[test]
        fn serializes_lowercase() {
            let json = serde_json::to_string(&SessionType::Inbox).unwrap();
            assert_eq!(json, "\"inbox\"");
        }
    }

    mod request_id {
        use super::*;

        #[test]
        fn new_generates_unique_ids() {
            assert_ne!(RequestId::new(), RequestId::new());
        }

        #[test]
        fn serializes_as_plain_string() {
            let json = serde_json::to_string(&RequestId::from("req-1")).unwrap();
            assert_eq!(json, "\"req-1\"");
        }
    }
}
