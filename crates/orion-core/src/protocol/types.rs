//! Wire types exchanged with the sidecar.
//!
//! Every message is one JSON object per line, discriminated by `type`.
//! The request id travels in the `id` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::RequestId;

/// Error codes the host synthesizes itself. Codes reported by the child
/// (`rate_limit`, `auth_failed`, ...) are passed through untouched.
pub mod codes {
    /// The child exited or closed stdout while the request was in flight.
    pub const CHILD_EXITED: &str = "child_exited";
    /// The query could not be written to the child.
    pub const SUBMIT_FAILED: &str = "submit_failed";

    pub const RATE_LIMIT: &str = "rate_limit";
    pub const AUTH_FAILED: &str = "auth_failed";
    pub const BUDGET_EXCEEDED: &str = "budget_exceeded";
    pub const MAX_TURNS: &str = "max_turns";
    pub const NETWORK: &str = "network";
    pub const TIMEOUT: &str = "timeout";

    pub const WELL_KNOWN: &[&str] = &[
        CHILD_EXITED,
        SUBMIT_FAILED,
        RATE_LIMIT,
        AUTH_FAILED,
        BUDGET_EXCEEDED,
        MAX_TURNS,
        NETWORK,
        TIMEOUT,
    ];

    pub fn is_well_known(code: &str) -> bool {
        WELL_KNOWN.contains(&code)
    }

    /// Codes produced by this host rather than by the child.
    pub fn is_host_synthesized(code: &str) -> bool {
        matches!(code, CHILD_EXITED | SUBMIT_FAILED)
    }

    /// Failures that usually go away if the same prompt is sent again later.
    pub fn is_transient(code: &str) -> bool {
        matches!(code, RATE_LIMIT | NETWORK | TIMEOUT | SUBMIT_FAILED)
    }
}

/// Per-query options forwarded to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Backend session to resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_session: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Host → child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Query {
        #[serde(rename = "id")]
        request_id: RequestId,
        prompt: String,
        #[serde(default)]
        options: QueryOptions,
    },
    Interrupt {
        #[serde(rename = "id")]
        request_id: RequestId,
    },
    Ping,
}

impl Command {
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Command::Query { request_id, .. } | Command::Interrupt { request_id } => {
                Some(request_id)
            }
            Command::Ping => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::Query { .. } => "query",
            Command::Interrupt { .. } => "interrupt",
            Command::Ping => "ping",
        }
    }
}

/// Child → host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Assistant text delta.
    #[serde(rename_all = "camelCase")]
    Text {
        #[serde(rename = "id")]
        request_id: RequestId,
        content: String,
        #[serde(default)]
        is_partial: bool,
    },

    /// Reasoning delta.
    #[serde(rename_all = "camelCase")]
    Thinking {
        #[serde(rename = "id")]
        request_id: RequestId,
        content: String,
        #[serde(default)]
        is_partial: bool,
    },

    #[serde(rename_all = "camelCase")]
    ToolStart {
        #[serde(rename = "id")]
        request_id: RequestId,
        tool_id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename_all = "camelCase")]
    ToolComplete {
        #[serde(rename = "id")]
        request_id: RequestId,
        tool_id: String,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        duration_ms: u64,
    },

    /// Terminal: the request finished normally.
    #[serde(rename_all = "camelCase")]
    Complete {
        #[serde(rename = "id")]
        request_id: RequestId,
        /// Backend session id, used to resume the conversation.
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        cost_usd: f64,
        #[serde(default)]
        token_count: u64,
        #[serde(default)]
        duration_ms: u64,
    },

    /// Terminal: the request failed.
    Error {
        #[serde(rename = "id")]
        request_id: RequestId,
        #[serde(default)]
        code: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        recoverable: bool,
    },

    /// Answer to a ping. Not tied to any request.
    Pong,
}

/// Every `type` value [`Event`] accepts.
pub const EVENT_KINDS: &[&str] = &[
    "text",
    "thinking",
    "tool_start",
    "tool_complete",
    "complete",
    "error",
    "pong",
];

impl Event {
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Event::Text { request_id, .. }
            | Event::Thinking { request_id, .. }
            | Event::ToolStart { request_id, .. }
            | Event::ToolComplete { request_id, .. }
            | Event::Complete { request_id, .. }
            | Event::Error { request_id, .. } => Some(request_id),
            Event::Pong => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Text { .. } => "text",
            Event::Thinking { .. } => "thinking",
            Event::ToolStart { .. } => "tool_start",
            Event::ToolComplete { .. } => "tool_complete",
            Event::Complete { .. } => "complete",
            Event::Error { .. } => "error",
            Event::Pong => "pong",
        }
    }

    /// `complete` and `error` retire their request id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Complete { .. } | Event::Error { .. })
    }

    /// Partial text/thinking deltas. These are the only events a slow
    /// subscriber may lose under backpressure.
    pub fn is_partial(&self) -> bool {
        match self {
            Event::Text { is_partial, .. } | Event::Thinking { is_partial, .. } => *is_partial,
            _ => false,
        }
    }

    /// Fatal error the host reports for a request whose child went away.
    pub fn child_exited(request_id: RequestId, detail: impl Into<String>) -> Self {
        Event::Error {
            request_id,
            code: codes::CHILD_EXITED.to_string(),
            message: detail.into(),
            recoverable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod command {
        use super::*;

        #[test]
        fn query_uses_wire_field_names() {
            let command = Command::Query {
                request_id: RequestId::from("r1"),
                prompt: "Hello".to_string(),
                options: QueryOptions {
                    model: Some("sonnet".to_string()),
                    max_turns: Some(4),
                    session_id: Some("sdk-1".to_string()),
                    fork_session: Some(false),
                    permission_mode: Some("default".to_string()),
                    system_prompt: None,
                },
            };

            let value = serde_json::to_value(&command).unwrap();
            assert_eq!(
                value,
                json!({
                    "type": "query",
                    "id": "r1",
                    "prompt": "Hello",
                    "options": {
                        "model": "sonnet",
                        "maxTurns": 4,
                        "sessionId": "sdk-1",
                        "forkSession": false,
                        "permissionMode": "default"
                    }
                })
            );
        }

        #[test]
        fn unset_options_are_omitted() {
            let command = Command::Query {
                request_id: RequestId::from("r2"),
                prompt: "Hi".to_string(),
                options: QueryOptions::default(),
            };
            let value = serde_json::to_value(&command).unwrap();
            assert_eq!(value["options"], json!({}));
        }

        #[test]
        fn interrupt_and_ping() {
            let interrupt = Command::Interrupt {
                request_id: RequestId::from("r3"),
            };
            assert_eq!(
                serde_json::to_value(&interrupt).unwrap(),
                json!({"type": "interrupt", "id": "r3"})
            );
            assert_eq!(
                serde_json::to_value(Command::Ping).unwrap(),
                json!({"type": "ping"})
            );
            assert_eq!(Command::Ping.request_id(), None);
            assert_eq!(interrupt.kind(), "interrupt");
        }
    }

    mod event {
        use super::*;

        #[test]
        fn text_delta() {
            let event: Event = serde_json::from_value(json!({
                "type": "text", "id": "r1", "content": "Hi", "isPartial": true
            }))
            .unwrap();
            assert_eq!(
                event,
                Event::Text {
                    request_id: RequestId::from("r1"),
                    content: "Hi".to_string(),
                    is_partial: true,
                }
            );
            assert!(event.is_partial());
            assert!(!event.is_terminal());
        }

        #[test]
        fn tool_events() {
            let start: Event = serde_json::from_value(json!({
                "type": "tool_start", "id": "r1", "toolId": "t1", "name": "Read",
                "input": {"path": "/tmp/a"}
            }))
            .unwrap();
            match start {
                Event::ToolStart {
                    tool_id, name, input, ..
                } => {
                    assert_eq!(tool_id, "t1");
                    assert_eq!(name, "Read");
                    assert_eq!(input["path"], "/tmp/a");
                }
                other => panic!("Expected ToolStart, got {other:?}"),
            }

            let done: Event = serde_json::from_value(json!({
                "type": "tool_complete", "id": "r1", "toolId": "t1",
                "result": {"ok": true}, "durationMs": 12
            }))
            .unwrap();
            match done {
                Event::ToolComplete {
                    duration_ms, result, ..
                } => {
                    assert_eq!(duration_ms, 12);
                    assert_eq!(result["ok"], true);
                }
                other => panic!("Expected ToolComplete, got {other:?}"),
            }
        }

        #[test]
        fn complete_metadata() {
            let event: Event = serde_json::from_value(json!({
                "type": "complete", "id": "r1", "sessionId": "sdk-9",
                "costUsd": 0.25, "tokenCount": 420, "durationMs": 1500
            }))
            .unwrap();
            assert!(event.is_terminal());
            match event {
                Event::Complete {
                    session_id,
                    cost_usd,
                    token_count,
                    duration_ms,
                    ..
                } => {
                    assert_eq!(session_id.as_deref(), Some("sdk-9"));
                    assert_eq!(cost_usd, 0.25);
                    assert_eq!(token_count, 420);
                    assert_eq!(duration_ms, 1500);
                }
                other => panic!("Expected Complete, got {other:?}"),
            }
        }

        #[test]
        fn error_and_pong() {
            let error: Event = serde_json::from_value(json!({
                "type": "error", "id": "r1", "code": "rate_limit",
                "message": "slow down", "recoverable": true
            }))
            .unwrap();
            assert!(error.is_terminal());
            assert_eq!(error.request_id(), Some(&RequestId::from("r1")));

            let pong: Event = serde_json::from_value(json!({"type": "pong"})).unwrap();
            assert_eq!(pong, Event::Pong);
            assert_eq!(pong.request_id(), None);
        }

        #[test]
        fn child_exited_is_fatal() {
            let event = Event::child_exited(RequestId::from("r7"), "gone");
            match event {
                Event::Error {
                    code, recoverable, ..
                } => {
                    assert_eq!(code, codes::CHILD_EXITED);
                    assert!(!recoverable);
                }
                other => panic!("Expected Error, got {other:?}"),
            }
        }

        #[test]
        fn error_code_classification() {
            assert!(codes::is_well_known("budget_exceeded"));
            assert!(!codes::is_well_known("mystery"));

            assert!(codes::is_host_synthesized(codes::CHILD_EXITED));
            assert!(!codes::is_host_synthesized(codes::RATE_LIMIT));

            assert!(codes::is_transient(codes::RATE_LIMIT));
            assert!(codes::is_transient(codes::SUBMIT_FAILED));
            assert!(!codes::is_transient(codes::AUTH_FAILED));
            assert!(!codes::is_transient(codes::CHILD_EXITED));
        }

        #[test]
        fn kinds_table_matches_variants() {
            let samples = [
                Event::Text {
                    request_id: RequestId::from("a"),
                    content: String::new(),
                    is_partial: false,
                },
                Event::Pong,
                Event::child_exited(RequestId::from("a"), ""),
            ];
            for event in samples {
                assert!(EVENT_KINDS.contains(&event.kind()));
            }
        }
    }
}
