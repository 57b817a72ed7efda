//! Line codec for the sidecar protocol.
//!
//! Commands are encoded to one newline-terminated JSON line. Child output is
//! decoded line by line; a line that is not valid JSON or carries an unknown
//! `type` is logged and skipped so that the stream keeps flowing.

use serde_json::Value;
use thiserror::Error;

use super::types::{Command, Event, EVENT_KINDS};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to encode command: {0}")]
    Encode(serde_json::Error),

    #[error("Malformed event line: {0}")]
    Json(serde_json::Error),

    #[error("Event line has no \"type\" field")]
    MissingKind,

    #[error("Unknown event type: {0}")]
    UnknownKind(String),
}

/// Encode a command as one JSON line, including the trailing newline.
pub fn encode_command(command: &Command) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(command).map_err(CodecError::Encode)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line of child output.
pub fn decode_event(line: &str) -> Result<Event, CodecError> {
    let value: Value = serde_json::from_str(line.trim()).map_err(CodecError::Json)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingKind)?;

    if !EVENT_KINDS.contains(&kind) {
        return Err(CodecError::UnknownKind(kind.to_string()));
    }

    serde_json::from_value(value).map_err(CodecError::Json)
}

/// Incremental decoder for a byte stream that may split lines across reads.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: String,
    rejected: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lines discarded so far.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Feed raw output and collect the events of every completed line.
    pub fn feed(&mut self, data: &str) -> Vec<Event> {
        self.buffer.push_str(data);
        let buffer = std::mem::take(&mut self.buffer);

        let mut lines: Vec<&str> = buffer.split('\n').collect();
        if let Some(incomplete) = lines.pop() {
            self.buffer = incomplete.to_string();
        }

        lines
            .into_iter()
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    /// Decode whatever is left once the stream has ended.
    pub fn flush(&mut self) -> Vec<Event> {
        let remaining = std::mem::take(&mut self.buffer);
        self.decode_line(&remaining).into_iter().collect()
    }

    fn decode_line(&mut self, line: &str) -> Option<Event> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        match decode_event(trimmed) {
            Ok(event) => Some(event),
            Err(err) => {
                self.rejected += 1;
                log::warn!("Discarding sidecar line ({err}): {trimmed}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::RequestId;
    use crate::protocol::types::QueryOptions;

    mod encode {
        use super::*;

        #[test]
        fn one_line_with_newline() {
            let line = encode_command(&Command::Query {
                request_id: RequestId::from("r1"),
                prompt: "multi\nline prompt".to_string(),
                options: QueryOptions::default(),
            })
            .unwrap();

            assert!(line.ends_with('\n'));
            assert_eq!(line.matches('\n').count(), 1, "embedded newline must be escaped");
            assert!(line.starts_with("{\"type\":\"query\""));
        }

        #[test]
        fn ping_line() {
            assert_eq!(encode_command(&Command::Ping).unwrap(), "{\"type\":\"ping\"}\n");
        }
    }

    mod decode {
        use super::*;

        #[test]
        fn known_event() {
            let event = decode_event(r#"{"type":"pong"}"#).unwrap();
            assert_eq!(event, Event::Pong);
        }

        #[test]
        fn malformed_json() {
            assert!(matches!(decode_event("{not json"), Err(CodecError::Json(_))));
        }

        #[test]
        fn missing_type() {
            assert!(matches!(
                decode_event(r#"{"id":"r1"}"#),
                Err(CodecError::MissingKind)
            ));
        }

        #[test]
        fn unknown_type() {
            match decode_event(r#"{"type":"status","id":"r1"}"#) {
                Err(CodecError::UnknownKind(kind)) => assert_eq!(kind, "status"),
                other => panic!("Expected UnknownKind, got {other:?}"),
            }
        }

        #[test]
        fn known_type_with_missing_fields() {
            assert!(matches!(
                decode_event(r#"{"type":"text","id":"r1"}"#),
                Err(CodecError::Json(_))
            ));
        }
    }

    mod line_decoder {
        use super::*;

        #[test]
        fn buffers_partial_lines() {
            let mut decoder = LineDecoder::new();
            assert!(decoder.feed(r#"{"type":"text","id":"r1","#).is_empty());
            let events = decoder.feed("\"content\":\"Hi\",\"isPartial\":true}\n");
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].kind(), "text");
        }

        #[test]
        fn multiple_lines_in_one_chunk() {
            let mut decoder = LineDecoder::new();
            let events = decoder.feed("{\"type\":\"pong\"}\n{\"type\":\"pong\"}\n");
            assert_eq!(events, vec![Event::Pong, Event::Pong]);
        }

        #[test]
        fn bad_lines_do_not_stop_the_stream() {
            let mut decoder = LineDecoder::new();
            let events = decoder.feed(concat!(
                "garbage\n",
                "{\"type\":\"mystery\"}\n",
                "\n",
                "{\"type\":\"pong\"}\n",
            ));
            assert_eq!(events, vec![Event::Pong]);
            assert_eq!(decoder.rejected(), 2);
        }

        #[test]
        fn flush_decodes_trailing_line() {
            let mut decoder = LineDecoder::new();
            assert!(decoder.feed("{\"type\":\"pong\"}").is_empty());
            assert_eq!(decoder.flush(), vec![Event::Pong]);
            assert!(decoder.flush().is_empty());
        }
    }
}
