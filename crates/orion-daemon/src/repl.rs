//! Line-oriented command language read from stdin.

use orion_core::{SessionId, SessionType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `new [type] [project]`
    New {
        session_type: SessionType,
        project: Option<String>,
    },
    Switch(SessionId),
    Send(String),
    Cancel,
    Retry,
    Reset,
    List,
    /// `recent [n]`
    Recent(usize),
    Show,
    Ping,
    Help,
    Quit,
}

pub const HELP: &str = "\
Commands:
  new [daily|project|inbox|adhoc] [project]   create and switch to a session
  switch <sessionId>                          switch the active session
  send <text>                                 send a prompt to the active session
  cancel | retry | reset                      act on the active session
  list | show                                 list resident sessions / show the active one
  recent [n]                                  stored sessions, most recent first
  ping | help | quit";

const DEFAULT_RECENT: usize = 20;

/// Parse one input line. `Ok(None)` for a blank line.
pub fn parse(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let input = match word.to_ascii_lowercase().as_str() {
        "new" => {
            let mut parts = rest.split_whitespace();
            let session_type = parts.next().map_or(SessionType::Adhoc, SessionType::parse);
            let project = parts.next().map(str::to_string);
            Input::New {
                session_type,
                project,
            }
        }
        "switch" if !rest.is_empty() => Input::Switch(SessionId::from(rest)),
        "switch" => return Err("usage: switch <sessionId>".to_string()),
        "send" if !rest.is_empty() => Input::Send(rest.to_string()),
        "send" => return Err("usage: send <text>".to_string()),
        "cancel" => Input::Cancel,
        "retry" => Input::Retry,
        "reset" => Input::Reset,
        "list" | "ls" => Input::List,
        "recent" if rest.is_empty() => Input::Recent(DEFAULT_RECENT),
        "recent" => match rest.parse() {
            Ok(limit) => Input::Recent(limit),
            Err(_) => return Err("usage: recent [count]".to_string()),
        },
        "show" => Input::Show,
        "ping" => Input::Ping,
        "help" | "?" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command {other:?}, try `help`")),
    };
    Ok(Some(input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse("   "), Ok(None));
    }

    #[test]
    fn new_with_type_and_project() {
        assert_eq!(
            parse("new project website"),
            Ok(Some(Input::New {
                session_type: SessionType::Project,
                project: Some("website".to_string()),
            }))
        );
        assert_eq!(
            parse("new"),
            Ok(Some(Input::New {
                session_type: SessionType::Adhoc,
                project: None,
            }))
        );
    }

    #[test]
    fn send_keeps_the_whole_prompt() {
        assert_eq!(
            parse("send  what is  up?"),
            Ok(Some(Input::Send("what is  up?".to_string())))
        );
        assert!(parse("send").is_err());
    }

    #[test]
    fn switch_requires_an_id() {
        assert_eq!(
            parse("switch orion-daily-2026-01-27"),
            Ok(Some(Input::Switch(SessionId::from("orion-daily-2026-01-27"))))
        );
        assert!(parse("switch").is_err());
    }

    #[test]
    fn recent_takes_an_optional_count() {
        assert_eq!(parse("recent"), Ok(Some(Input::Recent(DEFAULT_RECENT))));
        assert_eq!(parse("recent 5"), Ok(Some(Input::Recent(5))));
        assert!(parse("recent lots").is_err());
    }

    #[test]
    fn unknown_command() {
        assert!(parse("frobnicate").unwrap_err().contains("frobnicate"));
    }
}
