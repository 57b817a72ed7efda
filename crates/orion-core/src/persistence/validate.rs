use std::path::{Component, Path};

use super::PersistenceError;

pub const MAX_MESSAGE_ID_LEN: usize = 128;

/// Message ids become part of stored records and are echoed back to the UI,
/// so only a conservative shape is accepted: alphanumerics joined by single
/// `-` or `_`, at most [`MAX_MESSAGE_ID_LEN`] bytes.
pub fn validate_message_id(id: &str) -> Result<(), PersistenceError> {
    let invalid = |reason: &str| Err(PersistenceError::InvalidMessageId(reason.to_string()));

    if id.is_empty() {
        return invalid("Message ID cannot be empty");
    }
    if id.len() > MAX_MESSAGE_ID_LEN {
        return invalid("Message ID too long (max 128 chars)");
    }
    if !id.chars().next().is_some_and(char::is_alphanumeric) {
        return invalid("Message ID must start with alphanumeric character");
    }
    if !id.chars().last().is_some_and(char::is_alphanumeric) {
        return invalid("Message ID must end with alphanumeric character");
    }

    let mut prev_special = false;
    for c in id.chars() {
        let is_special = c == '-' || c == '_';
        if is_special && prev_special {
            return invalid("Message ID cannot have consecutive special characters");
        }
        if !c.is_alphanumeric() && !is_special {
            return invalid("Message ID contains invalid characters");
        }
        prev_special = is_special;
    }

    Ok(())
}

/// Accept exactly one normal path component (no separators, `.` or `..`).
pub fn validate_path_component(component: &str) -> Result<(), PersistenceError> {
    let mut components = Path::new(component).components();
    match components.next() {
        Some(Component::Normal(_)) if components.next().is_none() && !component.contains('/') => {
            Ok(())
        }
        _ => Err(PersistenceError::InvalidPathComponent(component.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(id: &str) -> String {
        match validate_message_id(id) {
            Err(PersistenceError::InvalidMessageId(reason)) => reason,
            other => panic!("Expected InvalidMessageId for {id:?}, got {other:?}"),
        }
    }

    mod message_id {
        use super::*;

        #[test]
        fn accepts_generated_and_simple_ids() {
            for id in ["msg_0a1b2c", "abc", "a-b_c", "A1", "7"] {
                assert!(validate_message_id(id).is_ok(), "{id}");
            }
        }

        #[test]
        fn rejection_reasons() {
            assert_eq!(reason(""), "Message ID cannot be empty");
            assert_eq!(reason(&"a".repeat(129)), "Message ID too long (max 128 chars)");
            assert_eq!(reason("-abc"), "Message ID must start with alphanumeric character");
            assert_eq!(reason("abc_"), "Message ID must end with alphanumeric character");
            assert_eq!(reason("a--b"), "Message ID cannot have consecutive special characters");
            assert_eq!(reason("a_-b"), "Message ID cannot have consecutive special characters");
            assert_eq!(reason("a.b"), "Message ID contains invalid characters");
            assert_eq!(reason("a/b"), "Message ID contains invalid characters");
        }

        #[test]
        fn exactly_max_length_is_allowed() {
            assert!(validate_message_id(&"a".repeat(MAX_MESSAGE_ID_LEN)).is_ok());
        }
    }

    mod path_component {
        use super::*;

        #[test]
        fn accepts_single_component() {
            assert!(validate_path_component("conv_adhoc-123").is_ok());
        }

        #[test]
        fn rejects_traversal_and_separators() {
            for bad in ["", ".", "..", "a/b", "/abs", "../up", "a/"] {
                assert!(validate_path_component(bad).is_err(), "{bad:?}");
            }
        }
    }
}
