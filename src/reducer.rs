// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! State field reducers for merging updates.
//!
//! Reducers define how state fields are merged when a delta is applied. The
//! message sequence uses order-preserving append; every other field is
//! replace-on-update. The JSON-level variants back the registry in
//! [`crate::state::ReducerRegistry`], where mergers are keyed by field name.

use serde_json::Value;

use crate::messages::Message;

/// Trait for reducing (merging) a typed state field update.
///
/// A reducer takes the current value and the update, and returns the merged
/// result.
pub trait Reducer<T>: Send + Sync {
    /// Merge `left` (current) and `right` (update).
    fn reduce(&self, left: T, right: T) -> T;
}

/// Append reducer for `Vec<Message>`: `old ++ new`, order preserving.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppendMessagesReducer;

impl Reducer<Vec<Message>> for AppendMessagesReducer {
    fn reduce(&self, mut left: Vec<Message>, right: Vec<Message>) -> Vec<Message> {
        left.extend(right);
        left
    }
}

/// JSON-level append merger for the message sequence.
///
/// Both sides are expected to be arrays; a non-array side degrades to
/// replace-on-update so a malformed delta cannot destroy history silently:
/// the replacement is visible in the persisted state.
#[must_use]
pub fn append_messages(left: Value, right: Value) -> Value {
    match (left, right) {
        (Value::Array(mut left), Value::Array(right)) => {
            left.extend(right);
            Value::Array(left)
        }
        (Value::Null, right) => right,
        (_, right) => right,
    }
}

/// JSON-level replace merger: the update wins.
#[must_use]
pub fn replace(_left: Value, right: Value) -> Value {
    right
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_append_preserves_order() {
        let left = vec![Message::system("s"), Message::user("u")];
        let right = vec![Message::assistant("a")];
        let merged = AppendMessagesReducer.reduce(left, right);
        assert_eq!(merged.len(), 3);
        assert!(merged[0].is_system());
        assert!(merged[2].is_assistant());
    }

    #[test]
    fn typed_append_with_empty_right_is_identity() {
        let left = vec![Message::user("u")];
        let merged = AppendMessagesReducer.reduce(left.clone(), vec![]);
        assert_eq!(merged, left);
    }

    #[test]
    fn json_append_concatenates_arrays() {
        let merged = append_messages(json!([1, 2]), json!([3]));
        assert_eq!(merged, json!([1, 2, 3]));
    }

    #[test]
    fn json_append_from_null_takes_right() {
        let merged = append_messages(Value::Null, json!([1]));
        assert_eq!(merged, json!([1]));
    }

    #[test]
    fn json_replace_takes_right() {
        assert_eq!(replace(json!("old"), json!("new")), json!("new"));
    }

    #[test]
    fn old_sequence_is_prefix_of_merged() {
        let old = json!(["a", "b"]);
        let merged = append_messages(old.clone(), json!(["c", "d"]));
        let old_arr = old.as_array().unwrap();
        let merged_arr = merged.as_array().unwrap();
        assert_eq!(&merged_arr[..old_arr.len()], &old_arr[..]);
    }
}
