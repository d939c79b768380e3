// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Agent state and the registered-merger update path.
//!
//! [`AgentState`] is the shared execution context flowing through agents and
//! workflows. It is never mutated in place: updates are expressed as a
//! [`StateDelta`] (a field-name to JSON-value mapping) and applied through a
//! [`ReducerRegistry`], which merges each field with its registered reducer
//! or replaces it when none is registered. The message sequence is the only
//! field with a registered reducer (order-preserving append), so the old
//! sequence is always a prefix of the new one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::messages::Message;
use crate::reducer;

/// Shared execution context for an agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// Conversation history. Append-only through the registry.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Next planned action hint.
    #[serde(default)]
    pub next_action: Option<String>,
    /// Name of the currently executing agent.
    pub current_agent: String,
    /// Key consulted by conditional workflow edges.
    #[serde(default)]
    pub routing_key: Option<String>,
    /// Free-form context carried between nodes.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentState {
    /// Build the initial state for an agent, optionally seeding the task
    /// description as a user message.
    #[must_use]
    pub fn initial(agent: impl Into<String>, task: Option<&str>) -> Self {
        let messages = match task {
            Some(task) if !task.is_empty() => vec![Message::user(task)],
            _ => Vec::new(),
        };
        Self {
            messages,
            next_action: None,
            current_agent: agent.into(),
            routing_key: None,
            metadata: Map::new(),
        }
    }

    /// Number of messages in the history.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Content of the most recent assistant message, if any.
    #[must_use]
    pub fn last_assistant_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_assistant())
            .map(|m| m.content.as_str())
    }

    /// The most recent message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

/// A field-wise state update.
///
/// Keys name `AgentState` fields; values are the JSON update for that field.
/// How a value lands is decided by the registry: merged when a reducer is
/// registered for the key, replaced otherwise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta(pub Map<String, Value>);

impl StateDelta {
    /// An empty delta. Applying it is the identity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the delta carries no updates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append messages to the history.
    #[must_use]
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        let rendered = serde_json::to_value(messages).unwrap_or(Value::Array(Vec::new()));
        self.0.insert("messages".to_string(), rendered);
        self
    }

    /// Append a single message to the history.
    #[must_use]
    pub fn message(self, message: Message) -> Self {
        self.messages(vec![message])
    }

    /// Replace the next-action hint.
    #[must_use]
    pub fn next_action(mut self, next_action: Option<&str>) -> Self {
        self.0.insert(
            "next_action".to_string(),
            next_action.map_or(Value::Null, |v| Value::String(v.to_string())),
        );
        self
    }

    /// Replace the current agent name.
    #[must_use]
    pub fn current_agent(mut self, agent: &str) -> Self {
        self.0.insert(
            "current_agent".to_string(),
            Value::String(agent.to_string()),
        );
        self
    }

    /// Replace the routing key.
    #[must_use]
    pub fn routing_key(mut self, key: Option<&str>) -> Self {
        self.0.insert(
            "routing_key".to_string(),
            key.map_or(Value::Null, |v| Value::String(v.to_string())),
        );
        self
    }

    /// Replace the metadata map.
    #[must_use]
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.0
            .insert("metadata".to_string(), Value::Object(metadata));
        self
    }

    /// Insert a raw field update.
    #[must_use]
    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.0.insert(field.into(), value);
        self
    }
}

type MergeFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// Registry mapping field names to binary merge functions.
///
/// The default registry registers the append reducer for `messages`; every
/// unregistered field is replace-on-update.
#[derive(Clone)]
pub struct ReducerRegistry {
    mergers: HashMap<String, MergeFn>,
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        let mut registry = Self {
            mergers: HashMap::new(),
        };
        registry.register("messages", reducer::append_messages);
        registry
    }
}

impl ReducerRegistry {
    /// Register a merger for a field, replacing any existing one.
    pub fn register(
        &mut self,
        field: impl Into<String>,
        merger: impl Fn(Value, Value) -> Value + Send + Sync + 'static,
    ) {
        self.mergers.insert(field.into(), Arc::new(merger));
    }

    /// Whether a merger is registered for `field`.
    #[must_use]
    pub fn has_merger(&self, field: &str) -> bool {
        self.mergers.contains_key(field)
    }

    /// Apply a delta to a state, producing a new state.
    ///
    /// For each key in the delta: when a merger is registered it is applied
    /// to `(old value, new value)`; otherwise the new value replaces the old.
    /// The input state is untouched; the returned state is independently
    /// serializable.
    pub fn apply(&self, state: &AgentState, delta: &StateDelta) -> Result<AgentState> {
        if delta.is_empty() {
            return Ok(state.clone());
        }

        let mut fields = match serde_json::to_value(state)? {
            Value::Object(fields) => fields,
            other => {
                return Err(crate::error::Error::Internal(format!(
                    "state serialized to non-object JSON: {other}"
                )))
            }
        };

        for (field, update) in &delta.0 {
            let merged = match self.mergers.get(field) {
                Some(merger) => {
                    let old = fields.remove(field).unwrap_or(Value::Null);
                    merger(old, update.clone())
                }
                None => update.clone(),
            };
            fields.insert(field.clone(), merged);
        }

        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}

impl std::fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields: Vec<&str> = self.mergers.keys().map(String::as_str).collect();
        fields.sort_unstable();
        f.debug_struct("ReducerRegistry")
            .field("merged_fields", &fields)
            .finish()
    }
}
