// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Checkpoints: immutable, numbered snapshots of workflow state.
//!
//! A checkpoint captures the complete state, the current node, and a
//! per-task sequence number that is strictly increasing with no gaps.
//! Checkpoints are never modified; resuming appends new ones. A checkpoint
//! that exists but cannot be decoded is a distinct, fatal error for the
//! owning task; execution never silently continues past corruption.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids;
use crate::messages::Message;
use crate::state::{AgentState, ReducerRegistry, StateDelta};
use crate::store::DurableStore;

/// An immutable snapshot of workflow state at a node boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id (UUIDv4).
    pub id: String,
    /// Owning task.
    pub task_id: String,
    /// Complete state snapshot.
    pub state: AgentState,
    /// The node about to execute (or awaiting input).
    pub position: String,
    /// Strictly increasing, gap-free sequence number (1-based).
    pub sequence: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Whether the checkpoint is waiting on human input.
    pub awaiting_human: bool,
}

impl Checkpoint {
    /// Whether a human-review checkpoint has outlived its deadline.
    #[must_use]
    pub fn is_expired(&self, deadline: Duration, now: DateTime<Utc>) -> bool {
        let Ok(deadline) = chrono::Duration::from_std(deadline) else {
            return false;
        };
        self.awaiting_human && now - self.created_at > deadline
    }
}

/// Human feedback applied when resuming from a checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HumanFeedback {
    /// Feedback action, e.g. `approve`, `reject`, `modify`.
    pub action: String,
    /// Optional free-text message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Manual state updates, applied through the reducer registry.
    #[serde(default)]
    pub state_updates: StateDelta,
}

impl HumanFeedback {
    /// Feedback with just an action.
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            message: None,
            state_updates: StateDelta::new(),
        }
    }

    /// Attach a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach manual state updates.
    #[must_use]
    pub fn with_state_updates(mut self, updates: StateDelta) -> Self {
        self.state_updates = updates;
        self
    }

    /// Apply this feedback to a state through the registry.
    ///
    /// The manual updates land first, then the feedback itself is appended
    /// as a system message so the model sees the decision.
    pub fn apply(&self, registry: &ReducerRegistry, state: &AgentState) -> Result<AgentState> {
        let state = registry.apply(state, &self.state_updates)?;
        let note = match &self.message {
            Some(message) => format!("Human feedback: {} - {message}", self.action),
            None => format!("Human feedback: {}", self.action),
        };
        registry.apply(&state, &StateDelta::new().message(Message::system(note)))
    }
}

/// Per-task checkpoint persistence.
///
/// Files are named `checkpoint_<NNN>.json` under the task directory, where
/// `NNN` is the zero-padded sequence number.
pub struct CheckpointStore {
    store: Arc<DurableStore>,
    task_id: String,
    next_sequence: tokio::sync::Mutex<u64>,
}

impl CheckpointStore {
    /// Open the checkpoint store for a task, resuming the sequence counter
    /// from any checkpoints already on disk.
    pub async fn open(store: Arc<DurableStore>, task_id: impl Into<String>) -> Result<Self> {
        let task_id = task_id.into();
        let names = store.list_dir(&format!("tasks/{task_id}")).await?;
        let max_sequence = names
            .iter()
            .filter_map(|name| parse_sequence(name))
            .max()
            .unwrap_or(0);
        Ok(Self {
            store,
            task_id,
            next_sequence: tokio::sync::Mutex::new(max_sequence + 1),
        })
    }

    /// The owning task id.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn key_for(&self, sequence: u64) -> String {
        DurableStore::task_key(&self.task_id, &format!("checkpoint_{sequence:03}.json"))
    }

    /// Append a new checkpoint.
    pub async fn save(
        &self,
        state: &AgentState,
        position: &str,
        awaiting_human: bool,
    ) -> Result<Checkpoint> {
        let mut next = self.next_sequence.lock().await;
        let checkpoint = Checkpoint {
            id: ids::new_id(),
            task_id: self.task_id.clone(),
            state: state.clone(),
            position: position.to_string(),
            sequence: *next,
            created_at: ids::now(),
            awaiting_human,
        };
        self.store
            .write_json(&self.key_for(*next), &checkpoint)
            .await?;
        *next += 1;
        tracing::info!(
            task_id = %self.task_id,
            position,
            sequence = checkpoint.sequence,
            awaiting_human,
            "checkpoint saved"
        );
        Ok(checkpoint)
    }

    /// All checkpoints in sequence order.
    ///
    /// A file that exists but does not decode fails the whole listing with a
    /// corruption error.
    pub async fn list(&self) -> Result<Vec<Checkpoint>> {
        let names = self.store.list_dir(&format!("tasks/{}", self.task_id)).await?;
        let mut sequences: Vec<u64> = names
            .iter()
            .filter_map(|name| parse_sequence(name))
            .collect();
        sequences.sort_unstable();

        let mut checkpoints = Vec::with_capacity(sequences.len());
        for sequence in sequences {
            let key = self.key_for(sequence);
            let bytes = self.store.read(&key).await?;
            let checkpoint: Checkpoint =
                serde_json::from_slice(&bytes).map_err(|e| Error::CheckpointCorrupted {
                    checkpoint_id: format!("checkpoint_{sequence:03}"),
                    task_id: self.task_id.clone(),
                    reason: e.to_string(),
                })?;
            checkpoints.push(checkpoint);
        }
        Ok(checkpoints)
    }

    /// Load a checkpoint by id.
    pub async fn load(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.list()
            .await?
            .into_iter()
            .find(|c| c.id == checkpoint_id)
            .ok_or_else(|| Error::CheckpointNotFound(checkpoint_id.to_string()))
    }

    /// The most recent checkpoint, if any.
    pub async fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.list().await?.into_iter().next_back())
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("task_id", &self.task_id)
            .finish_non_exhaustive()
    }
}

fn parse_sequence(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("checkpoint_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store() -> (tempfile::TempDir, Arc<DurableStore>, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::new(dir.path()).unwrap());
        let checkpoints = CheckpointStore::open(Arc::clone(&store), "task-cp")
            .await
            .unwrap();
        (dir, store, checkpoints)
    }

    #[tokio::test]
    async fn sequences_are_contiguous_from_one() {
        let (_dir, _store, checkpoints) = open_store().await;
        let state = AgentState::initial("a", Some("t"));
        for expected in 1..=3u64 {
            let cp = checkpoints.save(&state, "review", false).await.unwrap();
            assert_eq!(cp.sequence, expected);
        }
        let listed = checkpoints.list().await.unwrap();
        let sequences: Vec<u64> = listed.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sequence_resumes_after_reopen() {
        let (_dir, store, checkpoints) = open_store().await;
        let state = AgentState::initial("a", Some("t"));
        checkpoints.save(&state, "n1", false).await.unwrap();
        checkpoints.save(&state, "n2", false).await.unwrap();
        drop(checkpoints);

        let reopened = CheckpointStore::open(store, "task-cp").await.unwrap();
        let cp = reopened.save(&state, "n3", false).await.unwrap();
        assert_eq!(cp.sequence, 3);
    }

    #[tokio::test]
    async fn files_use_zero_padded_names() {
        let (_dir, store, checkpoints) = open_store().await;
        let state = AgentState::initial("a", None);
        checkpoints.save(&state, "n", false).await.unwrap();
        assert!(store.exists("tasks/task-cp/checkpoint_001.json").await);
    }

    #[tokio::test]
    async fn load_round_trips() {
        let (_dir, _store, checkpoints) = open_store().await;
        let state = AgentState::initial("a", Some("t"));
        let saved = checkpoints.save(&state, "review", true).await.unwrap();
        let loaded = checkpoints.load(&saved.id).await.unwrap();
        assert_eq!(saved, loaded);
        assert!(loaded.awaiting_human);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_not_found() {
        let (_dir, _store, checkpoints) = open_store().await;
        let err = checkpoints.load("nope").await.unwrap_err();
        assert!(matches!(err, Error::CheckpointNotFound(_)));
    }

    #[tokio::test]
    async fn corruption_is_surfaced_not_skipped() {
        let (_dir, store, checkpoints) = open_store().await;
        let state = AgentState::initial("a", None);
        checkpoints.save(&state, "n", false).await.unwrap();
        store
            .write("tasks/task-cp/checkpoint_002.json", b"{ not json")
            .await
            .unwrap();

        let err = checkpoints.list().await.unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
    }

    #[tokio::test]
    async fn latest_returns_highest_sequence() {
        let (_dir, _store, checkpoints) = open_store().await;
        let state = AgentState::initial("a", None);
        checkpoints.save(&state, "first", false).await.unwrap();
        let last = checkpoints.save(&state, "second", false).await.unwrap();
        let latest = checkpoints.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, last.id);
    }

    #[test]
    fn expiry_only_applies_to_awaiting_human() {
        let state = AgentState::initial("a", None);
        let mut cp = Checkpoint {
            id: ids::new_id(),
            task_id: "t".to_string(),
            state,
            position: "review".to_string(),
            sequence: 1,
            created_at: ids::now() - chrono::Duration::hours(48),
            awaiting_human: false,
        };
        let day = Duration::from_secs(86_400);
        assert!(!cp.is_expired(day, ids::now()));
        cp.awaiting_human = true;
        assert!(cp.is_expired(day, ids::now()));
    }

    #[test]
    fn feedback_appends_system_note() {
        let registry = ReducerRegistry::default();
        let state = AgentState::initial("a", Some("t"));
        let feedback = HumanFeedback::new("approve").with_message("ship it");
        let next = feedback.apply(&registry, &state).unwrap();
        assert_eq!(next.message_count(), 2);
        let note = &next.messages[1];
        assert!(note.is_system());
        assert_eq!(note.content, "Human feedback: approve - ship it");
    }

    #[test]
    fn feedback_state_updates_go_through_registry() {
        let registry = ReducerRegistry::default();
        let state = AgentState::initial("a", Some("t"));
        let feedback = HumanFeedback::new("modify")
            .with_state_updates(StateDelta::new().routing_key(Some("approve")));
        let next = feedback.apply(&registry, &state).unwrap();
        assert_eq!(next.routing_key.as_deref(), Some("approve"));
        // Original messages kept: prefix law.
        assert_eq!(next.messages[0].content, "t");
    }
}
