// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Dependency analysis and DAG-layered scheduling for task batches.
//!
//! The analyzer asks the chat model to extract, per task, the symbolic
//! artifacts it produces and consumes (free-form strings, normalized to
//! lowercase). An edge A -> B exists iff B consumes something A produces.
//! Cycles fail the batch with a distinct error. Tasks are grouped into
//! topological layers; the scheduler submits each layer to the orchestrator
//! in parallel and awaits it before releasing the next. A failed
//! predecessor marks its descendants skipped (not failed) with a reason
//! naming the predecessor.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorRecord, Result};
use crate::llm::ChatModel;
use crate::messages::Message;
use crate::orchestrator::Orchestrator;
use crate::task::TaskStatus;

/// One task in a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-chosen id, unique within the batch.
    pub id: String,
    /// Task description handed to the agent.
    pub description: String,
    /// Runner name for the orchestrator.
    pub agent: String,
}

impl TaskSpec {
    /// Create a batch task spec.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            agent: agent.into(),
        }
    }
}

/// Extracted produces/consumes sets for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDependency {
    /// The batch task id.
    pub task_id: String,
    /// Artifacts the task produces.
    pub produces: BTreeSet<String>,
    /// Artifacts the task consumes.
    pub consumes: BTreeSet<String>,
}

/// LLM-backed produces/consumes extraction.
pub struct DependencyAnalyzer {
    model: Arc<dyn ChatModel>,
}

impl DependencyAnalyzer {
    /// Create an analyzer over a chat model.
    #[must_use]
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Extract dependencies for each task in the batch.
    ///
    /// A reply that is not valid JSON degrades to empty sets for that task
    /// (logged): an unanalyzable task simply runs in the first layer.
    pub async fn analyze(&self, tasks: &[TaskSpec]) -> Result<Vec<TaskDependency>> {
        let mut dependencies = Vec::with_capacity(tasks.len());
        for task in tasks {
            let prompt = format!(
                "Extract the data artifacts this task produces and consumes.\n\
                 Task: {}\n\
                 Answer with JSON only, in the form \
                 {{\"produces\": [\"...\"], \"consumes\": [\"...\"]}}.",
                task.description
            );
            let messages = [Message::user(prompt)];
            let reply = self.model.chat(&messages, &[]).await?;
            let (produces, consumes) = parse_extraction(&reply.content).unwrap_or_else(|| {
                tracing::warn!(
                    task_id = %task.id,
                    "dependency extraction returned non-JSON, assuming no dependencies"
                );
                (BTreeSet::new(), BTreeSet::new())
            });
            dependencies.push(TaskDependency {
                task_id: task.id.clone(),
                produces,
                consumes,
            });
        }
        Ok(dependencies)
    }
}

impl std::fmt::Debug for DependencyAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyAnalyzer").finish_non_exhaustive()
    }
}

/// Pull the produces/consumes sets out of a model reply.
fn parse_extraction(content: &str) -> Option<(BTreeSet<String>, BTreeSet<String>)> {
    #[derive(Deserialize)]
    struct Extraction {
        #[serde(default)]
        produces: Vec<String>,
        #[serde(default)]
        consumes: Vec<String>,
    }

    // Tolerate prose around the JSON object.
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    let parsed: Extraction = serde_json::from_str(&content[start..=end]).ok()?;

    let normalize = |items: Vec<String>| {
        items
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    };
    Some((normalize(parsed.produces), normalize(parsed.consumes)))
}

/// The dependency DAG over a batch, held as flat tables plus index-based
/// adjacency.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    adjacency: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph: edge A -> B iff B's consumes intersects A's produces.
    #[must_use]
    pub fn build(dependencies: &[TaskDependency]) -> Self {
        let ids: Vec<String> = dependencies.iter().map(|d| d.task_id.clone()).collect();
        let mut adjacency = vec![Vec::new(); ids.len()];
        let mut predecessors = vec![Vec::new(); ids.len()];

        for (producer_idx, producer) in dependencies.iter().enumerate() {
            for (consumer_idx, consumer) in dependencies.iter().enumerate() {
                if producer_idx == consumer_idx {
                    continue;
                }
                if producer.produces.intersection(&consumer.consumes).next().is_some() {
                    adjacency[producer_idx].push(consumer_idx);
                    predecessors[consumer_idx].push(producer_idx);
                }
            }
        }

        Self {
            ids,
            adjacency,
            predecessors,
        }
    }

    /// Direct predecessors of a task.
    #[must_use]
    pub fn predecessors_of(&self, task_id: &str) -> Vec<&str> {
        let Some(index) = self.ids.iter().position(|id| id == task_id) else {
            return Vec::new();
        };
        self.predecessors[index]
            .iter()
            .map(|&p| self.ids[p].as_str())
            .collect()
    }

    /// Topological layers: every task in a layer has all predecessors in
    /// earlier layers. Fails with a cycle error naming the members left
    /// over when no progress can be made.
    pub fn layers(&self) -> Result<Vec<Vec<String>>> {
        let mut indegree: Vec<usize> = self.predecessors.iter().map(Vec::len).collect();
        let mut remaining: BTreeSet<usize> = (0..self.ids.len()).collect();
        let mut layers = Vec::new();

        while !remaining.is_empty() {
            let layer: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| indegree[i] == 0)
                .collect();
            if layer.is_empty() {
                let cycle: Vec<&str> = remaining.iter().map(|&i| self.ids[i].as_str()).collect();
                return Err(Error::CycleDetected {
                    path: cycle.join(" -> "),
                });
            }
            for &node in &layer {
                remaining.remove(&node);
                for &next in &self.adjacency[node] {
                    indegree[next] -= 1;
                }
            }
            layers.push(layer.into_iter().map(|i| self.ids[i].clone()).collect());
        }

        Ok(layers)
    }
}

/// Terminal outcome of one batch task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum BatchTaskOutcome {
    /// Ran to completion.
    Completed {
        /// The task's result payload.
        output: String,
    },
    /// Ran and failed.
    Failed {
        /// The task's structured error.
        error: ErrorRecord,
    },
    /// Never ran: a predecessor failed or was skipped.
    Skipped {
        /// The predecessor that blocked this task.
        because: String,
    },
}

/// Layer-parallel batch scheduler on top of the orchestrator.
pub struct DagScheduler {
    orchestrator: Arc<Orchestrator>,
    analyzer: DependencyAnalyzer,
}

impl DagScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, analyzer: DependencyAnalyzer) -> Self {
        Self {
            orchestrator,
            analyzer,
        }
    }

    /// Analyze, layer, and run a batch. The returned map has one entry per
    /// input task, keyed by the batch task id.
    pub async fn run_batch(
        &self,
        tasks: Vec<TaskSpec>,
    ) -> Result<BTreeMap<String, BatchTaskOutcome>> {
        let dependencies = self.analyzer.analyze(&tasks).await?;
        let graph = DependencyGraph::build(&dependencies);
        let layers = graph.layers()?;
        tracing::info!(
            tasks = tasks.len(),
            layers = layers.len(),
            "batch layered for execution"
        );

        let specs: HashMap<&str, &TaskSpec> =
            tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut outcomes: BTreeMap<String, BatchTaskOutcome> = BTreeMap::new();
        let mut blocked: HashMap<String, String> = HashMap::new();

        for layer in layers {
            // Partition the layer into runnable and skipped tasks.
            let mut submitted: Vec<(String, String)> = Vec::new();
            for task_id in layer {
                let bad_predecessor = graph
                    .predecessors_of(&task_id)
                    .into_iter()
                    .find(|p| blocked.contains_key(*p))
                    .map(str::to_string);
                if let Some(predecessor) = bad_predecessor {
                    // Point at the root failure, not the nearest skip.
                    let root = blocked[&predecessor].clone();
                    blocked.insert(task_id.clone(), root.clone());
                    outcomes.insert(task_id, BatchTaskOutcome::Skipped { because: root });
                    continue;
                }

                let spec = specs[task_id.as_str()];
                let orchestrator_id = self
                    .orchestrator
                    .submit(spec.description.clone(), &spec.agent)
                    .await?;
                submitted.push((task_id, orchestrator_id));
            }

            // Await the whole layer before releasing the next.
            let waits = submitted.iter().map(|(_, orchestrator_id)| {
                self.orchestrator.get_task_result(orchestrator_id, None)
            });
            let results = futures::future::join_all(waits).await;

            for ((task_id, _), result) in submitted.into_iter().zip(results) {
                match result {
                    Ok(task) if task.status == TaskStatus::Completed => {
                        outcomes.insert(
                            task_id,
                            BatchTaskOutcome::Completed {
                                output: task.result.unwrap_or_default(),
                            },
                        );
                    }
                    Ok(task) => {
                        let error = task.error.unwrap_or_else(|| {
                            Error::Internal("task failed without an error record".to_string())
                                .record()
                        });
                        blocked.insert(task_id.clone(), task_id.clone());
                        outcomes.insert(task_id, BatchTaskOutcome::Failed { error });
                    }
                    Err(e) => {
                        blocked.insert(task_id.clone(), task_id.clone());
                        outcomes.insert(
                            task_id,
                            BatchTaskOutcome::Failed { error: e.record() },
                        );
                    }
                }
            }
        }

        Ok(outcomes)
    }
}

impl std::fmt::Debug for DagScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DagScheduler").finish_non_exhaustive()
    }
}
