// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The orchestrator: bounded concurrency, FIFO admission, task lifecycle.
//!
//! Submissions enqueue immediately and return a task id; a single background
//! dispatcher admits the head of the FIFO whenever the semaphore has
//! capacity, so the set of running tasks never exceeds the configured cap
//! and admission order is submission order. Every status transition is
//! persisted before it is acknowledged. Cancellation drops pending tasks
//! from the queue and fires the cancellation token of running ones; the
//! token propagates down through the agent loop, the tool manager, and the
//! transports.
//!
//! A workflow that interrupts for human review releases its slot and the
//! task returns to `pending`; [`Orchestrator::resume`] re-enqueues it
//! through the same gate.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointStore, HumanFeedback};
use crate::constants::{DEFAULT_MAX_CONCURRENT, DEFAULT_RESULT_TIMEOUT};
use crate::error::{Error, Result};
use crate::state::AgentState;
use crate::store::DurableStore;
use crate::supervisor::Supervisor;
use crate::task::{Task, TaskContext, TaskStatus};
use crate::tools::manager::ToolManager;
use crate::trace::Tracer;
use crate::workflow::engine::{WorkflowEngine, WorkflowOutcome};
use crate::workflow::WorkflowDefinition;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Concurrency cap on running tasks.
    pub max_concurrent: usize,
    /// Default deadline for [`Orchestrator::get_task_result`].
    pub result_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            result_timeout: DEFAULT_RESULT_TIMEOUT,
        }
    }
}

/// A workflow runner registration: the definition plus its agent bindings.
pub struct WorkflowSpec {
    /// The validated definition.
    pub definition: WorkflowDefinition,
    /// Agents referenced by the definition's agent nodes.
    pub agents: Vec<Arc<Supervisor>>,
    /// Tool manager for tool nodes.
    pub manager: Option<Arc<ToolManager>>,
}

enum RunnerSpec {
    Agent(Arc<Supervisor>),
    Workflow(Arc<WorkflowSpec>),
}

enum QueueEntry {
    Fresh(String),
    Resume {
        task_id: String,
        checkpoint_id: Option<String>,
        feedback: Option<HumanFeedback>,
    },
}

impl QueueEntry {
    fn task_id(&self) -> &str {
        match self {
            QueueEntry::Fresh(id) | QueueEntry::Resume { task_id: id, .. } => id,
        }
    }
}

struct TaskHandle {
    watch_tx: watch::Sender<Task>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<QueueEntry>,
    tasks: HashMap<String, TaskHandle>,
    runners: HashMap<String, RunnerSpec>,
}

/// Bounded-concurrency task orchestrator.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<DurableStore>,
    inner: Mutex<Inner>,
    semaphore: Arc<Semaphore>,
    queued: Notify,
    shutdown: CancellationToken,
    running: AtomicUsize,
}

impl Orchestrator {
    /// Create the orchestrator and start its dispatcher.
    #[must_use]
    pub fn start(store: Arc<DurableStore>, config: OrchestratorConfig) -> Arc<Self> {
        let orchestrator = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            store,
            inner: Mutex::new(Inner::default()),
            queued: Notify::new(),
            shutdown: CancellationToken::new(),
            running: AtomicUsize::new(0),
        });
        let dispatcher = Arc::clone(&orchestrator);
        tokio::spawn(async move { dispatcher.dispatch_loop().await });
        orchestrator
    }

    /// Register an agent (or supervisor) runner under its agent name.
    pub fn register_agent(&self, agent: Supervisor) {
        self.register_shared_agent(Arc::new(agent));
    }

    /// Register a shared agent runner.
    pub fn register_shared_agent(&self, agent: Arc<Supervisor>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .runners
            .insert(agent.name().to_string(), RunnerSpec::Agent(agent));
    }

    /// Register a workflow runner under its workflow name.
    ///
    /// The definition is validated here so a bad workflow fails at
    /// registration, not at first submission.
    pub fn register_workflow(&self, spec: WorkflowSpec) -> Result<()> {
        spec.definition.validate()?;
        let name = spec.definition.name.clone();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .runners
            .insert(name, RunnerSpec::Workflow(Arc::new(spec)));
        Ok(())
    }

    /// Submit a task. Returns the task id immediately; the task is admitted
    /// by the dispatcher in FIFO order when capacity allows.
    pub async fn submit(
        &self,
        description: impl Into<String>,
        runner_name: &str,
    ) -> Result<String> {
        let task = Task::new(description, runner_name);
        let task_id = task.id.clone();

        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if !inner.runners.contains_key(runner_name) {
                return Err(Error::AgentNotFound(runner_name.to_string()));
            }
        }

        self.persist(&task).await?;

        {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let (watch_tx, _) = watch::channel(task);
            inner.tasks.insert(
                task_id.clone(),
                TaskHandle {
                    watch_tx,
                    cancel: CancellationToken::new(),
                },
            );
            inner.queue.push_back(QueueEntry::Fresh(task_id.clone()));
        }
        self.queued.notify_one();
        tracing::info!(task_id = %task_id, runner = runner_name, "task submitted");
        Ok(task_id)
    }

    /// Re-enqueue an interrupted workflow task, resuming from the given
    /// checkpoint (or the latest one) with optional human feedback.
    pub async fn resume(
        &self,
        task_id: &str,
        checkpoint_id: Option<&str>,
        feedback: Option<HumanFeedback>,
    ) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let handle = inner
                .tasks
                .get(task_id)
                .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
            let task = handle.watch_tx.borrow().clone();
            if task.status.is_terminal() {
                return Err(Error::Internal(format!(
                    "task '{task_id}' is already {:?}",
                    task.status
                )));
            }
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.queue.push_back(QueueEntry::Resume {
            task_id: task_id.to_string(),
            checkpoint_id: checkpoint_id.map(str::to_string),
            feedback,
        });
        drop(inner);
        self.queued.notify_one();
        Ok(())
    }

    /// The current task record, from memory or the durable store.
    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        let from_memory = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .tasks
                .get(task_id)
                .map(|handle| handle.watch_tx.borrow().clone())
        };
        match from_memory {
            Some(task) => Ok(task),
            None => self
                .store
                .read_json(&DurableStore::task_key(task_id, "task.json"))
                .await
                .map_err(|_| Error::TaskNotFound(task_id.to_string())),
        }
    }

    /// All known tasks, newest first, from the durable store.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for task_id in self.store.list_dir("tasks").await? {
            let key = DurableStore::task_key(&task_id, "task.json");
            match self.store.read_json::<Task>(&key).await {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "unreadable task record");
                }
            }
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    /// Block until the task reaches a terminal status, up to `timeout`.
    pub async fn get_task_result(&self, task_id: &str, timeout: Option<Duration>) -> Result<Task> {
        let timeout = timeout.unwrap_or(self.config.result_timeout);

        let rx = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .tasks
                .get(task_id)
                .map(|handle| handle.watch_tx.subscribe())
        };

        match rx {
            Some(mut rx) => {
                let waited =
                    tokio::time::timeout(timeout, rx.wait_for(|t| t.status.is_terminal())).await;
                match waited {
                    Ok(Ok(task)) => Ok(task.clone()),
                    Ok(Err(_)) => self.get_task(task_id).await,
                    Err(_) => Err(Error::ResultTimeout {
                        task_id: task_id.to_string(),
                        timeout,
                    }),
                }
            }
            // Not in memory: the task may have finished in a prior run.
            None => {
                let task = self.get_task(task_id).await?;
                if task.status.is_terminal() {
                    Ok(task)
                } else {
                    Err(Error::TaskNotFound(task_id.to_string()))
                }
            }
        }
    }

    /// Cancel a task. Pending tasks are dropped from the queue and marked
    /// failed; running tasks receive the cancellation signal. Terminal, in
    /// either case.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let (was_pending, task_after) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let handle = inner
                .tasks
                .get(task_id)
                .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
            let task = handle.watch_tx.borrow().clone();

            if task.status == TaskStatus::Pending {
                inner.queue.retain(|entry| entry.task_id() != task_id);
                let handle = &inner.tasks[task_id];
                let mut task = handle.watch_tx.borrow().clone();
                task.mark_failed(Error::Cancelled.record().with_task(task_id));
                handle.watch_tx.send_replace(task.clone());
                (true, Some(task))
            } else {
                handle.cancel.cancel();
                (false, None)
            }
        };

        if let Some(task) = task_after {
            self.persist(&task).await?;
        }
        tracing::info!(task_id, was_pending, "task cancelled");
        Ok(())
    }

    /// Number of currently running tasks.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of queued (pending, unadmitted) entries.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }

    /// Stop admitting work and cancel the dispatcher.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Remove task directories whose retention window has passed.
    pub async fn cleanup_by_age(&self) -> Result<usize> {
        let now = crate::ids::now();
        let mut removed = 0;
        for task_id in self.store.list_dir("tasks").await? {
            let key = DurableStore::task_key(&task_id, "task.json");
            let Ok(task) = self.store.read_json::<Task>(&key).await else {
                continue;
            };
            let Some(completed_at) = task.completed_at else {
                continue;
            };
            let age = now - completed_at;
            if age > chrono::Duration::days(i64::from(task.retention_days)) {
                self.store.remove_dir(&format!("tasks/{task_id}")).await?;
                self.inner
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .tasks
                    .remove(&task_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn persist(&self, task: &Task) -> Result<()> {
        self.store
            .write_json(&DurableStore::task_key(&task.id, "task.json"), task)
            .await
    }

    /// The dispatcher: pop the FIFO head, wait for capacity, run.
    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            // Wait for a queue entry.
            let entry = loop {
                if self.shutdown.is_cancelled() {
                    return;
                }
                let popped = {
                    let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                    inner.queue.pop_front()
                };
                match popped {
                    Some(entry) => break entry,
                    None => {
                        tokio::select! {
                            () = self.shutdown.cancelled() => return,
                            () = self.queued.notified() => {}
                        }
                    }
                }
            };

            // Wait for capacity before admission so the cap holds.
            let permit = tokio::select! {
                () = self.shutdown.cancelled() => return,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            // Admission happens here, in submission order: a task cancelled
            // while queued is already terminal and is skipped.
            let admitted = {
                let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.tasks.get(entry.task_id()).and_then(|handle| {
                    let mut task = handle.watch_tx.borrow().clone();
                    if task.status.is_terminal() {
                        return None;
                    }
                    task.mark_running();
                    handle.watch_tx.send_replace(task.clone());
                    Some(task)
                })
            };
            let Some(task) = admitted else {
                drop(permit);
                continue;
            };
            if let Err(e) = self.persist(&task).await {
                tracing::error!(task_id = %task.id, error = %e, "failed to persist admission");
            }
            tracing::info!(task_id = %task.id, "task admitted");

            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.running.fetch_add(1, Ordering::SeqCst);
                this.run_admitted(entry).await;
                this.running.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }
    }

    /// Run one admitted queue entry to its next yield point.
    async fn run_admitted(&self, entry: QueueEntry) {
        let task_id = entry.task_id().to_string();

        let (cancel, mut task) = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let Some(handle) = inner.tasks.get(&task_id) else {
                return;
            };
            let watch_val = handle.watch_tx.borrow().clone();
            (handle.cancel.clone(), watch_val)
        };

        let ctx = TaskContext {
            task_id: task_id.clone(),
            store: Arc::clone(&self.store),
            tracer: Arc::new(
                Tracer::load_or_new(Arc::clone(&self.store), task_id.clone()).await,
            ),
            cancel: cancel.clone(),
        };

        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            outcome = self.run_entry(&entry, &task, &ctx) => outcome,
        };

        match outcome {
            Ok(RunOutcome::Finished(output)) => {
                task.mark_completed(output);
                if let Err(e) = self.persist(&task).await {
                    tracing::error!(task_id = %task_id, error = %e, "failed to persist result");
                }
                self.update(&task);
            }
            Ok(RunOutcome::AwaitingHuman { checkpoint_id, position }) => {
                // Back to pending; resume() re-enqueues through the gate.
                task.status = TaskStatus::Pending;
                if let Err(e) = self.persist(&task).await {
                    tracing::error!(task_id = %task_id, error = %e, "failed to persist pause");
                }
                self.update(&task);
                tracing::info!(
                    task_id = %task_id,
                    checkpoint_id = %checkpoint_id,
                    position = %position,
                    "task awaiting human input"
                );
            }
            Err(e) => {
                self.finish_with_error(&task_id, e).await;
            }
        }
    }

    async fn run_entry(
        &self,
        entry: &QueueEntry,
        task: &Task,
        ctx: &TaskContext,
    ) -> Result<RunOutcome> {
        let runner = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.runners.get(&task.assigned_agent) {
                Some(RunnerSpec::Agent(agent)) => RunnerSpec::Agent(Arc::clone(agent)),
                Some(RunnerSpec::Workflow(spec)) => RunnerSpec::Workflow(Arc::clone(spec)),
                None => return Err(Error::AgentNotFound(task.assigned_agent.clone())),
            }
        };

        match runner {
            RunnerSpec::Agent(agent) => {
                let result = agent.run(Some(&task.description), None, ctx).await?;
                Ok(RunOutcome::Finished(result.output))
            }
            RunnerSpec::Workflow(spec) => {
                let checkpoints =
                    CheckpointStore::open(Arc::clone(&self.store), &task.id).await?;
                let mut engine = WorkflowEngine::new(spec.definition.clone(), checkpoints)?;
                for agent in &spec.agents {
                    engine = engine.with_shared_agent(Arc::clone(agent));
                }
                if let Some(manager) = &spec.manager {
                    engine = engine.with_tool_manager(Arc::clone(manager));
                }

                let outcome = match entry {
                    QueueEntry::Fresh(_) => {
                        let initial = AgentState::initial(
                            spec.definition.name.clone(),
                            Some(&task.description),
                        );
                        engine.run(initial, ctx).await?
                    }
                    QueueEntry::Resume {
                        checkpoint_id,
                        feedback,
                        ..
                    } => {
                        let checkpoint_id = match checkpoint_id {
                            Some(id) => id.clone(),
                            None => engine
                                .checkpoints()
                                .latest()
                                .await?
                                .ok_or_else(|| Error::CheckpointNotFound("latest".to_string()))?
                                .id,
                        };
                        engine
                            .resume(&checkpoint_id, feedback.clone(), ctx)
                            .await?
                    }
                };

                match outcome {
                    WorkflowOutcome::Completed(state) => Ok(RunOutcome::Finished(
                        state.last_assistant_content().unwrap_or_default().to_string(),
                    )),
                    WorkflowOutcome::Interrupted(checkpoint) => Ok(RunOutcome::AwaitingHuman {
                        checkpoint_id: checkpoint.id,
                        position: checkpoint.position,
                    }),
                }
            }
        }
    }

    async fn finish_with_error(&self, task_id: &str, error: Error) {
        let task = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.tasks.get(task_id).map(|handle| {
                let mut task = handle.watch_tx.borrow().clone();
                task.mark_failed(error.record().with_task(task_id));
                handle.watch_tx.send_replace(task.clone());
                task
            })
        };
        if let Some(task) = task {
            if let Err(e) = self.persist(&task).await {
                tracing::error!(task_id, error = %e, "failed to persist failure");
            }
        }
        tracing::warn!(task_id, error = %error, "task failed");
    }

    fn update(&self, task: &Task) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = inner.tasks.get(&task.id) {
            handle.watch_tx.send_replace(task.clone());
        }
    }
}

enum RunOutcome {
    Finished(String),
    AwaitingHuman {
        checkpoint_id: String,
        position: String,
    },
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("max_concurrent", &self.config.max_concurrent)
            .field("running", &self.running_count())
            .field("queued", &self.queued_count())
            .finish_non_exhaustive()
    }
}
