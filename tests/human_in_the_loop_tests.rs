// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Human-in-the-loop scenarios: interrupt, checkpoint, feedback, resume.

use std::sync::Arc;
use std::time::Duration;

use dashagent::prelude::*;
use dashagent::{Checkpoint, CheckpointStore, ScriptedChatModel};

fn test_store() -> (tempfile::TempDir, Arc<DurableStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DurableStore::new(dir.path()).unwrap());
    (dir, store)
}

fn scripted_agent(name: &str, replies: Vec<ChatResponse>) -> Arc<Supervisor> {
    Arc::new(Supervisor::new(Agent::new(
        AgentDescriptor::new(name, format!("You are {name}.")),
        Arc::new(ScriptedChatModel::new().with_responses(replies)),
    )))
}

fn review_workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("plan-review-act", "plan")
        .with_node("plan", NodeDef::agent("planner"))
        .with_node("review", NodeDef::agent("reviewer").with_interrupt_before())
        .with_node("act", NodeDef::agent("actor"))
        .with_edge(EdgeDef::direct("plan", "review"))
        .with_edge(EdgeDef::direct("review", "act"))
        .with_edge(EdgeDef::direct("act", END))
}

async fn checkpoints_for(store: &Arc<DurableStore>, task_id: &str) -> Vec<Checkpoint> {
    CheckpointStore::open(Arc::clone(store), task_id)
        .await
        .unwrap()
        .list()
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Scenario 5: workflow with interrupt, end to end through the orchestrator
// ---------------------------------------------------------------------------

#[tokio::test]
async fn workflow_interrupts_then_resumes_with_feedback() {
    let (_dir, store) = test_store();
    let orchestrator = Orchestrator::start(
        Arc::clone(&store),
        OrchestratorConfig {
            max_concurrent: 4,
            result_timeout: Duration::from_secs(30),
        },
    );

    orchestrator
        .register_workflow(WorkflowSpec {
            definition: review_workflow(),
            agents: vec![
                scripted_agent("planner", vec![ChatResponse::text("the plan")]),
                scripted_agent("reviewer", vec![ChatResponse::text("reviewed")]),
                scripted_agent("actor", vec![ChatResponse::text("acted")]),
            ],
            manager: None,
        })
        .unwrap();

    let task_id = orchestrator
        .submit("draft and execute", "plan-review-act")
        .await
        .unwrap();

    // Wait for the interrupt: exactly one checkpoint appears, at `review`,
    // awaiting human input.
    let checkpoint = {
        let mut found = None;
        for _ in 0..100 {
            let checkpoints = checkpoints_for(&store, &task_id).await;
            if let Some(checkpoint) = checkpoints.first() {
                found = Some(checkpoint.clone());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        found.expect("no checkpoint appeared")
    };
    assert_eq!(checkpoint.position, "review");
    assert!(checkpoint.awaiting_human);
    assert_eq!(checkpoint.sequence, 1);

    // Wait for the slot to be released: the task goes back to pending.
    for _ in 0..100 {
        if orchestrator.get_task(&task_id).await.unwrap().status == TaskStatus::Pending {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // No execution step was recorded for `act` before the resume.
    let trace: dashagent::TraceLog = store
        .read_json(&format!("tasks/{task_id}/trace.json"))
        .await
        .unwrap();
    assert!(!trace
        .steps
        .iter()
        .any(|s| s.step_name == "node" && s.message.contains("'act'")));

    // Resume with approval.
    orchestrator
        .resume(&task_id, None, Some(HumanFeedback::new("approve")))
        .await
        .unwrap();
    let task = orchestrator
        .get_task_result(&task_id, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some("acted"));

    // `act` executed after the resume, and the feedback note is in state.
    let trace: dashagent::TraceLog = store
        .read_json(&format!("tasks/{task_id}/trace.json"))
        .await
        .unwrap();
    assert!(trace
        .steps
        .iter()
        .any(|s| s.step_name == "node" && s.message.contains("'act'")));

    let state: AgentState = store
        .read_json(&format!("tasks/{task_id}/state.json"))
        .await
        .unwrap();
    assert!(state
        .messages
        .iter()
        .any(|m| m.content == "Human feedback: approve"));
}

// ---------------------------------------------------------------------------
// Checkpoint sequence law: strictly increasing, gap-free
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_interrupts_produce_contiguous_sequences() {
    let (_dir, store) = test_store();
    let ctx = TaskContext::new("hitl-seq", Arc::clone(&store));

    // Both review nodes interrupt; two checkpoints accumulate.
    let workflow = WorkflowDefinition::new("double-review", "draft")
        .with_node("draft", NodeDef::agent("writer"))
        .with_node("review1", NodeDef::agent("writer").with_interrupt_before())
        .with_node("review2", NodeDef::agent("writer").with_interrupt_before())
        .with_edge(EdgeDef::direct("draft", "review1"))
        .with_edge(EdgeDef::direct("review1", "review2"))
        .with_edge(EdgeDef::direct("review2", END));

    let checkpoints = CheckpointStore::open(Arc::clone(&store), "hitl-seq")
        .await
        .unwrap();
    let engine = WorkflowEngine::new(workflow, checkpoints)
        .unwrap()
        .with_shared_agent(scripted_agent(
            "writer",
            vec![
                ChatResponse::text("draft done"),
                ChatResponse::text("first review"),
                ChatResponse::text("second review"),
            ],
        ));

    let outcome = engine
        .run(AgentState::initial("writer", Some("write")), &ctx)
        .await
        .unwrap();
    let first = outcome.interrupted_at().unwrap().clone();
    assert_eq!(first.sequence, 1);

    let outcome = engine
        .resume(&first.id, Some(HumanFeedback::new("approve")), &ctx)
        .await
        .unwrap();
    let second = outcome.interrupted_at().unwrap().clone();
    assert_eq!(second.sequence, 2);

    let outcome = engine
        .resume(&second.id, Some(HumanFeedback::new("approve")), &ctx)
        .await
        .unwrap();
    assert!(outcome.completed_state().is_some());

    // Sequences form a contiguous 1..=n prefix, and snapshots are immutable:
    // the first checkpoint still holds its original state.
    let listed = checkpoints_for(&store, "hitl-seq").await;
    let sequences: Vec<u64> = listed.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(listed[0].id, first.id);
    assert_eq!(listed[0].state, first.state);
}

// ---------------------------------------------------------------------------
// Sub-agent isolation holds across interrupt and resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sub_agent_messages_never_reach_persisted_parent_state() {
    let (_dir, store) = test_store();
    let ctx = TaskContext::new("hitl-iso", Arc::clone(&store));

    let mut args = serde_json::Map::new();
    args.insert("task".to_string(), serde_json::json!("secret sub work"));
    let supervisor_model = Arc::new(ScriptedChatModel::new().with_responses([
        ChatResponse::with_tool_calls(
            "",
            vec![ToolCall::new("delegate_helper", args)],
        ),
        ChatResponse::text("synthesized"),
    ]));

    let supervisor = Supervisor::new(Agent::new(
        AgentDescriptor::new("lead", "Coordinate."),
        supervisor_model,
    ))
    .with_sub_agent(Supervisor::new(Agent::new(
        AgentDescriptor::new("helper", "Help."),
        Arc::new(
            ScriptedChatModel::new()
                .with_response(ChatResponse::text("private sub-agent findings")),
        ),
    )));

    let result = supervisor.run(Some("solve"), None, &ctx).await.unwrap();
    assert_eq!(result.output, "synthesized");

    // The persisted parent state contains the summary, but none of the
    // sub-agent's own conversation (its task seed message in particular).
    let persisted: AgentState = store.read_json("tasks/hitl-iso/state.json").await.unwrap();
    assert!(persisted
        .messages
        .iter()
        .any(|m| m.content == "private sub-agent findings"));
    assert!(!persisted
        .messages
        .iter()
        .any(|m| m.role == Role::User && m.content == "secret sub work"));
}
