//! Dependency-aware task scheduling
//!
//! The block → unblock scenario, terminal-state conflicts, cycle rejection,
//! and the audit trail every transition leaves in the episodic log.

use engram_core::{
    ErrorKind, EventFilter, EventKind, Operation, Priority, ResultStatus, TaskInput, TaskStatus,
};
use engram_e2e_tests::TestKernel;

fn task(content: &str, deps: Vec<i64>) -> TaskInput {
    TaskInput {
        content: content.to_string(),
        priority: Priority::Medium,
        phase: None,
        parent_id: None,
        dependencies: deps,
        estimated_effort_min: None,
        deadline: None,
    }
}

#[tokio::test]
async fn dependency_blocks_until_completed() {
    let harness = TestKernel::new();
    let ctx = harness.context("tasks").await;
    let prospective = harness.kernel.prospective();

    let a = prospective.create_task(&ctx, task("A", vec![])).await.unwrap();
    let b = prospective
        .create_task(&ctx, task("B", vec![a.id]))
        .await
        .unwrap();

    let ready: Vec<i64> = prospective
        .ready_tasks(&ctx, None, 10)
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec![a.id]);

    // B cannot start while A is incomplete
    let err = prospective
        .transition(&ctx, b.id, TaskStatus::Running, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);

    prospective
        .transition(&ctx, a.id, TaskStatus::Running, None)
        .await
        .unwrap();
    prospective
        .transition(&ctx, a.id, TaskStatus::Completed, Some(15))
        .await
        .unwrap();

    let ready: Vec<i64> = prospective
        .ready_tasks(&ctx, None, 10)
        .await
        .unwrap()
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ready, vec![b.id]);
}

#[tokio::test]
async fn repeated_completion_is_a_conflict_not_corruption() {
    let harness = TestKernel::new();
    let ctx = harness.context("tasks").await;
    let prospective = harness.kernel.prospective();

    let t = prospective.create_task(&ctx, task("once", vec![])).await.unwrap();
    prospective
        .transition(&ctx, t.id, TaskStatus::Running, None)
        .await
        .unwrap();
    prospective
        .transition(&ctx, t.id, TaskStatus::Completed, None)
        .await
        .unwrap();

    let err = prospective
        .transition(&ctx, t.id, TaskStatus::Completed, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Conflict);

    let after = prospective.get_task(&ctx, t.id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
}

#[tokio::test]
async fn cycles_are_rejected_at_edit_time() {
    let harness = TestKernel::new();
    let ctx = harness.context("tasks").await;
    let prospective = harness.kernel.prospective();

    let a = prospective.create_task(&ctx, task("A", vec![])).await.unwrap();
    let b = prospective
        .create_task(&ctx, task("B", vec![a.id]))
        .await
        .unwrap();
    let c = prospective
        .create_task(&ctx, task("C", vec![b.id]))
        .await
        .unwrap();

    // a -> c would close a cycle through b
    let err = prospective.add_dependency(&ctx, a.id, c.id).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
}

#[tokio::test]
async fn transitions_leave_system_events() {
    let harness = TestKernel::new();
    let ctx = harness.context("tasks").await;

    let result = harness
        .kernel
        .dispatch(&ctx, Operation::CreateTask(task("audited", vec![])))
        .await;
    assert_eq!(result.status, ResultStatus::Ok);
    let task_id = result.data["id"].as_i64().unwrap();

    harness
        .kernel
        .dispatch(
            &ctx,
            Operation::TransitionTask {
                task_id,
                status: TaskStatus::Running,
                actual_effort_min: None,
            },
        )
        .await;

    let filter = EventFilter {
        kind: Some(EventKind::System),
        ..Default::default()
    };
    let page = harness
        .kernel
        .episodic()
        .recall_events(&ctx, &filter, 10, 0)
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert!(page.items[0].content.contains("pending -> running"));
}

#[tokio::test]
async fn critical_path_follows_heaviest_effort() {
    let harness = TestKernel::new();
    let ctx = harness.context("tasks").await;
    let prospective = harness.kernel.prospective();

    let quick = prospective
        .create_task(
            &ctx,
            TaskInput {
                estimated_effort_min: Some(5),
                ..task("quick leaf", vec![])
            },
        )
        .await
        .unwrap();
    let slow_mid = prospective
        .create_task(
            &ctx,
            TaskInput {
                estimated_effort_min: Some(60),
                ..task("slow middle", vec![quick.id])
            },
        )
        .await
        .unwrap();
    let goal = prospective
        .create_task(
            &ctx,
            TaskInput {
                estimated_effort_min: Some(10),
                ..task("goal", vec![slow_mid.id, quick.id])
            },
        )
        .await
        .unwrap();

    let result = harness
        .kernel
        .dispatch(&ctx, Operation::CriticalPath { goal_id: goal.id })
        .await;
    let path: Vec<i64> = result.data["path"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_i64().unwrap())
        .collect();
    assert_eq!(path, vec![goal.id, slow_mid.id, quick.id]);
}
