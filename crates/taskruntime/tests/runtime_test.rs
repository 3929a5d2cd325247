// crates/taskruntime/tests/runtime_test.rs

use async_trait::async_trait;
use std::sync::Arc;
use taskcore::{
    EngineError, ParameterSpec, Permission, RawAnswer, ResultMap, RunId, Status, TaskDefinition,
    TaskError, TaskEvent, Value, WorkItemId, WorkItemRegistry,
};
use tokio::sync::Notify;
use taskruntime::{
    PermissionTable, RuntimeConfig, RuntimeError, SessionRegistry, TaskRuntime, WorkItemOutcome,
};

struct Fixture {
    _dir: tempfile::TempDir,
    sessions: Arc<SessionRegistry>,
    runtime: TaskRuntime,
}

async fn fixture_with(access: PermissionTable) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionRegistry::new());
    let runtime = TaskRuntime::open(
        RuntimeConfig::new(dir.path()),
        sessions.clone(),
        Arc::new(access),
    )
    .await
    .unwrap();
    Fixture {
        _dir: dir,
        sessions,
        runtime,
    }
}

async fn fixture() -> Fixture {
    fixture_with(
        PermissionTable::new()
            .grant("release", "bob", Permission::Build)
            .grant("release", "bob", Permission::Read)
            .with_administrator("admin"),
    )
    .await
}

fn approval() -> TaskDefinition {
    TaskDefinition::new("Approve release").with_parameter(ParameterSpec::boolean("approved"))
}

fn task_error(err: RuntimeError) -> TaskError {
    match err {
        RuntimeError::Task(e) => e,
        other => panic!("expected a task error, got {other:?}"),
    }
}

#[tokio::test]
async fn assigned_actor_completes_and_engine_resumes() {
    let f = fixture().await;
    let run = f.runtime.create_run("release").await.unwrap();
    f.sessions.load_session(&run).await;
    let (id, waiter) = f.sessions.raise_work_item(&run).await.unwrap();
    f.runtime
        .open_human_task(&run, id, approval().with_actor("alice"))
        .await
        .unwrap();

    let completion = f
        .runtime
        .submit(id, &[RawAnswer::new("approved", true)], Some("alice"))
        .await
        .unwrap();
    assert_eq!(completion.status, Status::Completed);
    assert!(completion.persisted);

    match waiter.await.unwrap() {
        WorkItemOutcome::Completed(results) => {
            assert_eq!(results.len(), 1);
            assert_eq!(results.get("approved"), Some(&Value::Bool(true)));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let task = f.runtime.human_task(id).await.unwrap().snapshot().await;
    assert!(task.is_completed());

    let err = f
        .runtime
        .submit(id, &[RawAnswer::new("approved", false)], Some("alice"))
        .await
        .unwrap_err();
    assert!(matches!(
        task_error(err),
        TaskError::NotActive {
            status: Status::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn unknown_parameter_keeps_task_open() {
    let f = fixture().await;
    let run = f.runtime.create_run("release").await.unwrap();
    f.sessions.load_session(&run).await;
    let (id, _waiter) = f.sessions.raise_work_item(&run).await.unwrap();
    f.runtime.open_human_task(&run, id, approval()).await.unwrap();

    let err = f
        .runtime
        .submit(id, &[RawAnswer::new("approve", true)], Some("bob"))
        .await
        .unwrap_err();
    assert!(matches!(task_error(err), TaskError::UnknownParameter { .. }));
    assert!(f.runtime.human_task(id).await.unwrap().snapshot().await.is_new());
    assert_eq!(f.sessions.pending_count().await, 1);
}

#[tokio::test]
async fn unloaded_session_aborts_submit() {
    let f = fixture().await;
    let run = f.runtime.create_run("release").await.unwrap();
    f.sessions.load_session(&run).await;
    let (id, _waiter) = f.sessions.raise_work_item(&run).await.unwrap();
    f.runtime.open_human_task(&run, id, approval()).await.unwrap();
    f.sessions.unload_session(&run).await;

    let err = f
        .runtime
        .submit(id, &[RawAnswer::new("approved", true)], Some("bob"))
        .await
        .unwrap_err();
    assert!(matches!(
        task_error(err),
        TaskError::Engine(EngineError::Unavailable { .. })
    ));
    let task = f.runtime.human_task(id).await.unwrap().snapshot().await;
    assert!(task.is_new());
    assert!(task.answers().is_none());
}

#[tokio::test]
async fn user_without_build_permission_is_denied() {
    let f = fixture().await;
    let run = f.runtime.create_run("release").await.unwrap();
    f.sessions.load_session(&run).await;
    let (id, _waiter) = f.sessions.raise_work_item(&run).await.unwrap();
    f.runtime.open_human_task(&run, id, approval()).await.unwrap();

    let err = f
        .runtime
        .submit(id, &[RawAnswer::new("approved", true)], Some("mallory"))
        .await
        .unwrap_err();
    assert!(matches!(task_error(err), TaskError::PermissionDenied { .. }));
}

#[tokio::test]
async fn canceled_task_is_still_found_and_rejects_submit() {
    let f = fixture().await;
    let run = f.runtime.create_run("release").await.unwrap();
    f.sessions.load_session(&run).await;
    let (id, waiter) = f.sessions.raise_work_item(&run).await.unwrap();
    f.runtime.open_human_task(&run, id, approval()).await.unwrap();

    let completion = f.runtime.cancel(id, Some("admin")).await.unwrap();
    assert_eq!(completion.status, Status::Canceled);
    assert_eq!(waiter.await.unwrap(), WorkItemOutcome::Canceled);

    let found = f.runtime.human_task(id).await.unwrap().snapshot().await;
    assert!(found.is_canceled());

    let err = f
        .runtime
        .submit(id, &[RawAnswer::new("approved", true)], Some("bob"))
        .await
        .unwrap_err();
    assert!(matches!(
        task_error(err),
        TaskError::NotActive {
            status: Status::Canceled,
            ..
        }
    ));

    assert!(matches!(
        task_error(f.runtime.cancel(id, Some("admin")).await.unwrap_err()),
        TaskError::NotActive { .. }
    ));
}

#[tokio::test]
async fn cancel_requires_cancel_permission() {
    let f = fixture().await;
    let run = f.runtime.create_run("release").await.unwrap();
    f.sessions.load_session(&run).await;
    let (id, _waiter) = f.sessions.raise_work_item(&run).await.unwrap();
    f.runtime.open_human_task(&run, id, approval()).await.unwrap();

    let err = f.runtime.cancel(id, Some("bob")).await.unwrap_err();
    assert!(matches!(
        task_error(err),
        TaskError::PermissionDenied {
            permission: Permission::Cancel,
            ..
        }
    ));
}

#[tokio::test]
async fn engine_abort_cancels_task() {
    let f = fixture().await;
    let run = f.runtime.create_run("release").await.unwrap();
    f.runtime.open_human_task(&run, 7, approval()).await.unwrap();

    f.runtime.work_item_aborted(7).await.unwrap();
    assert!(f.runtime.human_task(7).await.unwrap().snapshot().await.is_canceled());
}

#[tokio::test]
async fn never_assigned_id_is_not_found() {
    let f = fixture().await;
    assert!(f.runtime.human_task(404).await.is_none());
    let err = f.runtime.submit(404, &[], Some("bob")).await.unwrap_err();
    assert_eq!(task_error(err), TaskError::NotFound(404));
}

#[tokio::test]
async fn duplicate_work_item_is_rejected() {
    let f = fixture().await;
    let first = f.runtime.create_run("release").await.unwrap();
    let second = f.runtime.create_run("release").await.unwrap();
    assert_eq!(second, RunId::new("release", 2));

    f.runtime.open_human_task(&first, 9, approval()).await.unwrap();
    let err = f
        .runtime
        .open_human_task(&second, 9, approval())
        .await
        .unwrap_err();
    assert_eq!(task_error(err), TaskError::DuplicateWorkItem(9));
    assert!(f.runtime.tasks_for_run(&second).await.unwrap().is_empty());
}

#[tokio::test]
async fn tasks_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let access = Arc::new(PermissionTable::new().grant("release", "bob", Permission::Build));
    let sessions = Arc::new(SessionRegistry::new());

    {
        let runtime = TaskRuntime::open(RuntimeConfig::new(dir.path()), sessions.clone(), access.clone())
            .await
            .unwrap();
        let run = runtime.create_run("release").await.unwrap();
        sessions.load_session(&run).await;
        let (id, _waiter) = sessions.raise_work_item(&run).await.unwrap();
        runtime.open_human_task(&run, id, approval()).await.unwrap();
        runtime
            .submit(id, &[RawAnswer::new("approved", "on")], Some("bob"))
            .await
            .unwrap();
    }

    let runtime = TaskRuntime::open(RuntimeConfig::new(dir.path()), sessions, access)
        .await
        .unwrap();
    assert_eq!(runtime.runs().await, vec![RunId::new("release", 1)]);
    let task = runtime.human_task(1).await.unwrap().snapshot().await;
    assert!(task.is_completed());
    assert_eq!(task.answers().unwrap()[0].name, "approved");
}

#[tokio::test]
async fn deleting_a_run_removes_its_tasks() {
    let f = fixture().await;
    let run = f.runtime.create_run("release").await.unwrap();
    f.runtime.open_human_task(&run, 3, approval()).await.unwrap();

    assert_eq!(f.runtime.delete_run(&run).await.unwrap(), 1);
    assert!(f.runtime.human_task(3).await.is_none());
    assert!(f.runtime.run(&run).await.is_none());
    assert!(matches!(
        f.runtime.delete_run(&run).await,
        Err(RuntimeError::RunNotFound(_))
    ));
    assert!(matches!(
        f.runtime.open_human_task(&run, 4, approval()).await,
        Err(RuntimeError::RunNotFound(_))
    ));
    assert!(f.runtime.human_task(4).await.is_none());
}

/// Engine that holds every completion until the test lets it through.
#[derive(Default)]
struct GatedEngine {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl WorkItemRegistry for GatedEngine {
    async fn complete_work_item(
        &self,
        _work_item_id: WorkItemId,
        _results: ResultMap,
    ) -> Result<(), EngineError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn cancel_work_item(&self, _work_item_id: WorkItemId) -> Result<(), EngineError> {
        Ok(())
    }
}

#[tokio::test]
async fn run_deleted_during_submit_stays_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(GatedEngine::default());
    let access = Arc::new(PermissionTable::new().grant("release", "bob", Permission::Build));
    let runtime = Arc::new(
        TaskRuntime::open(RuntimeConfig::new(dir.path()), engine.clone(), access.clone())
            .await
            .unwrap(),
    );
    let run = runtime.create_run("release").await.unwrap();
    runtime.open_human_task(&run, 5, approval()).await.unwrap();
    let path = runtime.run(&run).await.unwrap().path().to_path_buf();

    let submitting = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .submit(5, &[RawAnswer::new("approved", true)], Some("bob"))
                .await
        })
    };
    engine.entered.notified().await;
    runtime.delete_run(&run).await.unwrap();
    engine.release.notify_one();
    submitting.await.unwrap().unwrap();

    assert!(!path.exists());
    drop(runtime);
    let reopened = TaskRuntime::open(RuntimeConfig::new(dir.path()), engine, access)
        .await
        .unwrap();
    assert!(reopened.runs().await.is_empty());
    assert!(reopened.human_task(5).await.is_none());
}

#[tokio::test]
async fn administrator_cancels_task_left_over_from_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let access = Arc::new(PermissionTable::new().with_administrator("admin"));

    let id = {
        let sessions = Arc::new(SessionRegistry::new());
        let runtime = TaskRuntime::open(RuntimeConfig::new(dir.path()), sessions.clone(), access.clone())
            .await
            .unwrap();
        let run = runtime.create_run("release").await.unwrap();
        sessions.load_session(&run).await;
        let (id, _waiter) = sessions.raise_work_item(&run).await.unwrap();
        runtime.open_human_task(&run, id, approval()).await.unwrap();
        id
    };

    // The engine's pending work items did not survive the restart.
    let sessions = Arc::new(SessionRegistry::new());
    let runtime = TaskRuntime::open(RuntimeConfig::new(dir.path()), sessions.clone(), access)
        .await
        .unwrap();
    sessions.load_session(&RunId::new("release", 1)).await;

    let err = runtime
        .submit(id, &[RawAnswer::new("approved", true)], Some("admin"))
        .await
        .unwrap_err();
    assert_eq!(task_error(err), TaskError::Engine(EngineError::UnknownWorkItem(id)));

    let completion = runtime.cancel(id, Some("admin")).await.unwrap();
    assert_eq!(completion.status, Status::Canceled);
    assert!(completion.persisted);
    assert!(runtime.human_task(id).await.unwrap().snapshot().await.is_canceled());
}

#[tokio::test]
async fn lifecycle_events_are_broadcast() {
    let f = fixture().await;
    let mut events = f.runtime.subscribe_events();
    let run = f.runtime.create_run("release").await.unwrap();
    f.sessions.load_session(&run).await;
    let (id, _waiter) = f.sessions.raise_work_item(&run).await.unwrap();
    f.runtime.open_human_task(&run, id, approval()).await.unwrap();
    f.runtime
        .submit(id, &[RawAnswer::new("approved", false)], Some("bob"))
        .await
        .unwrap();

    assert!(matches!(events.recv().await.unwrap(), TaskEvent::TaskCreated { .. }));
    match events.recv().await.unwrap() {
        TaskEvent::TaskCompleted {
            completed_by,
            results,
            ..
        } => {
            assert_eq!(completed_by.as_deref(), Some("bob"));
            assert_eq!(results.get("approved"), Some(&Value::Bool(false)));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_submits_complete_exactly_once() {
    let f = Arc::new(fixture().await);
    let run = f.runtime.create_run("release").await.unwrap();
    f.sessions.load_session(&run).await;
    let (id, _waiter) = f.sessions.raise_work_item(&run).await.unwrap();
    f.runtime.open_human_task(&run, id, approval()).await.unwrap();

    let mut joins = Vec::new();
    for _ in 0..8 {
        let f = f.clone();
        joins.push(tokio::spawn(async move {
            f.runtime
                .submit(id, &[RawAnswer::new("approved", true)], Some("bob"))
                .await
                .is_ok()
        }));
    }

    let mut successes = 0;
    for join in joins {
        if join.await.unwrap() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}
