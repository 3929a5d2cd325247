use actix_web::{delete, get, post, put, web, HttpRequest, HttpResponse, Responder};
use actix_ws::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskcore::{
    AccessControl, EngineError, HumanTask, Permission, RawAnswer, RunContext, RunId,
    TaskDefinition, TaskError, WorkItemId, WorkItemRegistry,
};
use taskruntime::{
    ManagementConfig, PermissionTable, RuntimeError, Script, SessionRegistry, TaskRuntime,
    WorkItemOutcome,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Header carrying the authenticated user id, set by the fronting proxy.
pub const IDENTITY_HEADER: &str = "X-Remote-User";

/// Application state shared across handlers
pub struct AppState {
    pub runtime: Arc<TaskRuntime>,
    pub sessions: Arc<SessionRegistry>,
    pub access: Arc<PermissionTable>,
    pub scripts: RwLock<ManagementConfig>,
}

/// Submitted form: `{"parameter": [{"name": ..., "value": ...}, ...]}`
#[derive(Debug, Deserialize)]
pub struct SubmitForm {
    #[serde(default)]
    pub parameter: Vec<RawAnswer>,
}

#[derive(Debug, Serialize)]
struct TaskView {
    #[serde(flatten)]
    task: HumanTask,
    url: String,
    can_complete: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn identity(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn failure(err: &RuntimeError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
    };
    match err {
        RuntimeError::Task(task_error) => match task_error {
            TaskError::UnknownParameter { .. }
            | TaskError::InvalidValue { .. }
            | TaskError::DuplicateParameter(_) => HttpResponse::BadRequest().json(body),
            TaskError::PermissionDenied { .. } => HttpResponse::Forbidden().json(body),
            TaskError::NotFound(_) => HttpResponse::NotFound().json(body),
            TaskError::NotActive { .. } | TaskError::DuplicateWorkItem(_) => {
                HttpResponse::Conflict().json(body)
            }
            TaskError::Engine(EngineError::Unavailable { .. }) => {
                HttpResponse::ServiceUnavailable().json(body)
            }
            TaskError::Engine(EngineError::UnknownWorkItem(_)) => HttpResponse::Gone().json(body),
            TaskError::Persistence(_) => HttpResponse::InternalServerError().json(body),
        },
        RuntimeError::RunNotFound(_) | RuntimeError::ScriptNotFound(_) => {
            HttpResponse::NotFound().json(body)
        }
        RuntimeError::InvalidJobName(_) | RuntimeError::DuplicateScript(_) => {
            HttpResponse::BadRequest().json(body)
        }
        RuntimeError::Io(_) | RuntimeError::Serialization(_) => {
            error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn denied(identity: Option<&str>, permission: Permission) -> HttpResponse {
    failure(&RuntimeError::Task(TaskError::PermissionDenied {
        identity: identity.map(str::to_string),
        permission,
    }))
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "taskserver"
    }))
}

/// Look up a human task by work item id
#[get("/api/tasks/{id}")]
async fn get_task(
    data: web::Data<AppState>,
    path: web::Path<WorkItemId>,
    req: HttpRequest,
) -> HttpResponse {
    let work_item_id = path.into_inner();
    let user = identity(&req);
    let user = user.as_deref();

    let (handle, run) = match data.runtime.resolve(work_item_id).await {
        Ok(found) => found,
        Err(e) => return failure(&e),
    };
    let task = handle.snapshot().await;
    if let Err(e) = task.check_permission(Permission::Read, user, run.as_ref()) {
        return failure(&e.into());
    }
    if !task.can_read(user) {
        return denied(user, Permission::Read);
    }
    let can_complete = task.can_complete(user, run.as_ref());
    HttpResponse::Ok().json(TaskView {
        url: task.url(),
        can_complete,
        task,
    })
}

/// Submit answers for a human task
#[post("/api/tasks/{id}/submit")]
async fn submit_task(
    data: web::Data<AppState>,
    path: web::Path<WorkItemId>,
    form: web::Json<SubmitForm>,
    req: HttpRequest,
) -> HttpResponse {
    let work_item_id = path.into_inner();
    let user = identity(&req);
    let user = user.as_deref();

    let (handle, run) = match data.runtime.resolve(work_item_id).await {
        Ok(found) => found,
        Err(e) => return failure(&e),
    };
    if let Err(e) = run.check_permission(user, Permission::Read) {
        return failure(&e.into());
    }
    if !handle.lock().await.can_read(user) {
        return denied(user, Permission::Read);
    }

    match data
        .runtime
        .submit(work_item_id, &form.into_inner().parameter, user)
        .await
    {
        Ok(completion) => {
            let location = format!("/{}", run.id().url());
            HttpResponse::Ok()
                .insert_header(("Location", location.clone()))
                .json(serde_json::json!({
                    "completion": completion,
                    "redirect": location,
                }))
        }
        Err(e) => {
            warn!("Submit for work item {} failed: {}", work_item_id, e);
            failure(&e)
        }
    }
}

/// Cancel a human task and abort its work item
#[post("/api/tasks/{id}/cancel")]
async fn cancel_task(
    data: web::Data<AppState>,
    path: web::Path<WorkItemId>,
    req: HttpRequest,
) -> HttpResponse {
    let work_item_id = path.into_inner();
    let user = identity(&req);
    match data.runtime.cancel(work_item_id, user.as_deref()).await {
        Ok(completion) => HttpResponse::Ok().json(completion),
        Err(e) => failure(&e),
    }
}

/// Record that the engine dropped a work item on its own (administrators only)
#[post("/api/tasks/{id}/aborted")]
async fn work_item_aborted(
    data: web::Data<AppState>,
    path: web::Path<WorkItemId>,
    req: HttpRequest,
) -> HttpResponse {
    let user = identity(&req);
    if !data.access.is_administrator(user.as_deref()) {
        return denied(user.as_deref(), Permission::Administer);
    }
    match data.runtime.work_item_aborted(path.into_inner()).await {
        Ok(completion) => HttpResponse::Ok().json(completion),
        Err(e) => failure(&e),
    }
}

/// List all runs
#[get("/api/runs")]
async fn list_runs(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.runtime.runs().await)
}

/// Start a new run of a job
#[post("/api/runs/{job}")]
async fn create_run(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
) -> HttpResponse {
    let job = path.into_inner();
    let user = identity(&req);
    // Run numbers are not known yet; job-level grants are what matter here.
    let scope = RunId::new(job.clone(), 0);
    if !data.access.has_permission(&scope, user.as_deref(), Permission::Build) {
        return denied(user.as_deref(), Permission::Build);
    }

    match data.runtime.create_run(&job).await {
        Ok(run) => {
            data.sessions.load_session(&run).await;
            HttpResponse::Created().json(run)
        }
        Err(e) => failure(&e),
    }
}

/// Tasks of one run that the caller may read
#[get("/api/runs/{job}/{number}/tasks")]
async fn run_tasks(
    data: web::Data<AppState>,
    path: web::Path<(String, u32)>,
    req: HttpRequest,
) -> HttpResponse {
    let (job, number) = path.into_inner();
    let id = RunId::new(job, number);
    let user = identity(&req);
    let user = user.as_deref();

    let Some(run) = data.runtime.run(&id).await else {
        return failure(&RuntimeError::RunNotFound(id));
    };
    if let Err(e) = run.check_permission(user, Permission::Read) {
        return failure(&e.into());
    }

    let tasks: Vec<TaskView> = run
        .record()
        .await
        .tasks
        .into_iter()
        .filter(|t| t.can_read(user))
        .map(|task| TaskView {
            url: task.url(),
            can_complete: task.can_complete(user, run.as_ref()),
            task,
        })
        .collect();
    HttpResponse::Ok().json(tasks)
}

/// Engine bridge: raise a human work item inside a run
#[post("/api/runs/{job}/{number}/work-items")]
async fn raise_work_item(
    data: web::Data<AppState>,
    path: web::Path<(String, u32)>,
    definition: web::Json<TaskDefinition>,
    req: HttpRequest,
) -> HttpResponse {
    let (job, number) = path.into_inner();
    let id = RunId::new(job, number);
    let user = identity(&req);

    let Some(run) = data.runtime.run(&id).await else {
        return failure(&RuntimeError::RunNotFound(id));
    };
    if let Err(e) = run.check_permission(user.as_deref(), Permission::Configure) {
        return failure(&e.into());
    }

    data.sessions.load_session(&id).await;
    let (work_item_id, waiter) = match data.sessions.raise_work_item(&id).await {
        Ok(raised) => raised,
        Err(e) => return failure(&RuntimeError::Task(e.into())),
    };

    let handle = match data
        .runtime
        .open_human_task(&id, work_item_id, definition.into_inner())
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            if let Err(rollback) = data.sessions.cancel_work_item(work_item_id).await {
                warn!(
                    "Work item {} left pending after failed task creation: {}",
                    work_item_id, rollback
                );
            }
            return failure(&e);
        }
    };

    actix_web::rt::spawn(async move {
        match waiter.await {
            Ok(WorkItemOutcome::Completed(results)) => {
                info!("Work item {} resumed with {:?}", work_item_id, results)
            }
            Ok(WorkItemOutcome::Canceled) => info!("Work item {} aborted", work_item_id),
            Err(_) => warn!("Work item {} dropped without an outcome", work_item_id),
        }
    });

    let task = handle.snapshot().await;
    HttpResponse::Created().json(TaskView {
        url: task.url(),
        can_complete: false,
        task,
    })
}

/// Delete a run and its tasks
#[delete("/api/runs/{job}/{number}")]
async fn delete_run(
    data: web::Data<AppState>,
    path: web::Path<(String, u32)>,
    req: HttpRequest,
) -> HttpResponse {
    let (job, number) = path.into_inner();
    let id = RunId::new(job, number);
    let user = identity(&req);

    let Some(run) = data.runtime.run(&id).await else {
        return failure(&RuntimeError::RunNotFound(id));
    };
    if let Err(e) = run.check_permission(user.as_deref(), Permission::Configure) {
        return failure(&e.into());
    }

    data.sessions.unload_session(&id).await;
    data.sessions.forget_run(&id).await;
    match data.runtime.delete_run(&id).await {
        Ok(removed) => HttpResponse::Ok().json(serde_json::json!({
            "message": "Run deleted successfully",
            "tasks_removed": removed,
        })),
        Err(e) => failure(&e),
    }
}

/// List registered process scripts
#[get("/api/scripts")]
async fn list_scripts(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.scripts.read().await.list())
}

#[get("/api/scripts/{id}")]
async fn get_script(data: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let id = path.into_inner();
    match data.scripts.read().await.find(&id) {
        Some(script) => HttpResponse::Ok().json(script),
        None => failure(&RuntimeError::ScriptNotFound(id)),
    }
}

/// Replace the registered scripts (administrators only)
#[put("/api/scripts")]
async fn replace_scripts(
    data: web::Data<AppState>,
    scripts: web::Json<Vec<Script>>,
    req: HttpRequest,
) -> HttpResponse {
    let user = identity(&req);
    if !data.access.is_administrator(user.as_deref()) {
        return denied(user.as_deref(), Permission::Administer);
    }

    let mut config = data.scripts.write().await;
    let result = config
        .replace_all(scripts.into_inner())
        .and_then(|()| config.save());
    match result {
        Ok(()) => HttpResponse::Ok().json(config.list()),
        Err(e) => failure(&e),
    }
}

/// WebSocket endpoint for task lifecycle events
#[get("/api/events")]
async fn websocket_events(
    req: HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> actix_web::Result<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client lagged, {} events skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(get_task)
        .service(submit_task)
        .service(cancel_task)
        .service(work_item_aborted)
        .service(list_runs)
        .service(create_run)
        .service(run_tasks)
        .service(raise_work_item)
        .service(delete_run)
        .service(list_scripts)
        .service(get_script)
        .service(replace_scripts)
        .service(websocket_events);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test, App};
    use taskruntime::RuntimeConfig;

    async fn state(dir: &std::path::Path) -> web::Data<AppState> {
        let sessions = Arc::new(SessionRegistry::new());
        let access = Arc::new(
            PermissionTable::new()
                .grant_authenticated(Permission::Read)
                .grant_authenticated(Permission::Build)
                .with_administrator("admin"),
        );
        let runtime = TaskRuntime::open(RuntimeConfig::new(dir), sessions.clone(), access.clone())
            .await
            .unwrap();
        web::Data::new(AppState {
            runtime: Arc::new(runtime),
            sessions,
            access,
            scripts: RwLock::new(ManagementConfig::open(ManagementConfig::config_path(dir))),
        })
    }

    #[actix_web::test]
    async fn raise_lookup_and_submit() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state(dir.path()).await)
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/runs/release")
            .insert_header((IDENTITY_HEADER, "bob"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let req = test::TestRequest::post()
            .uri("/api/runs/release/1/work-items")
            .insert_header((IDENTITY_HEADER, "admin"))
            .set_json(serde_json::json!({
                "display_name": "Approve release",
                "parameters": [{"name": "approved", "type": "boolean"}]
            }))
            .to_request();
        let created: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        let id = created["work_item_id"].as_u64().unwrap();

        let req = test::TestRequest::get()
            .uri(&format!("/api/tasks/{}", id))
            .insert_header((IDENTITY_HEADER, "bob"))
            .to_request();
        let view: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(view["status"], "NEW");
        assert_eq!(view["can_complete"], true);

        let req = test::TestRequest::post()
            .uri(&format!("/api/tasks/{}/submit", id))
            .insert_header((IDENTITY_HEADER, "bob"))
            .set_json(serde_json::json!({"parameter": [{"name": "colour", "value": "red"}]}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let submit = || {
            test::TestRequest::post()
                .uri(&format!("/api/tasks/{}/submit", id))
                .insert_header((IDENTITY_HEADER, "bob"))
                .set_json(serde_json::json!({"parameter": [{"name": "approved", "value": true}]}))
                .to_request()
        };
        let resp = test::call_service(&app, submit()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("Location").unwrap(), "/job/release/1/");

        let resp = test::call_service(&app, submit()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state(dir.path()).await)
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/tasks/12345")
            .insert_header((IDENTITY_HEADER, "bob"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn anonymous_cannot_read_or_create_runs() {
        let dir = tempfile::tempdir().unwrap();
        let data = state(dir.path()).await;
        let run = data.runtime.create_run("release").await.unwrap();
        data.runtime
            .open_human_task(&run, 1, TaskDefinition::new("Approve"))
            .await
            .unwrap();
        let app = test::init_service(App::new().app_data(data).configure(configure)).await;

        let req = test::TestRequest::get().uri("/api/tasks/1").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::post().uri("/api/runs/release").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn deleting_a_run_releases_its_pending_work_items() {
        let dir = tempfile::tempdir().unwrap();
        let data = state(dir.path()).await;
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/runs/release")
            .insert_header((IDENTITY_HEADER, "bob"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);
        let req = test::TestRequest::post()
            .uri("/api/runs/release/1/work-items")
            .insert_header((IDENTITY_HEADER, "admin"))
            .set_json(serde_json::json!({"display_name": "Approve release"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);
        assert_eq!(data.sessions.pending_count().await, 1);

        let req = test::TestRequest::delete()
            .uri("/api/runs/release/1")
            .insert_header((IDENTITY_HEADER, "admin"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert_eq!(data.sessions.pending_count().await, 0);
        assert!(!data.sessions.is_loaded(&RunId::new("release", 1)).await);
    }

    #[actix_web::test]
    async fn failed_task_creation_rolls_back_the_work_item() {
        let dir = tempfile::tempdir().unwrap();
        let data = state(dir.path()).await;
        let run = data.runtime.create_run("release").await.unwrap();
        // Occupies the id the registry hands out next
        data.runtime
            .open_human_task(&run, 1, TaskDefinition::new("Approve"))
            .await
            .unwrap();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;

        let req = test::TestRequest::post()
            .uri("/api/runs/release/1/work-items")
            .insert_header((IDENTITY_HEADER, "admin"))
            .set_json(serde_json::json!({"display_name": "Approve again"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);
        assert_eq!(data.sessions.pending_count().await, 0);
    }

    #[actix_web::test]
    async fn only_administrators_report_aborted_work_items() {
        let dir = tempfile::tempdir().unwrap();
        let data = state(dir.path()).await;
        let run = data.runtime.create_run("release").await.unwrap();
        data.runtime
            .open_human_task(&run, 3, TaskDefinition::new("Approve"))
            .await
            .unwrap();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure)).await;

        let aborted = |user: &str| {
            test::TestRequest::post()
                .uri("/api/tasks/3/aborted")
                .insert_header((IDENTITY_HEADER, user.to_string()))
                .to_request()
        };
        assert_eq!(test::call_service(&app, aborted("bob")).await.status(), StatusCode::FORBIDDEN);
        assert_eq!(test::call_service(&app, aborted("admin")).await.status(), StatusCode::OK);
        assert_eq!(test::call_service(&app, aborted("admin")).await.status(), StatusCode::CONFLICT);
        assert!(data.runtime.human_task(3).await.unwrap().snapshot().await.is_canceled());
    }

    #[actix_web::test]
    async fn only_administrators_replace_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(state(dir.path()).await)
                .configure(configure),
        )
        .await;
        let body = serde_json::json!([{"id": "release", "source": "processes/release.rf"}]);

        let req = test::TestRequest::put()
            .uri("/api/scripts")
            .insert_header((IDENTITY_HEADER, "bob"))
            .set_json(&body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::put()
            .uri("/api/scripts")
            .insert_header((IDENTITY_HEADER, "admin"))
            .set_json(&body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::get().uri("/api/scripts/release").to_request();
        let script: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(script["source"], "processes/release.rf");
        assert!(dir.path().join("scripts.json").exists());
    }
}
