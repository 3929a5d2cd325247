use crate::{
    Answer, EngineError, ParameterSpec, Permission, RawAnswer, Result, ResultMap, RunContext, RunId,
    TaskError, WorkItemRegistry,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

/// Identifier the workflow engine assigns to a pending work item.
pub type WorkItemId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    New,
    Completed,
    Canceled,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::New)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::New => "new",
            Status::Completed => "completed",
            Status::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// What the engine supplies when it raises a human work item.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub display_name: String,
    #[serde(default)]
    pub private_task: bool,
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

impl TaskDefinition {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    pub fn with_parameter(mut self, parameter: ParameterSpec) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn private(mut self) -> Self {
        self.private_task = true;
        self
    }
}

/// One human decision point inside a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanTask {
    display_name: String,
    work_item_id: WorkItemId,
    run: RunId,
    parameter_definitions: Vec<ParameterSpec>,
    #[serde(default)]
    answers: Option<Vec<Answer>>,
    #[serde(default)]
    actor_id: Option<String>,
    status: Status,
    #[serde(default)]
    private_task: bool,
    created_at: DateTime<Utc>,
    #[serde(default)]
    resolved_at: Option<DateTime<Utc>>,
}

impl HumanTask {
    /// Build a NEW task for `work_item_id` owned by `run`.
    ///
    /// Parameter names must be unique within the task.
    pub fn new(definition: TaskDefinition, run: RunId, work_item_id: WorkItemId) -> Result<Self> {
        let mut seen = HashSet::new();
        for parameter in &definition.parameters {
            if !seen.insert(parameter.name.as_str()) {
                return Err(TaskError::DuplicateParameter(parameter.name.clone()));
            }
        }

        Ok(Self {
            display_name: definition.display_name,
            work_item_id,
            run,
            parameter_definitions: definition.parameters,
            answers: None,
            actor_id: definition.actor_id,
            status: Status::New,
            private_task: definition.private_task,
            created_at: Utc::now(),
            resolved_at: None,
        })
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn work_item_id(&self) -> WorkItemId {
        self.work_item_id
    }

    pub fn run(&self) -> &RunId {
        &self.run
    }

    pub fn parameter_definitions(&self) -> &[ParameterSpec] {
        &self.parameter_definitions
    }

    pub fn parameter_definition(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameter_definitions.iter().find(|p| p.name == name)
    }

    pub fn answers(&self) -> Option<&[Answer]> {
        self.answers.as_deref()
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_new(&self) -> bool {
        self.status == Status::New
    }

    pub fn is_completed(&self) -> bool {
        self.status == Status::Completed
    }

    pub fn is_canceled(&self) -> bool {
        self.status == Status::Canceled
    }

    pub fn is_private(&self) -> bool {
        self.private_task
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolved_at
    }

    pub fn url(&self) -> String {
        format!("{}scriptExecution/{}/", self.run.url(), self.work_item_id)
    }

    /// Private tasks are visible only to their actor (or to everyone while unassigned).
    pub fn can_read(&self, identity: Option<&str>) -> bool {
        if !self.private_task {
            return true;
        }
        match &self.actor_id {
            None => true,
            Some(actor) => identity == Some(actor.as_str()),
        }
    }

    /// An assigned task can only be completed by its actor; build permission
    /// is not consulted for it. Unassigned tasks (or anonymous callers) need
    /// [`Permission::Build`] on the owning run.
    pub fn can_complete(&self, identity: Option<&str>, run: &dyn RunContext) -> bool {
        if self.status != Status::New {
            return false;
        }
        match (&self.actor_id, identity) {
            (Some(actor), Some(identity)) => actor == identity,
            _ => run.has_permission(identity, Permission::Build),
        }
    }

    pub fn check_permission(
        &self,
        permission: Permission,
        identity: Option<&str>,
        run: &dyn RunContext,
    ) -> Result<()> {
        run.check_permission(identity, permission)
    }

    fn ensure_new(&self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(TaskError::NotActive {
                work_item_id: self.work_item_id,
                status: self.status,
            });
        }
        Ok(())
    }

    /// Check every raw answer against the parameter definitions.
    pub fn validate(&self, raw: &[RawAnswer]) -> Result<Vec<Answer>> {
        let mut seen = HashSet::new();
        raw.iter()
            .map(|answer| {
                let definition = self.parameter_definition(&answer.name).ok_or_else(|| {
                    TaskError::UnknownParameter {
                        name: answer.name.clone(),
                    }
                })?;
                if !seen.insert(answer.name.as_str()) {
                    return Err(TaskError::DuplicateParameter(answer.name.clone()));
                }
                definition.create_answer(&answer.value)
            })
            .collect()
    }

    /// Validate `raw`, resume the work item in the engine and record the answers.
    ///
    /// Nothing changes unless both validation and the engine call succeed.
    /// Persisting the owning run is left to the caller.
    pub async fn submit(
        &mut self,
        raw: &[RawAnswer],
        identity: Option<&str>,
        run: &dyn RunContext,
        engine: &dyn WorkItemRegistry,
    ) -> Result<ResultMap> {
        self.ensure_new()?;
        if !self.can_complete(identity, run) {
            return Err(TaskError::PermissionDenied {
                identity: identity.map(str::to_string),
                permission: Permission::Build,
            });
        }

        let answers = self.validate(raw)?;
        let results: ResultMap = answers
            .iter()
            .filter_map(|a| a.engine_value().map(|v| (a.name.clone(), v)))
            .collect();

        engine
            .complete_work_item(self.work_item_id, results.clone())
            .await?;

        self.answers = Some(answers);
        self.status = Status::Completed;
        self.resolved_at = Some(Utc::now());
        info!(
            "Human task '{}' (work item {}) completed by {}",
            self.display_name,
            self.work_item_id,
            identity.unwrap_or("anonymous")
        );
        Ok(results)
    }

    /// Move a NEW task to CANCELED. Terminal tasks are left untouched.
    pub fn cancel(&mut self) -> Result<()> {
        self.ensure_new()?;
        self.status = Status::Canceled;
        self.resolved_at = Some(Utc::now());
        info!(
            "Human task '{}' (work item {}) canceled",
            self.display_name, self.work_item_id
        );
        Ok(())
    }

    /// Ask the engine to drop the work item, then cancel the task.
    ///
    /// A work item the engine no longer knows (its process instance did not
    /// survive a restart) is already gone, so the task is canceled anyway.
    pub async fn abort(&mut self, engine: &dyn WorkItemRegistry) -> Result<()> {
        self.ensure_new()?;
        match engine.cancel_work_item(self.work_item_id).await {
            Ok(()) => {}
            Err(EngineError::UnknownWorkItem(id)) => {
                warn!("Engine no longer knows work item {}; canceling its task", id);
            }
            Err(e) => return Err(e.into()),
        }
        self.cancel()
    }
}

impl fmt::Display for HumanTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parameters: Vec<String> = self
            .parameter_definitions
            .iter()
            .map(ToString::to_string)
            .collect();
        write!(
            f,
            "HumanTask({}) parameters: [{}]",
            self.display_name,
            parameters.join(", ")
        )?;
        if let Some(answers) = &self.answers {
            let answers: Vec<String> = answers.iter().map(ToString::to_string).collect();
            write!(f, " answers: [{}]", answers.join(", "))?;
        }
        Ok(())
    }
}

/// Outcome of resolving a task through a [`TaskHandle`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Completion {
    pub work_item_id: WorkItemId,
    pub status: Status,
    /// Values forwarded to the engine (empty for cancellations).
    pub results: ResultMap,
    /// False when the run could not be saved afterwards; the run retries on its next save.
    pub persisted: bool,
}

/// Shared, lock-guarded task. Submit and cancel are serialized per task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    work_item_id: WorkItemId,
    run: RunId,
    inner: Arc<Mutex<HumanTask>>,
}

impl TaskHandle {
    pub fn new(task: HumanTask) -> Self {
        Self {
            work_item_id: task.work_item_id,
            run: task.run.clone(),
            inner: Arc::new(Mutex::new(task)),
        }
    }

    pub fn work_item_id(&self) -> WorkItemId {
        self.work_item_id
    }

    pub fn run(&self) -> &RunId {
        &self.run
    }

    pub async fn lock(&self) -> MutexGuard<'_, HumanTask> {
        self.inner.lock().await
    }

    /// Copy of the task's current state.
    pub async fn snapshot(&self) -> HumanTask {
        self.inner.lock().await.clone()
    }

    pub async fn submit(
        &self,
        raw: &[RawAnswer],
        identity: Option<&str>,
        run: &dyn RunContext,
        engine: &dyn WorkItemRegistry,
    ) -> Result<Completion> {
        let results = {
            let mut task = self.inner.lock().await;
            task.submit(raw, identity, run, engine).await?
        };
        let persisted = persist(run, self.work_item_id).await;
        Ok(Completion {
            work_item_id: self.work_item_id,
            status: Status::Completed,
            results,
            persisted,
        })
    }

    pub async fn cancel(&self, run: &dyn RunContext) -> Result<Completion> {
        self.inner.lock().await.cancel()?;
        Ok(self.canceled(run).await)
    }

    pub async fn abort(&self, run: &dyn RunContext, engine: &dyn WorkItemRegistry) -> Result<Completion> {
        self.inner.lock().await.abort(engine).await?;
        Ok(self.canceled(run).await)
    }

    async fn canceled(&self, run: &dyn RunContext) -> Completion {
        let persisted = persist(run, self.work_item_id).await;
        Completion {
            work_item_id: self.work_item_id,
            status: Status::Canceled,
            results: ResultMap::new(),
            persisted,
        }
    }
}

async fn persist(run: &dyn RunContext, work_item_id: WorkItemId) -> bool {
    match run.save().await {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "Run {} not saved after resolving work item {}: {}",
                run.run_id(),
                work_item_id,
                e
            );
            false
        }
    }
}
