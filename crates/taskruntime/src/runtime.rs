use crate::{Run, RunStore, RuntimeError, TaskDirectory};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use taskcore::{
    AccessControl, Completion, EventBus, HumanTask, Permission, RawAnswer, RunContext, RunId,
    TaskDefinition, TaskError, TaskEvent, TaskHandle, WorkItemId, WorkItemRegistry,
};
use tokio::sync::RwLock;

/// Owns every run, the work item directory and the link to the workflow engine.
pub struct TaskRuntime {
    store: RunStore,
    engine: Arc<dyn WorkItemRegistry>,
    access: Arc<dyn AccessControl>,
    directory: TaskDirectory,
    event_bus: Arc<EventBus>,
    runs: RwLock<BTreeMap<RunId, Arc<Run>>>,
}

impl TaskRuntime {
    /// Load persisted runs from `config.data_dir` and index their tasks.
    pub async fn open(
        config: RuntimeConfig,
        engine: Arc<dyn WorkItemRegistry>,
        access: Arc<dyn AccessControl>,
    ) -> Result<Self, RuntimeError> {
        let store = RunStore::new(&config.data_dir);
        let directory = TaskDirectory::new();
        let mut runs = BTreeMap::new();

        for record in store.load_all().await? {
            let path = store.run_path(&record.id)?;
            let (run, handles) = Run::from_record(record, path, access.clone());
            for handle in handles {
                if let Err(e) = directory.insert(handle).await {
                    tracing::warn!("Ignoring task in run {}: {}", run.id(), e);
                }
            }
            runs.insert(run.id().clone(), Arc::new(run));
        }

        tracing::info!(
            "Loaded {} runs with {} human tasks from {}",
            runs.len(),
            directory.len().await,
            config.data_dir.display()
        );

        Ok(Self {
            store,
            engine,
            access,
            directory,
            event_bus: Arc::new(EventBus::new(config.event_buffer_size)),
            runs: RwLock::new(runs),
        })
    }

    pub fn directory(&self) -> &TaskDirectory {
        &self.directory
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.event_bus.subscribe()
    }

    /// Start the next run of `job`.
    pub async fn create_run(&self, job: &str) -> Result<RunId, RuntimeError> {
        let mut runs = self.runs.write().await;
        let number = runs
            .keys()
            .filter(|id| id.job == job)
            .map(|id| id.number)
            .max()
            .unwrap_or(0)
            + 1;
        let id = RunId::new(job, number);
        let run = Run::new(id.clone(), self.store.run_path(&id)?, self.access.clone());
        run.save().await?;
        runs.insert(id.clone(), Arc::new(run));
        tracing::info!("Created run {}", id);
        Ok(id)
    }

    pub async fn run(&self, id: &RunId) -> Option<Arc<Run>> {
        self.runs.read().await.get(id).cloned()
    }

    pub async fn runs(&self) -> Vec<RunId> {
        self.runs.read().await.keys().cloned().collect()
    }

    async fn require_run(&self, id: &RunId) -> Result<Arc<Run>, RuntimeError> {
        self.run(id)
            .await
            .ok_or_else(|| RuntimeError::RunNotFound(id.clone()))
    }

    /// Track a human work item the engine has just raised inside `run`.
    pub async fn open_human_task(
        &self,
        run: &RunId,
        work_item_id: WorkItemId,
        definition: TaskDefinition,
    ) -> Result<TaskHandle, RuntimeError> {
        let task = HumanTask::new(definition, run.clone(), work_item_id)?;
        let event = TaskEvent::TaskCreated {
            work_item_id,
            run: run.clone(),
            display_name: task.display_name().to_string(),
            actor_id: task.actor_id().map(str::to_string),
            timestamp: Utc::now(),
        };

        let handle = TaskHandle::new(task);
        // Registration happens under the runs lock so a concurrent delete_run
        // either sees this task or rejects it.
        let owner = {
            let runs = self.runs.read().await;
            let owner = runs
                .get(run)
                .cloned()
                .ok_or_else(|| RuntimeError::RunNotFound(run.clone()))?;
            self.directory.insert(handle.clone()).await?;
            owner.attach(handle.clone()).await;
            owner
        };
        if let Err(e) = owner.save().await {
            tracing::warn!("Run {} not saved after opening work item {}: {}", run, work_item_id, e);
        }

        tracing::info!("Opened human task for work item {} in run {}", work_item_id, run);
        self.event_bus.emit(event);
        Ok(handle)
    }

    pub async fn human_task(&self, work_item_id: WorkItemId) -> Option<TaskHandle> {
        self.directory.find_by_work_item_id(work_item_id).await
    }

    /// Find the task and the run that owns it.
    pub async fn resolve(&self, work_item_id: WorkItemId) -> Result<(TaskHandle, Arc<Run>), RuntimeError> {
        let handle = self
            .human_task(work_item_id)
            .await
            .ok_or(TaskError::NotFound(work_item_id))?;
        let run = self.require_run(handle.run()).await?;
        Ok((handle, run))
    }

    pub async fn submit(
        &self,
        work_item_id: WorkItemId,
        answers: &[RawAnswer],
        identity: Option<&str>,
    ) -> Result<Completion, RuntimeError> {
        let (handle, run) = self.resolve(work_item_id).await?;
        let completion = handle
            .submit(answers, identity, run.as_ref(), self.engine.as_ref())
            .await?;

        self.event_bus.emit(TaskEvent::TaskCompleted {
            work_item_id,
            run: run.id().clone(),
            completed_by: identity.map(str::to_string),
            results: completion.results.clone(),
            timestamp: Utc::now(),
        });
        Ok(completion)
    }

    /// Administrative cancellation: aborts the work item in the engine, then cancels the task.
    pub async fn cancel(
        &self,
        work_item_id: WorkItemId,
        identity: Option<&str>,
    ) -> Result<Completion, RuntimeError> {
        let (handle, run) = self.resolve(work_item_id).await?;
        run.check_permission(identity, Permission::Cancel)?;
        let completion = handle.abort(run.as_ref(), self.engine.as_ref()).await?;
        self.emit_canceled(&run, work_item_id);
        Ok(completion)
    }

    /// The engine dropped the work item on its own; mirror that on the task.
    pub async fn work_item_aborted(&self, work_item_id: WorkItemId) -> Result<Completion, RuntimeError> {
        let (handle, run) = self.resolve(work_item_id).await?;
        let completion = handle.cancel(run.as_ref()).await?;
        self.emit_canceled(&run, work_item_id);
        Ok(completion)
    }

    fn emit_canceled(&self, run: &Run, work_item_id: WorkItemId) {
        self.event_bus.emit(TaskEvent::TaskCanceled {
            work_item_id,
            run: run.id().clone(),
            timestamp: Utc::now(),
        });
    }

    pub async fn tasks_for_run(&self, id: &RunId) -> Result<Vec<HumanTask>, RuntimeError> {
        Ok(self.require_run(id).await?.record().await.tasks)
    }

    /// Remove a run, its file and every directory entry pointing into it.
    pub async fn delete_run(&self, id: &RunId) -> Result<usize, RuntimeError> {
        let removed = {
            let mut runs = self.runs.write().await;
            let removed = runs
                .remove(id)
                .ok_or_else(|| RuntimeError::RunNotFound(id.clone()))?;
            removed.mark_deleted();
            removed
        };
        let dropped = self.directory.remove_run(id).await;
        removed.wait_for_save().await;
        self.store.delete(id).await?;

        tracing::info!("Deleted run {} ({} human tasks)", id, dropped);
        self.event_bus.emit(TaskEvent::RunDeleted {
            run: id.clone(),
            timestamp: Utc::now(),
        });
        Ok(dropped)
    }

    /// Retry saving every run whose last save failed. Returns how many were saved.
    pub async fn flush_dirty(&self) -> usize {
        let runs: Vec<Arc<Run>> = self.runs.read().await.values().cloned().collect();
        let mut saved = 0;
        for run in runs.into_iter().filter(|r| r.is_dirty()) {
            match run.save().await {
                Ok(()) => saved += 1,
                Err(e) => tracing::warn!("Run {} still not saved: {}", run.id(), e),
            }
        }
        saved
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub event_buffer_size: usize,
}

impl RuntimeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            event_buffer_size: 1000,
        }
    }
}
