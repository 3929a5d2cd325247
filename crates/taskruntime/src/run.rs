use crate::RuntimeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use taskcore::{
    AccessControl, HumanTask, Permission, RunContext, RunId, TaskError, TaskHandle, WorkItemId,
};
use tokio::sync::{Mutex, RwLock};

/// On-disk form of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    #[serde(default)]
    pub tasks: Vec<HumanTask>,
}

/// One run of a workflow-bearing job and the human tasks it owns.
pub struct Run {
    id: RunId,
    path: PathBuf,
    tasks: RwLock<Vec<TaskHandle>>,
    access: Arc<dyn AccessControl>,
    dirty: AtomicBool,
    deleted: AtomicBool,
    save_lock: Mutex<()>,
}

impl Run {
    pub fn new(id: RunId, path: PathBuf, access: Arc<dyn AccessControl>) -> Self {
        Self {
            id,
            path,
            tasks: RwLock::new(Vec::new()),
            access,
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        }
    }

    /// Rebuild a run from its record, returning the handles of its tasks.
    pub fn from_record(
        record: RunRecord,
        path: PathBuf,
        access: Arc<dyn AccessControl>,
    ) -> (Self, Vec<TaskHandle>) {
        let handles: Vec<TaskHandle> = record.tasks.into_iter().map(TaskHandle::new).collect();
        let run = Self {
            id: record.id,
            path,
            tasks: RwLock::new(handles.clone()),
            access,
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            save_lock: Mutex::new(()),
        };
        (run, handles)
    }

    pub fn id(&self) -> &RunId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn attach(&self, handle: TaskHandle) {
        self.tasks.write().await.push(handle);
    }

    pub async fn tasks(&self) -> Vec<TaskHandle> {
        self.tasks.read().await.clone()
    }

    /// True while the last save failed and the run has not been saved since.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Mark the run as deleted. Later saves are skipped so the file stays gone.
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub async fn record(&self) -> RunRecord {
        let handles = self.tasks().await;
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in &handles {
            tasks.push(handle.snapshot().await);
        }
        RunRecord {
            id: self.id.clone(),
            tasks,
        }
    }

    async fn write(&self) -> Result<(), RuntimeError> {
        let _guard = self.save_lock.lock().await;
        if self.is_deleted() {
            tracing::debug!("Run {} was deleted; not saving", self.id);
            return Ok(());
        }
        let record = self.record().await;
        write_json_atomic(&self.path, &record).await
    }

    /// Take the save lock so no write is in flight when this returns.
    pub(crate) async fn wait_for_save(&self) {
        drop(self.save_lock.lock().await);
    }
}

#[async_trait]
impl RunContext for Run {
    fn run_id(&self) -> &RunId {
        &self.id
    }

    fn has_permission(&self, identity: Option<&str>, permission: Permission) -> bool {
        self.access.has_permission(&self.id, identity, permission)
    }

    async fn save(&self) -> taskcore::Result<()> {
        match self.write().await {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(TaskError::Persistence(format!("{}: {}", self.path.display(), e)))
            }
        }
    }

    async fn human_task(&self, work_item_id: WorkItemId) -> Option<TaskHandle> {
        self.tasks
            .read()
            .await
            .iter()
            .find(|h| h.work_item_id() == work_item_id)
            .cloned()
    }
}

/// Write `value` next to `path` and rename it into place.
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), RuntimeError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// File layout for runs: `<root>/jobs/<job>/runs/<number>.json`.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_path(&self, id: &RunId) -> Result<PathBuf, RuntimeError> {
        validate_job_name(&id.job)?;
        Ok(self
            .root
            .join("jobs")
            .join(&id.job)
            .join("runs")
            .join(format!("{}.json", id.number)))
    }

    /// Read every run record under the root. Unreadable files are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<RunRecord>, RuntimeError> {
        let jobs_dir = self.root.join("jobs");
        let mut records = Vec::new();
        if !tokio::fs::try_exists(&jobs_dir).await? {
            return Ok(records);
        }

        let mut jobs = tokio::fs::read_dir(&jobs_dir).await?;
        while let Some(job) = jobs.next_entry().await? {
            let runs_dir = job.path().join("runs");
            if !tokio::fs::try_exists(&runs_dir).await? {
                continue;
            }
            let mut runs = tokio::fs::read_dir(&runs_dir).await?;
            while let Some(entry) = runs.next_entry().await? {
                let path = entry.path();
                if path.extension() != Some(OsStr::new("json")) {
                    continue;
                }
                match read_record(&path).await {
                    Ok(record) => records.push(record),
                    Err(e) => tracing::warn!("Skipping run file {}: {}", path.display(), e),
                }
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    pub async fn delete(&self, id: &RunId) -> Result<(), RuntimeError> {
        let path = self.run_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn read_record(path: &Path) -> Result<RunRecord, RuntimeError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) fn validate_job_name(job: &str) -> Result<(), RuntimeError> {
    let valid = !job.is_empty()
        && job != "."
        && job != ".."
        && !job.contains(|c: char| c == '/' || c == '\\')
        && !job.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidJobName(job.to_string()))
    }
}
