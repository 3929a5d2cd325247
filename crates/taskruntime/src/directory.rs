use std::collections::HashMap;
use taskcore::{RunId, TaskError, TaskHandle, WorkItemId};
use tokio::sync::RwLock;

/// Reverse index from work item id to the task tracking it.
///
/// Entries are added when a task is opened (or loaded from disk) and removed
/// only when the owning run is deleted, so lookups are not filtered by status.
pub struct TaskDirectory {
    entries: RwLock<HashMap<WorkItemId, TaskHandle>>,
}

impl TaskDirectory {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, handle: TaskHandle) -> Result<(), TaskError> {
        let mut entries = self.entries.write().await;
        let id = handle.work_item_id();
        if entries.contains_key(&id) {
            return Err(TaskError::DuplicateWorkItem(id));
        }
        entries.insert(id, handle);
        Ok(())
    }

    pub async fn find_by_work_item_id(&self, work_item_id: WorkItemId) -> Option<TaskHandle> {
        let found = self.entries.read().await.get(&work_item_id).cloned();
        tracing::debug!("Lookup of work item {}: {}", work_item_id, found.is_some());
        found
    }

    /// Drop every entry owned by `run`, returning how many were removed.
    pub async fn remove_run(&self, run: &RunId) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, handle| handle.run() != run);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn max_work_item_id(&self) -> Option<WorkItemId> {
        self.entries.read().await.keys().copied().max()
    }
}

impl Default for TaskDirectory {
    fn default() -> Self {
        Self::new()
    }
}
