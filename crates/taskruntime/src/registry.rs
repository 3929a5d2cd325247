use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use taskcore::{EngineError, ResultMap, RunId, WorkItemId, WorkItemRegistry};
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

pub type SessionId = Uuid;

/// How a paused process instance was resumed.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItemOutcome {
    Completed(ResultMap),
    Canceled,
}

struct PendingWorkItem {
    run: RunId,
    resume: oneshot::Sender<WorkItemOutcome>,
}

/// In-process work item registry
///
/// Tracks which runs have a live workflow session and which work items are
/// waiting on a human. A process instance raises a work item and awaits the
/// returned receiver; completing or canceling the item wakes it up.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<RunId, SessionId>>,
    pending: RwLock<HashMap<WorkItemId, PendingWorkItem>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make sure freshly raised ids never collide with ones already handed out.
    pub fn reserve_ids_through(&self, last_used: WorkItemId) {
        self.next_id.fetch_max(last_used.saturating_add(1), Ordering::SeqCst);
    }

    /// Load (or return the already loaded) session for a run.
    pub async fn load_session(&self, run: &RunId) -> SessionId {
        let mut sessions = self.sessions.write().await;
        *sessions.entry(run.clone()).or_insert_with(|| {
            let id = Uuid::new_v4();
            tracing::info!("Loaded workflow session {} for run {}", id, run);
            id
        })
    }

    pub async fn unload_session(&self, run: &RunId) -> bool {
        let removed = self.sessions.write().await.remove(run).is_some();
        if removed {
            tracing::info!("Unloaded workflow session for run {}", run);
        }
        removed
    }

    /// Drop every work item still pending in `run`, waking its waiters with `Canceled`.
    pub async fn forget_run(&self, run: &RunId) -> usize {
        let mut pending = self.pending.write().await;
        let ids: Vec<WorkItemId> = pending
            .iter()
            .filter(|(_, item)| &item.run == run)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(item) = pending.remove(id) {
                let _ = item.resume.send(WorkItemOutcome::Canceled);
            }
        }
        if !ids.is_empty() {
            tracing::info!("Dropped {} pending work items of run {}", ids.len(), run);
        }
        ids.len()
    }

    pub async fn is_loaded(&self, run: &RunId) -> bool {
        self.sessions.read().await.contains_key(run)
    }

    /// Raise a new human work item inside `run`'s session.
    pub async fn raise_work_item(
        &self,
        run: &RunId,
    ) -> Result<(WorkItemId, oneshot::Receiver<WorkItemOutcome>), EngineError> {
        if !self.is_loaded(run).await {
            return Err(EngineError::Unavailable {
                run: run.to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (resume, waiter) = oneshot::channel();
        self.pending.write().await.insert(
            id,
            PendingWorkItem {
                run: run.clone(),
                resume,
            },
        );
        tracing::debug!("Raised work item {} in run {}", id, run);
        Ok((id, waiter))
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    async fn resume(&self, work_item_id: WorkItemId, outcome: WorkItemOutcome) -> Result<(), EngineError> {
        let mut pending = self.pending.write().await;
        let item = pending
            .get(&work_item_id)
            .ok_or(EngineError::UnknownWorkItem(work_item_id))?;

        if !self.is_loaded(&item.run).await {
            return Err(EngineError::Unavailable {
                run: item.run.to_string(),
            });
        }

        if let Some(item) = pending.remove(&work_item_id) {
            if item.resume.send(outcome).is_err() {
                tracing::debug!(
                    "Process waiting on work item {} in run {} has gone away",
                    work_item_id,
                    item.run
                );
            }
        }
        Ok(())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkItemRegistry for SessionRegistry {
    async fn complete_work_item(
        &self,
        work_item_id: WorkItemId,
        results: ResultMap,
    ) -> Result<(), EngineError> {
        self.resume(work_item_id, WorkItemOutcome::Completed(results)).await
    }

    async fn cancel_work_item(&self, work_item_id: WorkItemId) -> Result<(), EngineError> {
        self.resume(work_item_id, WorkItemOutcome::Canceled).await
    }
}
