use crate::{ResultMap, RunId, WorkItemId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle events for human tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TaskEvent {
    TaskCreated {
        work_item_id: WorkItemId,
        run: RunId,
        display_name: String,
        actor_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    TaskCompleted {
        work_item_id: WorkItemId,
        run: RunId,
        completed_by: Option<String>,
        results: ResultMap,
        timestamp: DateTime<Utc>,
    },
    TaskCanceled {
        work_item_id: WorkItemId,
        run: RunId,
        timestamp: DateTime<Utc>,
    },
    RunDeleted {
        run: RunId,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn work_item_id(&self) -> Option<WorkItemId> {
        match self {
            TaskEvent::TaskCreated { work_item_id, .. }
            | TaskEvent::TaskCompleted { work_item_id, .. }
            | TaskEvent::TaskCanceled { work_item_id, .. } => Some(*work_item_id),
            TaskEvent::RunDeleted { .. } => None,
        }
    }
}

/// Process-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    /// Events sent with no subscribers are dropped.
    pub fn emit(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }
}
