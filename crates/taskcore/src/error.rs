use crate::{Permission, Status, WorkItemId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    #[error("No such parameter definition: {name}")]
    UnknownParameter { name: String },

    #[error("Invalid value for '{name}': expected {expected}, {reason}")]
    InvalidValue {
        name: String,
        expected: String,
        reason: String,
    },

    #[error("Parameter '{0}' answered more than once")]
    DuplicateParameter(String),

    #[error("{} is missing the {permission} permission", .identity.as_deref().unwrap_or("anonymous"))]
    PermissionDenied {
        identity: Option<String>,
        permission: Permission,
    },

    #[error("Work item {work_item_id} is already {status}")]
    NotActive {
        work_item_id: WorkItemId,
        status: Status,
    },

    #[error("Human task not found for work item {0}")]
    NotFound(WorkItemId),

    #[error("Work item {0} is already tracked by a live task")]
    DuplicateWorkItem(WorkItemId),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Failures reported by the workflow engine when asked to resume or abort a work item.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Workflow session for run {run} is not loaded")]
    Unavailable { run: String },

    #[error("Unknown work item: {0}")]
    UnknownWorkItem(WorkItemId),
}
