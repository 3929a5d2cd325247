use taskcore::{RunId, TaskError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Invalid job name: {0:?}")]
    InvalidJobName(String),

    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    #[error("Duplicate script id: {0}")]
    DuplicateScript(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuntimeError {
    /// The task-level error underneath, if any.
    pub fn as_task_error(&self) -> Option<&TaskError> {
        match self {
            RuntimeError::Task(e) => Some(e),
            _ => None,
        }
    }
}
