//! Core abstractions for human tasks
//!
//! Parameter and answer types, the human task state machine, and the traits
//! that connect a task to its owning run and to the workflow engine.

mod access;
mod context;
mod engine;
mod error;
pub mod events;
mod parameter;
mod task;
mod value;

pub use access::{AccessControl, Permission, Unrestricted};
pub use context::{RunContext, RunId};
pub use engine::WorkItemRegistry;
pub use error::{EngineError, TaskError};
pub use events::*;
pub use parameter::{Answer, AnswerValue, ParameterSpec, ParameterType, RawAnswer, Secret};
pub use task::{Completion, HumanTask, Status, TaskDefinition, TaskHandle, WorkItemId};
pub use value::{ResultMap, Value};

/// Result type for task operations
pub type Result<T> = std::result::Result<T, TaskError>;
