//! Human task runtime
//!
//! This crate keeps the runs that own human tasks, indexes tasks by work
//! item id, persists runs to disk, and talks to the workflow engine.

mod access;
mod directory;
mod error;
mod management;
mod registry;
mod run;
mod runtime;

pub use access::PermissionTable;
pub use directory::TaskDirectory;
pub use error::RuntimeError;
pub use management::{ManagementConfig, Script};
pub use registry::{SessionId, SessionRegistry, WorkItemOutcome};
pub use run::{Run, RunRecord, RunStore};
pub use runtime::{RuntimeConfig, TaskRuntime};
