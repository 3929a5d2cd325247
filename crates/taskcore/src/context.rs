use crate::{Permission, Result, TaskError, TaskHandle, WorkItemId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one run of a workflow-bearing job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId {
    pub job: String,
    pub number: u32,
}

impl RunId {
    pub fn new(job: impl Into<String>, number: u32) -> Self {
        Self {
            job: job.into(),
            number,
        }
    }

    pub fn url(&self) -> String {
        format!("job/{}/{}/", self.job, self.number)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.number)
    }
}

/// The run that owns a set of human tasks.
///
/// Tasks never hold a run; they keep its [`RunId`] and are handed the
/// context by whoever looked them up.
#[async_trait]
pub trait RunContext: Send + Sync {
    fn run_id(&self) -> &RunId;

    /// Capability check against this run's access scope.
    fn has_permission(&self, identity: Option<&str>, permission: Permission) -> bool;

    fn check_permission(&self, identity: Option<&str>, permission: Permission) -> Result<()> {
        if self.has_permission(identity, permission) {
            Ok(())
        } else {
            Err(TaskError::PermissionDenied {
                identity: identity.map(str::to_string),
                permission,
            })
        }
    }

    /// Persist the run and every task it owns.
    async fn save(&self) -> Result<()>;

    async fn human_task(&self, work_item_id: WorkItemId) -> Option<TaskHandle>;
}
