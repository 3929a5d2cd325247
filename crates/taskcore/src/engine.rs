use crate::{EngineError, ResultMap, WorkItemId};
use async_trait::async_trait;

/// The workflow engine's side of a work item.
///
/// Implementations own the paused process instances; tasks only ever ask
/// them to resume or abort one.
#[async_trait]
pub trait WorkItemRegistry: Send + Sync {
    /// Resume the process waiting on `work_item_id` with the submitted results.
    async fn complete_work_item(
        &self,
        work_item_id: WorkItemId,
        results: ResultMap,
    ) -> Result<(), EngineError>;

    /// Abort the work item without results.
    async fn cancel_work_item(&self, work_item_id: WorkItemId) -> Result<(), EngineError>;
}
