//! Workflow Cleanup
//!
//! Best-effort removal of a workflow's rows after dispatch. Failures
//! are logged and swallowed; every row carries a TTL, so storage is
//! bounded either way.

use crate::store::ResultStore;

/// Delete a workflow's result rows. Returns how many were removed.
pub async fn cleanup_workflow(store: &dyn ResultStore, workflow_id: &str) -> usize {
    match store.delete_all(workflow_id).await {
        Ok(removed) => {
            tracing::info!("Cleaned up {} rows for workflow {}", removed, workflow_id);
            removed
        }
        Err(e) => {
            tracing::warn!(
                "Cleanup for workflow {} failed, TTL will reclaim the rows: {}",
                workflow_id,
                e
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::testing::common::make_result;

    #[tokio::test]
    async fn removes_rows_and_tolerates_outages() {
        let store = InMemoryStore::new();
        store
            .put_result(make_result("wf-1", "111122223333"))
            .await
            .unwrap();
        store
            .put_result(make_result("wf-1", "444455556666"))
            .await
            .unwrap();

        assert_eq!(cleanup_workflow(&store, "wf-1").await, 2);
        assert_eq!(store.count("wf-1").await.unwrap(), 0);

        store.set_unavailable(true);
        // Outage is not an error, just zero rows removed.
        assert_eq!(cleanup_workflow(&store, "wf-1").await, 0);
    }
}
