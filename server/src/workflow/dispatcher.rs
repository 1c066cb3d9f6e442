//! Notification Dispatcher
//!
//! Groups a completed workflow's results by recipient, adds the master
//! report group, and enqueues one deduplicated message per group. The
//! queue's dedup window and the queued marker together make dispatch
//! idempotent: the marker stops a later coordinator invocation from
//! re-enqueueing, and the dedup IDs absorb the race where two
//! invocations dispatch at the same time.

use std::sync::Arc;

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::{
    email::NotificationPayload,
    error::AppResult,
    observability::WorkflowTracker,
    queue::{MessageQueue, OutgoingMessage},
    store::{MarkerKind, ResultStore, StoredResult},
    util::ttl_from_days,
};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub default_recipients: Vec<String>,
    /// Skip account-specific groups, queue only the master report.
    pub master_report_only: bool,
    pub ttl_days: i64,
}

#[derive(Debug)]
pub struct DispatchSummary {
    /// Messages actually placed on the queue (dedup-swallowed sends
    /// are not counted).
    pub queued: usize,
    /// Whether this invocation won the queued-marker create.
    pub marker_created: bool,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    email_queue: Arc<dyn MessageQueue>,
    store: Arc<dyn ResultStore>,
    tracker: WorkflowTracker,
    config: DispatcherConfig,
}

impl NotificationDispatcher {
    pub fn new(
        email_queue: Arc<dyn MessageQueue>,
        store: Arc<dyn ResultStore>,
        tracker: WorkflowTracker,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            email_queue,
            store,
            tracker,
            config,
        }
    }

    /// Enqueue the notification set for a completed workflow, then
    /// write the queued marker. Individual group failures are logged
    /// and skipped; the queue dedup window covers their retry on the
    /// next coordinator invocation.
    pub async fn dispatch(
        &self,
        workflow_id: &str,
        results: Vec<StoredResult>,
    ) -> AppResult<DispatchSummary> {
        let mut queued = 0usize;

        if self.config.master_report_only {
            tracing::info!("Master-report-only mode, skipping account-specific emails");
        } else {
            let groups = group_results_by_email(&results);
            tracing::info!(
                "Grouped {} results into {} recipient groups",
                results.len(),
                groups.len()
            );

            for (email_address, account_results) in groups {
                let account_ids: Vec<&str> =
                    account_results.iter().map(|r| r.account_id.as_str()).collect();
                let dedup_id = dedup_id(workflow_id, &email_address, &account_ids, "account");

                let payload = NotificationPayload::AccountSpecific {
                    workflow_id: workflow_id.to_string(),
                    email_address: email_address.clone(),
                    account_results: account_results.into_iter().cloned().collect(),
                };

                match self.enqueue(&email_address, dedup_id, &payload).await {
                    Ok(true) => {
                        queued += 1;
                        tracing::info!("Queued account-specific email for {}", email_address);
                    }
                    Ok(false) => {
                        tracing::info!(
                            "Dedup window absorbed account-specific email for {}",
                            email_address
                        );
                    }
                    Err(e) => {
                        tracing::error!("Failed to queue email for {}: {}", email_address, e);
                    }
                }
            }
        }

        if self.config.default_recipients.is_empty() {
            tracing::warn!("No default recipients configured, skipping master report");
        } else {
            let account_ids: Vec<&str> = results.iter().map(|r| r.account_id.as_str()).collect();
            let dedup_id = dedup_id(workflow_id, "master", &account_ids, "master-report");

            let payload = NotificationPayload::MasterReport {
                workflow_id: workflow_id.to_string(),
                email_addresses: self.config.default_recipients.clone(),
                all_results: results.clone(),
            };

            match self.enqueue("master-report", dedup_id, &payload).await {
                Ok(true) => {
                    queued += 1;
                    tracing::info!(
                        "Queued master report for {} recipients",
                        self.config.default_recipients.len()
                    );
                }
                Ok(false) => {
                    tracing::info!("Dedup window absorbed the master report");
                }
                Err(e) => {
                    tracing::error!("Failed to queue master report: {}", e);
                }
            }
        }

        self.tracker.notifications_queued(queued as u64);

        // Conditional create; a lost race means a concurrent dispatch
        // already marked the workflow.
        let marker_created = match self
            .store
            .create_marker(
                workflow_id,
                MarkerKind::EmailQueued,
                ttl_from_days(self.config.ttl_days),
            )
            .await
        {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!("Could not write queued marker for {}: {}", workflow_id, e);
                false
            }
        };

        Ok(DispatchSummary {
            queued,
            marker_created,
        })
    }

    async fn enqueue(
        &self,
        group: &str,
        dedup_id: String,
        payload: &NotificationPayload,
    ) -> AppResult<bool> {
        let message = OutgoingMessage {
            group_id: format!("email-{}", group),
            dedup_id,
            body: serde_json::to_string(payload)?,
        };
        Ok(self.email_queue.send(message).await?.is_some())
    }
}

/// Group results by their mapped recipient. Results with no mapping
/// are covered by the master report only.
fn group_results_by_email(results: &[StoredResult]) -> IndexMap<String, Vec<&StoredResult>> {
    let mut groups: IndexMap<String, Vec<&StoredResult>> = IndexMap::new();

    for result in results {
        match result.payload.email_mapping.as_deref() {
            Some(email) if !email.is_empty() => {
                groups.entry(email.to_string()).or_default().push(result);
            }
            _ => {
                tracing::warn!("No email mapping for account {}", result.account_id);
            }
        }
    }

    groups
}

/// Deterministic dedup ID from the workflow, recipient and content
/// fingerprint, so identical content never enqueues twice inside the
/// dedup window.
fn dedup_id(workflow_id: &str, recipient: &str, account_ids: &[&str], suffix: &str) -> String {
    let mut sorted = account_ids.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(workflow_id.as_bytes());
    hasher.update(recipient.as_bytes());
    for account_id in sorted {
        hasher.update(account_id.as_bytes());
    }
    let fingerprint = format!("{:x}", hasher.finalize());

    format!("{}-{}-{}-{}", workflow_id, recipient, &fingerprint[..8], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryStore;
    use crate::testing::common::{make_result, make_result_with};
    use crate::analysis::AnalysisReport;

    fn dispatcher(
        master_only: bool,
    ) -> (Arc<InMemoryQueue>, Arc<InMemoryStore>, NotificationDispatcher) {
        let queue = Arc::new(InMemoryQueue::new(3600));
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = NotificationDispatcher::new(
            queue.clone(),
            store.clone(),
            WorkflowTracker::new(),
            DispatcherConfig {
                default_recipients: vec!["admin@example.com".to_string()],
                master_report_only: master_only,
                ttl_days: 7,
            },
        );
        (queue, store, dispatcher)
    }

    fn results() -> Vec<StoredResult> {
        vec![
            make_result_with(
                "wf-1",
                "111122223333",
                Some("ops@example.com"),
                AnalysisReport::default(),
            ),
            make_result_with(
                "wf-1",
                "444455556666",
                Some("ops@example.com"),
                AnalysisReport::default(),
            ),
            make_result_with(
                "wf-1",
                "777788889999",
                Some("dev@example.com"),
                AnalysisReport::default(),
            ),
        ]
    }

    #[tokio::test]
    async fn dispatch_queues_one_message_per_group_plus_master() {
        let (queue, store, dispatcher) = dispatcher(false);

        let summary = dispatcher.dispatch("wf-1", results()).await.unwrap();

        // ops (two accounts), dev, master.
        assert_eq!(summary.queued, 3);
        assert!(summary.marker_created);
        assert_eq!(queue.pending().await.unwrap(), 3);
        assert!(store
            .marker_exists("wf-1", MarkerKind::EmailQueued)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn redispatch_is_absorbed_by_the_dedup_window() {
        let (queue, _store, dispatcher) = dispatcher(false);

        let first = dispatcher.dispatch("wf-1", results()).await.unwrap();
        assert_eq!(first.queued, 3);

        // Same content again: everything is swallowed and the marker
        // create loses.
        let second = dispatcher.dispatch("wf-1", results()).await.unwrap();
        assert_eq!(second.queued, 0);
        assert!(!second.marker_created);
        assert_eq!(queue.pending().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn unmapped_accounts_only_reach_the_master_report() {
        let (queue, _store, dispatcher) = dispatcher(false);

        let summary = dispatcher
            .dispatch("wf-1", vec![make_result("wf-1", "111122223333")])
            .await
            .unwrap();

        // No recipient groups, master only.
        assert_eq!(summary.queued, 1);
        assert_eq!(queue.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn master_report_only_skips_account_groups() {
        let (queue, _store, dispatcher) = dispatcher(true);

        let summary = dispatcher.dispatch("wf-1", results()).await.unwrap();

        assert_eq!(summary.queued, 1);
        let batch = queue.receive(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch[0].body.contains("master_report"));
    }

    #[test]
    fn dedup_ids_are_order_insensitive_and_content_sensitive() {
        let a = dedup_id("wf-1", "ops@example.com", &["1", "2"], "account");
        let b = dedup_id("wf-1", "ops@example.com", &["2", "1"], "account");
        let c = dedup_id("wf-1", "ops@example.com", &["1", "3"], "account");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("wf-1-ops@example.com-"));
        assert!(a.ends_with("-account"));
    }
}
