//! Workflow Initializer
//!
//! Turns a raw batch of health events into one workflow: expands
//! multi-account events, groups them per account, resolves recipients,
//! and fans out one analysis task per account onto the task queue. The
//! returned run carries the total the completion coordinator counts
//! against.

use std::sync::Arc;

use chrono::Utc;

use crate::{
    error::AppResult,
    events::{self, HealthEvent, UNKNOWN_ACCOUNT},
    mapping::AccountMapping,
    queue::MessageQueue,
    workflow::{generate_workflow_id, AnalysisTask, WorkflowRun},
};

pub struct WorkflowInitializer {
    task_queue: Arc<dyn MessageQueue>,
    excluded_services: Vec<String>,
}

impl WorkflowInitializer {
    pub fn new(task_queue: Arc<dyn MessageQueue>, excluded_services: Vec<String>) -> Self {
        Self {
            task_queue,
            excluded_services,
        }
    }

    /// Create a run and enqueue its per-account tasks. A batch that
    /// yields no attributable accounts produces an empty run, which
    /// completes immediately without dispatch.
    pub async fn initialize(
        &self,
        events: Vec<HealthEvent>,
        mapping: &AccountMapping,
    ) -> AppResult<WorkflowRun> {
        let workflow_id = generate_workflow_id();
        tracing::info!("Initializing workflow {}", workflow_id);

        let expanded = events::expand_by_account(events);
        let total_events = expanded.len();
        let grouped = events::group_by_account(expanded);

        let mut account_groups = Vec::new();
        for (account_id, account_events) in grouped {
            if account_id == UNKNOWN_ACCOUNT {
                tracing::warn!(
                    "Skipping {} events with unknown account attribution",
                    account_events.len()
                );
                continue;
            }
            account_groups.push((account_id, account_events));
        }

        let total_accounts = account_groups.len();
        tracing::info!(
            "Prepared {} accounts from {} events for workflow {}",
            total_accounts,
            total_events,
            workflow_id
        );

        for (account_id, account_events) in account_groups {
            let processed_events = events::preprocess(account_events, &self.excluded_services);

            let task = AnalysisTask {
                workflow_id: workflow_id.clone(),
                account_id: account_id.clone(),
                email_mapping: mapping.email_for(&account_id).map(String::from),
                event_count: processed_events.len(),
                processed_events,
                total_accounts,
            };

            let message = task.to_message()?;
            self.task_queue.send(message).await?;
            tracing::debug!(
                "Enqueued analysis task for account {} ({} events)",
                account_id,
                task.event_count
            );
        }

        Ok(WorkflowRun {
            workflow_id,
            total_accounts,
            created_at: Utc::now(),
        })
    }
}
