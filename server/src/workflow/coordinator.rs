//! Completion Coordinator
//!
//! Detects when every account of a workflow has written its result and
//! triggers notification dispatch exactly once. Each invocation is a
//! single check; pacing and retry budgets belong to the caller (the
//! poll loop below is that caller in this service). Idempotency comes
//! from the queued marker: however many times the coordinator runs, or
//! however many run concurrently, one notification set goes out.

use std::sync::Arc;

use tokio::time::{sleep, Duration};

use crate::{
    error::AppResult,
    observability::WorkflowTracker,
    store::{MarkerKind, ResultStore},
    workflow::{NotificationDispatcher, WorkflowRun},
};

/// Outcome of one coordinator invocation.
#[derive(Debug)]
pub enum CompletionStatus {
    /// Everything reported and this invocation enqueued the
    /// notification set.
    Dispatched { queued: usize },
    /// The notification set was already enqueued, by an earlier
    /// invocation or by a concurrent one that won the marker.
    AlreadyDispatched,
    /// Not all accounts have reported; invoke again later.
    NotReady { completed: usize, total: usize },
}

impl CompletionStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, CompletionStatus::NotReady { .. })
    }
}

#[derive(Clone)]
pub struct CompletionCoordinator {
    store: Arc<dyn ResultStore>,
    dispatcher: NotificationDispatcher,
    tracker: WorkflowTracker,
}

impl CompletionCoordinator {
    pub fn new(
        store: Arc<dyn ResultStore>,
        dispatcher: NotificationDispatcher,
        tracker: WorkflowTracker,
    ) -> Self {
        Self {
            store,
            dispatcher,
            tracker,
        }
    }

    /// One completion check. Never sleeps internally.
    pub async fn check_and_dispatch(&self, run: &WorkflowRun) -> AppResult<CompletionStatus> {
        // Marker first: a dispatched workflow never re-reads its rows.
        if self
            .store
            .marker_exists(&run.workflow_id, MarkerKind::EmailQueued)
            .await?
        {
            tracing::info!(
                "Emails already queued for workflow {}, nothing to do",
                run.workflow_id
            );
            return Ok(CompletionStatus::AlreadyDispatched);
        }

        let completed = self.store.count(&run.workflow_id).await?;
        tracing::info!(
            "Workflow {}: {}/{} accounts completed",
            run.workflow_id,
            completed,
            run.total_accounts
        );

        if completed < run.total_accounts {
            return Ok(CompletionStatus::NotReady {
                completed,
                total: run.total_accounts,
            });
        }

        let results = self.store.list(&run.workflow_id).await?;
        let summary = self.dispatcher.dispatch(&run.workflow_id, results).await?;

        if !summary.marker_created {
            // A concurrent invocation marked the workflow first. The
            // queue already deduplicated the messages, so the outcome
            // is correct either way.
            self.tracker.race_detected();
            tracing::warn!(
                "Concurrent dispatch detected for workflow {}, the other invocation won",
                run.workflow_id
            );
            return Ok(CompletionStatus::AlreadyDispatched);
        }

        self.tracker.workflow_completed();
        Ok(CompletionStatus::Dispatched {
            queued: summary.queued,
        })
    }

    /// The retrying orchestrator: invoke the coordinator until the
    /// workflow settles or the attempt budget runs out. Transient
    /// store errors consume an attempt and are retried like NotReady.
    pub async fn poll_until_dispatched(
        &self,
        run: &WorkflowRun,
        interval_secs: u64,
        max_attempts: u32,
    ) -> AppResult<CompletionStatus> {
        let mut last = CompletionStatus::NotReady {
            completed: 0,
            total: run.total_accounts,
        };

        for attempt in 1..=max_attempts {
            match self.check_and_dispatch(run).await {
                Ok(status) if status.is_settled() => return Ok(status),
                Ok(status) => {
                    tracing::info!(
                        "Workflow {} not ready (attempt {}/{}): {:?}",
                        run.workflow_id,
                        attempt,
                        max_attempts,
                        status
                    );
                    last = status;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "Completion check for {} failed (attempt {}/{}): {}",
                        run.workflow_id,
                        attempt,
                        max_attempts,
                        e
                    );
                }
                Err(e) => return Err(e),
            }

            if attempt < max_attempts {
                sleep(Duration::from_secs(interval_secs)).await;
            }
        }

        tracing::error!(
            "Workflow {} never completed within {} attempts",
            run.workflow_id,
            max_attempts
        );
        Ok(last)
    }
}
