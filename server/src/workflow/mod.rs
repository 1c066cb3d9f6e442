//! Workflow coordination.
//!
//! One workflow is a single end-to-end analysis run: the initializer
//! fans out per-account tasks, the coordinator detects completion and
//! triggers dispatch exactly once, the dispatcher groups and enqueues
//! notifications, and cleanup reclaims the rows afterwards.

pub mod cleanup;
pub mod coordinator;
pub mod dispatcher;
pub mod initializer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::ProcessedEvent;
use crate::queue::OutgoingMessage;

pub use coordinator::{CompletionCoordinator, CompletionStatus};
pub use dispatcher::NotificationDispatcher;
pub use initializer::WorkflowInitializer;

/// One end-to-end run. Immutable once created; everything downstream
/// only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub total_accounts: usize,
    pub created_at: DateTime<Utc>,
}

/// Timestamp-derived workflow ID, unique per run at second
/// granularity, readable in logs and store keys.
pub fn generate_workflow_id() -> String {
    let now = Utc::now();
    format!("{}-{}", now.format("%Y-%m-%d-%H-%M-%S"), now.timestamp())
}

/// Unit of fan-out: everything one analysis worker invocation needs
/// for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub workflow_id: String,
    pub account_id: String,
    pub email_mapping: Option<String>,
    pub processed_events: Vec<ProcessedEvent>,
    pub event_count: usize,
    /// Passed through for completion tracking.
    pub total_accounts: usize,
}

impl AnalysisTask {
    pub fn to_message(&self) -> serde_json::Result<OutgoingMessage> {
        Ok(OutgoingMessage {
            group_id: format!("analysis-{}", self.account_id),
            dedup_id: format!("{}-{}-analysis", self.workflow_id, self.account_id),
            body: serde_json::to_string(self)?,
        })
    }
}
