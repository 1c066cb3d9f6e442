//! Email notifications.
//!
//! The dispatcher enqueues [`NotificationPayload`] messages; the
//! sender consumes them, renders a report and hands the built message
//! to the delivery seam.

pub mod delivery;
pub mod report;
pub mod sender;

use serde::{Deserialize, Serialize};

use crate::store::StoredResult;

pub use sender::EmailSender;

/// One queued notification. Account-specific emails carry the results
/// mapped to a single recipient; the master report carries everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "email_type", rename_all = "snake_case")]
pub enum NotificationPayload {
    AccountSpecific {
        workflow_id: String,
        email_address: String,
        account_results: Vec<StoredResult>,
    },
    MasterReport {
        workflow_id: String,
        email_addresses: Vec<String>,
        all_results: Vec<StoredResult>,
    },
}

impl NotificationPayload {
    pub fn workflow_id(&self) -> &str {
        match self {
            NotificationPayload::AccountSpecific { workflow_id, .. } => workflow_id,
            NotificationPayload::MasterReport { workflow_id, .. } => workflow_id,
        }
    }

    /// Key under which the sent marker for this email lives. One send
    /// per recipient per workflow, regardless of redelivery.
    pub fn sent_key(&self) -> String {
        match self {
            NotificationPayload::AccountSpecific {
                workflow_id,
                email_address,
                ..
            } => format!("{}-{}-account", workflow_id, email_address),
            NotificationPayload::MasterReport { workflow_id, .. } => {
                format!("{}-master-report", workflow_id)
            }
        }
    }

    pub fn results(&self) -> &[StoredResult] {
        match self {
            NotificationPayload::AccountSpecific {
                account_results, ..
            } => account_results,
            NotificationPayload::MasterReport { all_results, .. } => all_results,
        }
    }

    pub fn recipients(&self) -> Vec<String> {
        match self {
            NotificationPayload::AccountSpecific { email_address, .. } => {
                vec![email_address.clone()]
            }
            NotificationPayload::MasterReport {
                email_addresses, ..
            } => email_addresses.clone(),
        }
    }

    pub fn is_master(&self) -> bool {
        matches!(self, NotificationPayload::MasterReport { .. })
    }
}
