//! Email Sender
//!
//! Consumes notification messages at-least-once and delivers them.
//! Redelivery after a successful send whose acknowledgment was lost is
//! absorbed by the sent marker; messages that keep failing are dropped
//! once the redelivery ceiling is hit so the queue never spins
//! forever on one email.

use std::sync::Arc;

use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    email::{
        delivery::{DeliveryError, EmailDelivery},
        report, NotificationPayload,
    },
    error::AppResult,
    observability::WorkflowTracker,
    queue::{Delivery, MessageQueue},
    store::{MarkerKind, ResultStore},
    util::ttl_from_days,
};

#[derive(Debug, Clone)]
pub struct EmailSenderConfig {
    pub max_retries: u32,
    pub ttl_days: i64,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub from: String,
    pub account_cc: Option<String>,
    pub customer_name: String,
    /// Drop account-specific emails, deliver only master reports.
    pub master_report_only: bool,
}

enum Outcome {
    Ack,
    Redeliver,
}

#[derive(Clone)]
pub struct EmailSender {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn ResultStore>,
    delivery: Arc<dyn EmailDelivery>,
    tracker: WorkflowTracker,
    config: EmailSenderConfig,
}

impl EmailSender {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn ResultStore>,
        delivery: Arc<dyn EmailDelivery>,
        tracker: WorkflowTracker,
        config: EmailSenderConfig,
    ) -> Self {
        Self {
            queue,
            store,
            delivery,
            tracker,
            config,
        }
    }

    /// Main processing loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        tracing::info!(
            "Email sender started (batch: {}, max retries: {})",
            self.config.batch_size,
            self.config.max_retries
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Email sender shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.process_batch().await {
                        tracing::error!("Email batch failed: {}", e);
                    }
                }
            }
        }
    }

    /// Take one batch of notifications and settle every delivery.
    pub async fn process_batch(&self) -> AppResult<usize> {
        let deliveries = self.queue.receive(self.config.batch_size).await?;
        if deliveries.is_empty() {
            return Ok(0);
        }

        let count = deliveries.len();

        // Emails in one batch are independent; send them in parallel
        // and settle each delivery by its own outcome.
        let outcomes = futures::future::join_all(
            deliveries.iter().map(|delivery| self.handle_delivery(delivery)),
        )
        .await;

        for (delivery, outcome) in deliveries.iter().zip(outcomes) {
            match outcome {
                Outcome::Ack => self.queue.ack(&delivery.receipt).await?,
                Outcome::Redeliver => self.queue.nack(&delivery.receipt).await?,
            }
        }

        Ok(count)
    }

    async fn handle_delivery(&self, delivery: &Delivery) -> Outcome {
        let retry_count = delivery.retry_count();

        if retry_count >= self.config.max_retries {
            tracing::error!(
                "Notification exceeded {} retries, dropping to stop redelivery",
                self.config.max_retries
            );
            self.tracker.email_dropped();
            return Outcome::Ack;
        }

        let payload: NotificationPayload = match serde_json::from_str(&delivery.body) {
            Ok(payload) => payload,
            Err(e) => {
                if retry_count + 1 >= self.config.max_retries {
                    tracing::error!(
                        "Dropping undecodable notification after {} deliveries: {}",
                        delivery.receive_count,
                        e
                    );
                    self.tracker.email_dropped();
                    return Outcome::Ack;
                }
                tracing::warn!("Undecodable notification, will retry: {}", e);
                return Outcome::Redeliver;
            }
        };

        if self.config.master_report_only && !payload.is_master() {
            tracing::info!("Master-report-only mode, skipping account-specific email");
            return Outcome::Ack;
        }

        let sent_key = payload.sent_key();

        // Redelivery after a send whose ack was lost: the marker says
        // it already went out. Check errors default to "not sent";
        // sending twice beats never sending.
        let already_sent = self
            .store
            .marker_exists(&sent_key, MarkerKind::EmailSent)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Sent-marker check failed for {}: {}", sent_key, e);
                false
            });
        if already_sent {
            tracing::info!("Email {} already sent, skipping duplicate", sent_key);
            self.tracker.email_deduplicated();
            return Outcome::Ack;
        }

        let rendered = report::render_notification(&payload, &self.config.customer_name);
        let recipients = payload.recipients();
        let cc = if payload.is_master() {
            None
        } else {
            self.config.account_cc.as_deref()
        };

        let message = match report::build_message(&rendered, &self.config.from, &recipients, cc) {
            Ok(message) => message,
            Err(e) => {
                // Unbuildable message never improves with redelivery.
                tracing::error!("Could not build email {}: {}", sent_key, e);
                self.tracker.email_dropped();
                return Outcome::Ack;
            }
        };

        match self.delivery.send(&message).await {
            Ok(()) => {
                let marked = self
                    .store
                    .create_marker(
                        &sent_key,
                        MarkerKind::EmailSent,
                        ttl_from_days(self.config.ttl_days),
                    )
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!("Could not write sent marker for {}: {}", sent_key, e);
                        false
                    });
                if !marked {
                    self.tracker.race_detected();
                    tracing::warn!("Sent marker for {} already existed", sent_key);
                }

                self.tracker.email_sent();
                tracing::info!(
                    "Sent {} email to {} recipient(s)",
                    if payload.is_master() { "master report" } else { "account-specific" },
                    recipients.len()
                );
                Outcome::Ack
            }
            Err(DeliveryError::RecipientUnverified(reason)) => {
                tracing::error!(
                    "Recipient unverified for {}, dropping without retry: {}",
                    sent_key,
                    reason
                );
                self.tracker.email_dropped();
                Outcome::Ack
            }
            Err(e) => {
                if retry_count + 1 < self.config.max_retries {
                    tracing::warn!(
                        "Failed to send {} (attempt {}/{}): {}",
                        sent_key,
                        retry_count + 1,
                        self.config.max_retries,
                        e
                    );
                    Outcome::Redeliver
                } else {
                    tracing::error!(
                        "Failed to send {} after {} attempts, dropping: {}",
                        sent_key,
                        self.config.max_retries,
                        e
                    );
                    self.tracker.email_dropped();
                    Outcome::Ack
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisReport;
    use crate::queue::{InMemoryQueue, OutgoingMessage};
    use crate::store::InMemoryStore;
    use crate::testing::common::{make_result_with, MockDelivery};

    fn sender_with(
        delivery: MockDelivery,
        master_only: bool,
    ) -> (
        Arc<InMemoryQueue>,
        Arc<InMemoryStore>,
        Arc<MockDelivery>,
        EmailSender,
    ) {
        let queue = Arc::new(InMemoryQueue::new(3600));
        let store = Arc::new(InMemoryStore::new());
        let delivery = Arc::new(delivery);

        let sender = EmailSender::new(
            queue.clone(),
            store.clone(),
            delivery.clone(),
            WorkflowTracker::new(),
            EmailSenderConfig {
                max_retries: 3,
                ttl_days: 7,
                batch_size: 10,
                poll_interval_ms: 100,
                from: "Healthwatch <noreply@example.com>".to_string(),
                account_cc: None,
                customer_name: "Acme".to_string(),
                master_report_only: master_only,
            },
        );

        (queue, store, delivery, sender)
    }

    fn account_payload() -> NotificationPayload {
        NotificationPayload::AccountSpecific {
            workflow_id: "wf-1".to_string(),
            email_address: "ops@example.com".to_string(),
            account_results: vec![make_result_with(
                "wf-1",
                "111122223333",
                Some("ops@example.com"),
                AnalysisReport::default(),
            )],
        }
    }

    async fn enqueue(queue: &InMemoryQueue, payload: &NotificationPayload) {
        queue
            .send(OutgoingMessage {
                group_id: "email".to_string(),
                dedup_id: payload.sent_key(),
                body: serde_json::to_string(payload).unwrap(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sends_and_writes_the_sent_marker() {
        let (queue, store, delivery, sender) = sender_with(MockDelivery::new(), false);
        enqueue(&queue, &account_payload()).await;

        assert_eq!(sender.process_batch().await.unwrap(), 1);

        assert_eq!(delivery.sent_count(), 1);
        assert!(store
            .marker_exists("wf-1-ops@example.com-account", MarkerKind::EmailSent)
            .await
            .unwrap());
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn redelivery_after_lost_ack_is_deduplicated() {
        let (queue, store, delivery, sender) = sender_with(MockDelivery::new(), false);
        let payload = account_payload();

        // The previous invocation sent the email but its ack was lost.
        store
            .create_marker(
                &payload.sent_key(),
                MarkerKind::EmailSent,
                crate::util::ttl_from_days(7),
            )
            .await
            .unwrap();

        enqueue(&queue, &payload).await;
        sender.process_batch().await.unwrap();

        assert_eq!(delivery.sent_count(), 0);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let (queue, _store, delivery, sender) = sender_with(
            MockDelivery::failing_with(vec![DeliveryError::Other("smtp 451".to_string())]),
            false,
        );
        enqueue(&queue, &account_payload()).await;

        // First attempt fails and the message returns to the queue.
        sender.process_batch().await.unwrap();
        assert_eq!(delivery.sent_count(), 0);
        assert_eq!(queue.pending().await.unwrap(), 1);

        // Redelivery succeeds.
        sender.process_batch().await.unwrap();
        assert_eq!(delivery.sent_count(), 1);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn persistent_failure_is_dropped_at_the_ceiling() {
        let (queue, _store, delivery, sender) = sender_with(
            MockDelivery::failing_with(vec![
                DeliveryError::Other("smtp 451".to_string()),
                DeliveryError::Other("smtp 451".to_string()),
                DeliveryError::Other("smtp 451".to_string()),
            ]),
            false,
        );
        enqueue(&queue, &account_payload()).await;

        // Two redeliveries, then the third attempt gives up for good.
        sender.process_batch().await.unwrap();
        sender.process_batch().await.unwrap();
        sender.process_batch().await.unwrap();

        assert_eq!(delivery.sent_count(), 0);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unverified_recipient_is_never_retried() {
        let (queue, store, delivery, sender) = sender_with(
            MockDelivery::failing_with(vec![DeliveryError::RecipientUnverified(
                "ops@example.com is not verified".to_string(),
            )]),
            false,
        );
        let payload = account_payload();
        enqueue(&queue, &payload).await;

        sender.process_batch().await.unwrap();

        assert_eq!(delivery.sent_count(), 0);
        assert_eq!(queue.pending().await.unwrap(), 0);
        // Dropped, not sent: no marker.
        assert!(!store
            .marker_exists(&payload.sent_key(), MarkerKind::EmailSent)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn exhausted_redelivery_budget_drops_before_sending() {
        let (queue, _store, delivery, sender) = sender_with(MockDelivery::new(), false);
        enqueue(&queue, &account_payload()).await;

        for _ in 0..3 {
            let batch = queue.receive(1).await.unwrap();
            queue.nack(&batch[0].receipt).await.unwrap();
        }

        sender.process_batch().await.unwrap();

        assert_eq!(delivery.sent_count(), 0);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn master_report_only_skips_account_emails() {
        let (queue, _store, delivery, sender) = sender_with(MockDelivery::new(), true);
        enqueue(&queue, &account_payload()).await;

        let master = NotificationPayload::MasterReport {
            workflow_id: "wf-1".to_string(),
            email_addresses: vec!["admin@example.com".to_string()],
            all_results: vec![make_result_with(
                "wf-1",
                "111122223333",
                None,
                AnalysisReport::default(),
            )],
        };
        enqueue(&queue, &master).await;

        sender.process_batch().await.unwrap();

        // Only the master report went out.
        assert_eq!(delivery.sent_count(), 1);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }
}
