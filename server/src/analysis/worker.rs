//! AI Analysis Worker
//!
//! Consumes per-account analysis tasks from the task queue. Every task
//! ends with a persisted result — model-derived when possible, a
//! placeholder otherwise — because the completion coordinator counts
//! rows, and a task that never writes would stall the whole workflow.
//!
//! Settlement rules: acknowledge only after the result is persisted;
//! leave a delivery unsettled to force redelivery; once the redelivery
//! ceiling is hit, persist a placeholder and acknowledge no matter
//! what.

use std::sync::Arc;

use tokio::time::{interval, sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::{
    analysis::{placeholder::placeholder_report, AnalysisReport, AnalysisSource},
    error::AppResult,
    observability::WorkflowTracker,
    prompt::{
        self,
        parser::{parse_analysis_response, ParseMethod},
        AiClient, GenerationParams,
    },
    queue::{Delivery, MessageQueue},
    rate_limiter::RateLimiter,
    store::{ResultPayload, ResultStatus, ResultStore, StoredResult},
    util::{ttl_from_days, unix_now},
    workflow::AnalysisTask,
};

#[derive(Debug, Clone)]
pub struct AnalysisWorkerConfig {
    /// Redelivery ceiling before a task is settled with a placeholder.
    pub max_retries: u32,
    pub ttl_days: i64,
    /// AI call attempts inside a single task delivery.
    pub call_max_attempts: u32,
    /// Route every task straight to a test placeholder.
    pub skip_analysis: bool,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

enum Outcome {
    Ack,
    Redeliver,
}

#[derive(Clone)]
pub struct AnalysisWorker {
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn ResultStore>,
    limiter: RateLimiter,
    ai_client: Arc<dyn AiClient>,
    params: GenerationParams,
    tracker: WorkflowTracker,
    config: AnalysisWorkerConfig,
}

impl AnalysisWorker {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn ResultStore>,
        limiter: RateLimiter,
        ai_client: Arc<dyn AiClient>,
        params: GenerationParams,
        tracker: WorkflowTracker,
        config: AnalysisWorkerConfig,
    ) -> Self {
        Self {
            queue,
            store,
            limiter,
            ai_client,
            params,
            tracker,
            config,
        }
    }

    /// Main processing loop.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        tracing::info!(
            "Analysis worker started (batch: {}, max retries: {})",
            self.config.batch_size,
            self.config.max_retries
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Analysis worker shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.process_batch().await {
                        tracing::error!("Analysis batch failed: {}", e);
                    }
                }
            }
        }
    }

    /// Take one batch from the task queue and settle every delivery.
    pub async fn process_batch(&self) -> AppResult<usize> {
        let deliveries = self.queue.receive(self.config.batch_size).await?;
        if deliveries.is_empty() {
            return Ok(0);
        }

        let count = deliveries.len();
        for delivery in deliveries {
            match self.handle_delivery(&delivery).await {
                Ok(Outcome::Ack) => self.queue.ack(&delivery.receipt).await?,
                Ok(Outcome::Redeliver) => {
                    self.tracker.task_requeued();
                    self.queue.nack(&delivery.receipt).await?;
                }
                Err(e) => {
                    // Persist failed; the write may not have landed, so
                    // the task must come back.
                    tracing::error!("Analysis task failed, will redeliver: {}", e);
                    self.tracker.task_requeued();
                    self.queue.nack(&delivery.receipt).await?;
                }
            }
        }

        Ok(count)
    }

    async fn handle_delivery(&self, delivery: &Delivery) -> AppResult<Outcome> {
        let retry_count = delivery.retry_count();

        let task: AnalysisTask = match serde_json::from_str(&delivery.body) {
            Ok(task) => task,
            Err(e) => {
                // No account context to write a placeholder under;
                // bounded redelivery, then drop.
                if retry_count + 1 >= self.config.max_retries {
                    tracing::error!(
                        "Dropping undecodable analysis task after {} deliveries: {}",
                        delivery.receive_count,
                        e
                    );
                    return Ok(Outcome::Ack);
                }
                tracing::warn!("Undecodable analysis task, will retry: {}", e);
                return Ok(Outcome::Redeliver);
            }
        };

        tracing::info!(
            "Processing analysis for account {} (workflow {}, retry {})",
            task.account_id,
            task.workflow_id,
            retry_count
        );

        if self.config.skip_analysis {
            let report = placeholder_report(
                &task.account_id,
                &task.processed_events,
                AnalysisSource::TestPlaceholder,
                "analysis disabled by configuration",
            );
            self.persist(&task, report, retry_count).await?;
            self.tracker.placeholder_written();
            return Ok(Outcome::Ack);
        }

        if retry_count >= self.config.max_retries {
            tracing::warn!(
                "Task for account {} exceeded {} retries, writing placeholder",
                task.account_id,
                self.config.max_retries
            );
            let report = placeholder_report(
                &task.account_id,
                &task.processed_events,
                AnalysisSource::Placeholder,
                "Exceeded maximum retry attempts",
            );
            self.persist(&task, report, retry_count).await?;
            self.tracker.placeholder_written();
            return Ok(Outcome::Ack);
        }

        if !self.limiter.try_acquire().await.is_allowed() {
            if retry_count + 1 < self.config.max_retries {
                tracing::info!(
                    "Rate limit reached - task for account {} will be redelivered (attempt {})",
                    task.account_id,
                    retry_count + 1
                );
                return Ok(Outcome::Redeliver);
            }
            // Last allowed retry: settle with a placeholder instead of
            // bouncing forever against a closed limiter.
            let report = placeholder_report(
                &task.account_id,
                &task.processed_events,
                AnalysisSource::Placeholder,
                "Rate limit exceeded after maximum retries",
            );
            self.persist(&task, report, retry_count).await?;
            self.tracker.placeholder_written();
            return Ok(Outcome::Ack);
        }

        let report = self.analyze(&task).await;
        if report.manual_review_required {
            self.tracker.placeholder_written();
        } else {
            self.tracker.task_analyzed();
        }
        self.persist(&task, report, retry_count).await?;

        Ok(Outcome::Ack)
    }

    /// Call the AI service with bounded retries and exponential
    /// backoff. Never errors: every failure mode degrades to a
    /// placeholder so the caller always has something to persist.
    async fn analyze(&self, task: &AnalysisTask) -> AnalysisReport {
        if task.processed_events.is_empty() {
            return AnalysisReport {
                summary: "No health events found for analysis".to_string(),
                ..AnalysisReport::default()
            };
        }

        let prompt_text = prompt::analysis_prompt(&task.account_id, &task.processed_events);

        for attempt in 0..self.config.call_max_attempts {
            match self.ai_client.generate(&prompt_text, &self.params).await {
                Ok(text) => {
                    let (report, method) = parse_analysis_response(&text);
                    if method == ParseMethod::Failed {
                        tracing::warn!(
                            "Response for account {} survived no parsing stage",
                            task.account_id
                        );
                    } else {
                        tracing::debug!(
                            "Parsed response for account {} via {:?}",
                            task.account_id,
                            method
                        );
                    }
                    return report;
                }
                Err(e) if e.is_throttle() => {
                    tracing::warn!("AI service throttled analysis for {}", task.account_id);
                    self.limiter.note_throttled().await;
                    if attempt + 1 < self.config.call_max_attempts {
                        backoff(attempt).await;
                        continue;
                    }
                    return placeholder_report(
                        &task.account_id,
                        &task.processed_events,
                        AnalysisSource::Placeholder,
                        "Persistent AI service throttling",
                    );
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "Transient AI call failure for {} (attempt {}): {}",
                        task.account_id,
                        attempt + 1,
                        e
                    );
                    if attempt + 1 < self.config.call_max_attempts {
                        backoff(attempt).await;
                        continue;
                    }
                    return placeholder_report(
                        &task.account_id,
                        &task.processed_events,
                        AnalysisSource::Placeholder,
                        &format!(
                            "AI call failed after {} attempts: {}",
                            self.config.call_max_attempts, e
                        ),
                    );
                }
                Err(e) => {
                    // Categorized service error; retrying will not
                    // change the answer.
                    tracing::error!("AI service error for {}: {}", task.account_id, e);
                    return placeholder_report(
                        &task.account_id,
                        &task.processed_events,
                        AnalysisSource::Placeholder,
                        &format!("AI service error: {}", e),
                    );
                }
            }
        }

        placeholder_report(
            &task.account_id,
            &task.processed_events,
            AnalysisSource::Placeholder,
            "AI analysis failed after multiple retry attempts",
        )
    }

    async fn persist(
        &self,
        task: &AnalysisTask,
        mut report: AnalysisReport,
        retry_count: u32,
    ) -> AppResult<()> {
        report.retry_count = retry_count;
        let placeholder = report.manual_review_required;

        self.store
            .put_result(StoredResult {
                workflow_id: task.workflow_id.clone(),
                account_id: task.account_id.clone(),
                status: ResultStatus::Completed,
                payload: ResultPayload {
                    analysis: report,
                    email_mapping: task.email_mapping.clone(),
                    processed_events: task.processed_events.clone(),
                    event_count: task.event_count,
                },
                written_at: unix_now(),
                ttl: ttl_from_days(self.config.ttl_days),
            })
            .await?;

        if placeholder {
            tracing::info!(
                "Stored placeholder analysis for account {} (workflow {})",
                task.account_id,
                task.workflow_id
            );
        } else {
            tracing::info!(
                "Stored analysis for account {} (workflow {})",
                task.account_id,
                task.workflow_id
            );
        }

        Ok(())
    }
}

async fn backoff(attempt: u32) {
    let wait = Duration::from_secs(2u64.pow(attempt));
    tracing::info!("Backing off {}s before AI retry", wait.as_secs());
    sleep(wait).await;
}
