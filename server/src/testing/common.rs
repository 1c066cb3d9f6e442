//! Shared test fixtures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::analysis::AnalysisReport;
use crate::error::{AppError, AppResult};
use crate::events::{preprocess, HealthEvent};
use crate::prompt::{AiClient, GenerationParams};
use crate::store::{ResultPayload, ResultStatus, StoredResult};
use crate::util::{ttl_from_days, unix_now};
use crate::workflow::AnalysisTask;

pub fn make_event(account_id: &str, service: &str, category: &str, status: &str) -> HealthEvent {
    HealthEvent {
        arn: format!("arn:test:health:{}:{}:event", service, account_id),
        service: service.to_string(),
        event_type_code: format!("{}_OPERATIONAL_ISSUE", service.to_uppercase()),
        event_type_category: category.to_string(),
        region: "us-east-1".to_string(),
        start_time: None,
        end_time: None,
        last_updated_time: None,
        status_code: status.to_string(),
        event_description: Some(format!("Test event for {} on {}", account_id, service)),
        account_id: Some(account_id.to_string()),
    }
}

pub fn make_result(workflow_id: &str, account_id: &str) -> StoredResult {
    make_result_with(workflow_id, account_id, None, AnalysisReport::default())
}

pub fn make_result_with(
    workflow_id: &str,
    account_id: &str,
    email_mapping: Option<&str>,
    analysis: AnalysisReport,
) -> StoredResult {
    let processed_events = preprocess(vec![make_event(account_id, "EC2", "issue", "open")], &[]);
    StoredResult {
        workflow_id: workflow_id.to_string(),
        account_id: account_id.to_string(),
        status: ResultStatus::Completed,
        payload: ResultPayload {
            analysis,
            email_mapping: email_mapping.map(String::from),
            event_count: processed_events.len(),
            processed_events,
        },
        written_at: unix_now(),
        ttl: ttl_from_days(7),
    }
}

pub fn make_task(workflow_id: &str, account_id: &str, total_accounts: usize) -> AnalysisTask {
    let processed_events = preprocess(vec![make_event(account_id, "EC2", "issue", "open")], &[]);
    AnalysisTask {
        workflow_id: workflow_id.to_string(),
        account_id: account_id.to_string(),
        email_mapping: None,
        event_count: processed_events.len(),
        processed_events,
        total_accounts,
    }
}

/// Delivery double: records sent messages, optionally failing with a
/// scripted error first.
pub struct MockDelivery {
    sent: Mutex<Vec<lettre::Message>>,
    failures: Mutex<VecDeque<crate::email::delivery::DeliveryError>>,
}

impl MockDelivery {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn failing_with(failures: Vec<crate::email::delivery::DeliveryError>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(failures.into_iter().collect()),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl crate::email::delivery::EmailDelivery for MockDelivery {
    async fn send(
        &self,
        message: &lettre::Message,
    ) -> Result<(), crate::email::delivery::DeliveryError> {
        if let Some(failure) = self.failures.lock().unwrap().pop_front() {
            return Err(failure);
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// AI client that plays back a script of canned outcomes.
pub struct ScriptedAiClient {
    responses: Mutex<VecDeque<AppResult<String>>>,
    calls: AtomicU64,
}

impl ScriptedAiClient {
    pub fn new(responses: Vec<AppResult<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Relaxed)
    }
}

#[async_trait]
impl AiClient for ScriptedAiClient {
    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> AppResult<String> {
        self.calls.fetch_add(1, Relaxed);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::AiService("script exhausted".to_string())))
    }
}
