//! Health event model and preprocessing.
//!
//! Events arrive from the provider's health feed with an optional
//! account attribution. Before analysis they are expanded per account,
//! filtered, severity-categorized and sorted so the most urgent events
//! lead every downstream prompt and report.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;

pub const UNKNOWN_ACCOUNT: &str = "unknown";

/// Supplies the raw event batch for a run. The provider's health feed
/// is resolved upstream of this service; deployments point this seam
/// at whatever drops the batch off.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch(&self) -> AppResult<Vec<HealthEvent>>;
}

/// Event batch read from a JSON file (an array of events, or an
/// object with an `events` array).
pub struct JsonFileEventSource {
    path: String,
}

impl JsonFileEventSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl EventSource for JsonFileEventSource {
    async fn fetch(&self) -> AppResult<Vec<HealthEvent>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| anyhow::anyhow!("could not read events file {}: {}", self.path, e))?;

        let value: serde_json::Value = serde_json::from_str(&content)?;
        let events_value = match value {
            serde_json::Value::Object(mut map) => map
                .remove("events")
                .ok_or_else(|| anyhow::anyhow!("events file {} has no events array", self.path))?,
            other => other,
        };

        let events: Vec<HealthEvent> = serde_json::from_value(events_value)?;
        tracing::info!("Loaded {} events from {}", events.len(), self.path);
        Ok(events)
    }
}

/// Severity buckets, ordered most severe first so a plain sort on the
/// enum puts critical events at the head of the list.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthEvent {
    pub arn: String,
    pub service: String,
    pub event_type_code: String,
    pub event_type_category: String,
    pub region: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated_time: Option<DateTime<Utc>>,
    pub status_code: String,
    #[serde(default)]
    pub event_description: Option<String>,
    /// May hold a comma-separated list when the feed attributes one
    /// event to several accounts; `expand_by_account` splits those.
    #[serde(default)]
    pub account_id: Option<String>,
}

/// Key fields pulled out of an event for prompts and report rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub service: String,
    pub region: String,
    pub event_type: String,
    pub category: String,
    pub status: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub description_preview: String,
}

/// An event after preprocessing: categorized and summarized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    #[serde(flatten)]
    pub event: HealthEvent,
    pub severity: Severity,
    pub analysis_summary: AnalysisSummary,
}

/// Categorize event severity from its category and status.
///
/// Open issues are outages in progress; anything under investigation
/// is high; scheduled changes need planning; account notifications are
/// noise unless they touch security, billing or service limits.
pub fn categorize_severity(event: &HealthEvent) -> Severity {
    let category = event.event_type_category.to_lowercase();
    let status = event.status_code.to_lowercase();

    if category == "issue" && status == "open" {
        return Severity::Critical;
    }

    if category == "issue" || category == "investigation" {
        return Severity::High;
    }

    if category == "scheduledchange" {
        return Severity::Medium;
    }

    if category == "accountnotification" {
        let type_code = event.event_type_code.to_lowercase();
        if ["security", "billing", "limit"]
            .iter()
            .any(|kw| type_code.contains(kw))
        {
            return Severity::Medium;
        }
        return Severity::Low;
    }

    Severity::Low
}

fn extract_analysis_summary(event: &HealthEvent) -> AnalysisSummary {
    let description_preview = match event.event_description.as_deref() {
        Some(desc) if !desc.is_empty() => {
            let preview: String = desc.chars().take(200).collect();
            format!("{}...", preview)
        }
        _ => "No description available".to_string(),
    };

    AnalysisSummary {
        service: event.service.clone(),
        region: event.region.clone(),
        event_type: event.event_type_code.clone(),
        category: event.event_type_category.clone(),
        status: event.status_code.clone(),
        start_time: event.start_time,
        end_time: event.end_time,
        description_preview,
    }
}

/// Expand events attributed to multiple accounts into one copy per
/// account. Events with no account attribution pass through unchanged.
pub fn expand_by_account(events: Vec<HealthEvent>) -> Vec<HealthEvent> {
    let mut expanded = Vec::with_capacity(events.len());

    for event in events {
        let account_id_str = event.account_id.clone().unwrap_or_default();

        if !account_id_str.contains(',') {
            expanded.push(event);
            continue;
        }

        let account_ids: Vec<String> = account_id_str
            .split(',')
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        tracing::debug!(
            "Expanding event {} for {} accounts",
            event.arn,
            account_ids.len()
        );

        for account_id in account_ids {
            let mut account_event = event.clone();
            account_event.account_id = Some(account_id);
            expanded.push(account_event);
        }
    }

    expanded
}

/// Group events by account ID, preserving first-seen account order.
/// Events with no attribution land under [`UNKNOWN_ACCOUNT`].
pub fn group_by_account(events: Vec<HealthEvent>) -> IndexMap<String, Vec<HealthEvent>> {
    let mut by_account: IndexMap<String, Vec<HealthEvent>> = IndexMap::new();

    for event in events {
        let account_id = event
            .account_id
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| UNKNOWN_ACCOUNT.to_string());
        by_account.entry(account_id).or_default().push(event);
    }

    by_account
}

/// Filter excluded services, categorize, summarize and sort by
/// severity (critical first).
pub fn preprocess(events: Vec<HealthEvent>, excluded_services: &[String]) -> Vec<ProcessedEvent> {
    let mut processed: Vec<ProcessedEvent> = events
        .into_iter()
        .filter(|event| {
            if excluded_services.contains(&event.service) {
                tracing::debug!("Skipping event for excluded service: {}", event.service);
                return false;
            }
            true
        })
        .map(|event| {
            if event.event_description.is_none() {
                tracing::warn!("Event {} has no description", event.arn);
            }
            let severity = categorize_severity(&event);
            let analysis_summary = extract_analysis_summary(&event);
            ProcessedEvent {
                event,
                severity,
                analysis_summary,
            }
        })
        .collect();

    processed.sort_by_key(|p| p.severity);
    processed
}
