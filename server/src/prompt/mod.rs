//! Prompt construction for health-event analysis.
//!
//! The prompt leads with an aggregate view of the account's events,
//! surfaces critical events verbatim, and pins the model to a JSON
//! object matching [`crate::analysis::AnalysisReport`].

pub mod client;
pub mod parser;

use std::collections::BTreeMap;

use indoc::formatdoc;
use serde::Serialize;

use crate::events::{ProcessedEvent, Severity};

pub use client::{AiClient, GenerationParams, HttpAiClient};

/// How many events are quoted in full detail; the rest are covered by
/// the aggregate counts.
const SAMPLE_EVENT_LIMIT: usize = 5;

#[derive(Debug, Serialize)]
struct CriticalEventDetail<'a> {
    arn: &'a str,
    service: &'a str,
    event_type: &'a str,
    description: String,
}

/// Aggregate view of one account's events used to fill the prompt.
#[derive(Debug, Default, Serialize)]
struct EventSummary<'a> {
    total_events: usize,
    events_by_severity: BTreeMap<String, usize>,
    events_by_service: BTreeMap<String, usize>,
    events_by_category: BTreeMap<String, usize>,
    critical_events: Vec<CriticalEventDetail<'a>>,
}

fn summarize<'a>(events: &'a [ProcessedEvent]) -> EventSummary<'a> {
    let mut summary = EventSummary {
        total_events: events.len(),
        ..Default::default()
    };

    for processed in events {
        *summary
            .events_by_severity
            .entry(processed.severity.to_string())
            .or_default() += 1;
        *summary
            .events_by_service
            .entry(processed.event.service.clone())
            .or_default() += 1;
        *summary
            .events_by_category
            .entry(processed.event.event_type_category.clone())
            .or_default() += 1;

        if processed.severity == Severity::Critical {
            let description = processed
                .event
                .event_description
                .as_deref()
                .map(|d| d.chars().take(500).collect())
                .unwrap_or_else(|| "No description".to_string());
            summary.critical_events.push(CriticalEventDetail {
                arn: &processed.event.arn,
                service: &processed.event.service,
                event_type: &processed.event.event_type_code,
                description,
            });
        }
    }

    summary
}

/// Build the analysis prompt for one account's preprocessed events.
pub fn analysis_prompt(account_id: &str, events: &[ProcessedEvent]) -> String {
    if events.is_empty() {
        return "No events to analyze for this account.".to_string();
    }

    let summary = summarize(events);

    let critical_section = if summary.critical_events.is_empty() {
        "None identified".to_string()
    } else {
        serde_json::to_string_pretty(&summary.critical_events).unwrap_or_default()
    };

    let sample_summaries: Vec<_> = events
        .iter()
        .take(SAMPLE_EVENT_LIMIT)
        .map(|p| &p.analysis_summary)
        .collect();
    let samples_section = serde_json::to_string_pretty(&sample_summaries).unwrap_or_default();

    formatdoc! {r#"
        You are a cloud infrastructure expert specializing in outage analysis and business continuity. Your task is to analyze these provider health events and determine their potential impact on workload availability, system connectivity, and service outages.

        ACCOUNT: {account_id}

        EVENT SUMMARY:
        - Total Events: {total}
        - Events by Severity: {by_severity}
        - Events by Service: {by_service}
        - Events by Category: {by_category}

        CRITICAL EVENTS REQUIRING IMMEDIATE ATTENTION:
        {critical_section}

        SAMPLE EVENTS FOR DETAILED ANALYSIS:
        {samples_section}

        IMPORTANT ANALYSIS FOCUS:
        1. Will these events cause workload downtime if required actions are not taken?
        2. Will there be any service outages associated with these events?
        3. Will applications experience network integration issues between connecting systems?
        4. What specific services or resources could be impacted?
        5. Are there any SSL/TLS certificate issues that could affect connectivity?

        CRITICAL EVENT CRITERIA:
        - Any event that will cause service downtime should be marked as CRITICAL
        - Any event that will cause network integration or SSL issues between systems should be marked as CRITICAL
        - Any event that requires immediate action to prevent outage should be marked as URGENT time sensitivity
        - Events with high impact but no immediate downtime should be marked as HIGH risk level

        Please analyze these events and provide the following information in JSON format:

        {{
            "critical": boolean,
            "risk_level": "Critical|High|Medium|Low",
            "account_impact": "Critical|High|Medium|Low",
            "time_sensitivity": "Critical|Urgent|Routine",
            "risk_category": "Availability|Security|Performance|Cost|Compliance",
            "required_actions": "string describing specific actions needed",
            "impact_analysis": "string describing potential outages and connectivity issues",
            "consequences_if_ignored": "string describing what outages will occur if not addressed",
            "affected_resources": "string listing specific resources that could be impacted",
            "key_date": "YYYY-MM-DD or null",
            "business_impact": "assessment of business impact including potential downtime",
            "summary": "brief executive summary focusing on outage risk"
        }}

        For the key_date field, analyze event descriptions for deadlines, maintenance windows, deprecation dates, end-of-life dates and migration deadlines, and return the EARLIEST date that will impact the customer, or null if none is mentioned.

        RISK LEVEL GUIDELINES:
        - CRITICAL: Will cause service outage or severe disruption if not addressed
        - HIGH: Significant impact but not an immediate outage
        - MEDIUM: Moderate impact requiring attention
        - LOW: Minimal impact, routine maintenance

        Ensure your response is valid JSON that can be parsed programmatically."#,
        account_id = account_id,
        total = summary.total_events,
        by_severity = serde_json::to_string(&summary.events_by_severity).unwrap_or_default(),
        by_service = serde_json::to_string(&summary.events_by_service).unwrap_or_default(),
        by_category = serde_json::to_string(&summary.events_by_category).unwrap_or_default(),
        critical_section = critical_section,
        samples_section = samples_section,
    }
}
