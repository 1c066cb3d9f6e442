//! Rule-based placeholder analysis.
//!
//! When the AI service is unavailable, throttled past the retry
//! budget, or disabled by configuration, every account still gets a
//! deterministic report derived from event severities. This is what
//! keeps the completion count moving under total AI-service failure.

use std::collections::BTreeSet;

use crate::analysis::{AnalysisReport, AnalysisSource, RiskLevel, TimeSensitivity};
use crate::events::{ProcessedEvent, Severity};

/// Build a placeholder report for one account from its preprocessed
/// events. `reason` records why the real analysis never happened.
pub fn placeholder_report(
    account_id: &str,
    events: &[ProcessedEvent],
    source: AnalysisSource,
    reason: &str,
) -> AnalysisReport {
    let event_count = events.len();
    let critical_events = events
        .iter()
        .filter(|e| e.severity == Severity::Critical)
        .count();
    let high_events = events
        .iter()
        .filter(|e| e.severity == Severity::High)
        .count();

    let services: BTreeSet<&str> = events.iter().map(|e| e.event.service.as_str()).collect();
    let regions: BTreeSet<&str> = events.iter().map(|e| e.event.region.as_str()).collect();

    let (risk_level, justification) = if critical_events > 0 {
        (
            RiskLevel::Critical,
            format!(
                "Account has {} critical health events requiring immediate attention",
                critical_events
            ),
        )
    } else if high_events > 0 {
        (
            RiskLevel::High,
            format!("Account has {} high-priority health events", high_events),
        )
    } else if event_count > 5 {
        (
            RiskLevel::Medium,
            format!(
                "Account has {} health events that should be reviewed",
                event_count
            ),
        )
    } else if event_count > 0 {
        (
            RiskLevel::Low,
            format!(
                "Account has {} health events with minimal impact",
                event_count
            ),
        )
    } else {
        (
            RiskLevel::Low,
            "No health events found for this account".to_string(),
        )
    };

    let services_list = services.iter().copied().collect::<Vec<_>>().join(", ");
    let regions_list = regions.iter().copied().collect::<Vec<_>>().join(", ");

    let required_actions = format!(
        "Manual review required - automated analysis was unavailable. \
         Review all {} health events for account {} within 24 hours, \
         and check the provider health dashboard for additional context.",
        event_count, account_id
    );

    let mut report = AnalysisReport {
        risk_level,
        account_impact: risk_level,
        time_sensitivity: if critical_events > 0 {
            TimeSensitivity::Urgent
        } else {
            TimeSensitivity::Routine
        },
        required_actions,
        impact_analysis: format!(
            "AI analysis unavailable - manual review required for {} events across {} services. {}",
            event_count,
            services.len(),
            justification
        ),
        consequences_if_ignored:
            "Unreviewed health events may lead to unplanned outages or missed deadlines"
                .to_string(),
        affected_resources: format!(
            "Services: {}; Regions: {}",
            if services_list.is_empty() {
                "none"
            } else {
                services_list.as_str()
            },
            if regions_list.is_empty() {
                "none"
            } else {
                regions_list.as_str()
            },
        ),
        business_impact:
            "Impact assessment unavailable - manual review required to determine business implications"
                .to_string(),
        summary: format!(
            "MANUAL REVIEW REQUIRED: automated analysis was unavailable for account {}. \
             This account has {} health events that require manual assessment.",
            account_id, event_count
        ),
        manual_review_required: true,
        source,
        failure_reason: Some(reason.to_string()),
        ..AnalysisReport::default()
    };

    report.enforce_consistency();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::preprocess;
    use crate::testing::common::make_event;

    #[test]
    fn critical_events_dominate_the_risk_level() {
        let events = preprocess(
            vec![
                make_event("111122223333", "EC2", "issue", "open"),
                make_event("111122223333", "RDS", "scheduledChange", "upcoming"),
            ],
            &[],
        );

        let report = placeholder_report(
            "111122223333",
            &events,
            AnalysisSource::Placeholder,
            "Exceeded maximum retry attempts",
        );

        assert_eq!(report.risk_level, RiskLevel::Critical);
        assert!(report.critical);
        assert_eq!(report.time_sensitivity, TimeSensitivity::Urgent);
        assert!(report.manual_review_required);
        assert_eq!(report.source, AnalysisSource::Placeholder);
        assert!(report.affected_resources.contains("EC2"));
    }

    #[test]
    fn high_events_without_critical_are_high() {
        let events = preprocess(
            vec![make_event("111122223333", "EC2", "issue", "closed")],
            &[],
        );
        let report = placeholder_report(
            "111122223333",
            &events,
            AnalysisSource::Placeholder,
            "test",
        );
        assert_eq!(report.risk_level, RiskLevel::High);
    }

    #[test]
    fn many_low_events_bump_to_medium() {
        let events = preprocess(
            (0..6)
                .map(|_| make_event("111122223333", "S3", "accountNotification", "open"))
                .collect(),
            &[],
        );
        let report = placeholder_report(
            "111122223333",
            &events,
            AnalysisSource::Placeholder,
            "test",
        );
        assert_eq!(report.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn no_events_is_low_and_still_flagged() {
        let report = placeholder_report(
            "111122223333",
            &[],
            AnalysisSource::TestPlaceholder,
            "analysis disabled by configuration",
        );
        assert_eq!(report.risk_level, RiskLevel::Low);
        assert!(report.manual_review_required);
        assert_eq!(report.source, AnalysisSource::TestPlaceholder);
        assert!(report.summary.contains("MANUAL REVIEW REQUIRED"));
    }
}
