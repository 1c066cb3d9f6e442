//! Three-stage parser for model responses.
//!
//! Models are asked for strict JSON and deliver it most of the time.
//! The stages escalate: parse the whole response as JSON, extract an
//! embedded JSON block (fenced or bare), then regex out individual
//! known fields. Each stage is tagged in the result so tests and logs
//! can tell which one fired; when all three fail the caller gets a
//! deterministic "parsing failed" report flagged for manual review.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::analysis::{AnalysisReport, AnalysisSource, RiskCategory, RiskLevel, TimeSensitivity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMethod {
    /// The whole response was a well-formed JSON object.
    Structured,
    /// A JSON block embedded in surrounding prose parsed.
    ExtractedBlock,
    /// Individual fields were regex-extracted from broken output.
    FieldRegex,
    /// Nothing usable; the report is the parsing-failed fallback.
    Failed,
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"```(?:json)?\s*(\{.*?\})\s*```")
        .dot_matches_new_line(true)
        .build()
        .unwrap()
});

static BARE_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"(\{.*\})")
        .dot_matches_new_line(true)
        .build()
        .unwrap()
});

static CRITICAL_FLAG: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r#""critical"\s*:\s*(true|false)"#)
        .case_insensitive(true)
        .build()
        .unwrap()
});

fn field_regex(field: &str) -> Regex {
    RegexBuilder::new(&format!(r#""{}"\s*:\s*"([^"]+)""#, field))
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap()
}

/// Parse a model response, most structured interpretation first.
pub fn parse_analysis_response(text: &str) -> (AnalysisReport, ParseMethod) {
    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() {
            return (report_from_value(&value), ParseMethod::Structured);
        }
    }

    if let Some(block) = extract_json_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&block) {
            if value.is_object() {
                return (report_from_value(&value), ParseMethod::ExtractedBlock);
            }
        }
    }

    if let Some(report) = extract_fields(text) {
        return (report, ParseMethod::FieldRegex);
    }

    tracing::warn!("All response parsing stages failed");
    (fallback_report(text), ParseMethod::Failed)
}

fn extract_json_block(text: &str) -> Option<String> {
    if let Some(captures) = FENCED_JSON.captures(text) {
        return Some(captures.get(1)?.as_str().to_string());
    }
    // Greedy: first opening brace to last closing brace.
    Some(BARE_OBJECT.captures(text)?.get(1)?.as_str().to_string())
}

fn string_field(value: &Value, field: &str, default: &str) -> String {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| default.to_string())
}

fn key_date_from(raw: Option<&str>) -> Option<chrono::NaiveDate> {
    let raw = raw?;
    if raw.eq_ignore_ascii_case("null") {
        return None;
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Build a report from a parsed JSON object, defaulting every missing
/// field the way the report model defaults them.
fn report_from_value(value: &Value) -> AnalysisReport {
    let defaults = AnalysisReport::default();

    let mut report = AnalysisReport {
        critical: value
            .get("critical")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        risk_level: value
            .get("risk_level")
            .and_then(|v| v.as_str())
            .and_then(RiskLevel::from_loose)
            .unwrap_or(RiskLevel::Low),
        account_impact: value
            .get("account_impact")
            .and_then(|v| v.as_str())
            .and_then(RiskLevel::from_loose)
            .unwrap_or(RiskLevel::Low),
        time_sensitivity: value
            .get("time_sensitivity")
            .and_then(|v| v.as_str())
            .and_then(|s| TimeSensitivity::from_str(s.trim()).ok())
            .unwrap_or(TimeSensitivity::Routine),
        risk_category: value
            .get("risk_category")
            .and_then(|v| v.as_str())
            .and_then(|s| RiskCategory::from_str(s.trim()).ok())
            .unwrap_or(RiskCategory::Operational),
        required_actions: string_field(value, "required_actions", &defaults.required_actions),
        impact_analysis: string_field(value, "impact_analysis", &defaults.impact_analysis),
        consequences_if_ignored: string_field(
            value,
            "consequences_if_ignored",
            &defaults.consequences_if_ignored,
        ),
        affected_resources: string_field(value, "affected_resources", &defaults.affected_resources),
        key_date: key_date_from(value.get("key_date").and_then(|v| v.as_str())),
        business_impact: string_field(value, "business_impact", &defaults.business_impact),
        summary: string_field(value, "summary", &defaults.summary),
        source: AnalysisSource::Model,
        ..defaults
    };

    report.enforce_consistency();
    report
}

/// Unescape the escape sequences models leave in regex-captured
/// strings and bound the length.
fn clean_extracted(value: &str) -> String {
    let cleaned = value.replace("\\n", "\n").replace("\\t", "\t");
    cleaned.chars().take(500).collect()
}

/// Regex-extract known fields. Succeeds only if at least one field was
/// actually present; a response with none of them is a failure.
fn extract_fields(text: &str) -> Option<AnalysisReport> {
    let mut matched = 0usize;

    let mut captured = |field: &str| -> Option<String> {
        let capture = field_regex(field)
            .captures(text)
            .and_then(|c| c.get(1).map(|m| clean_extracted(m.as_str())));
        if capture.is_some() {
            matched += 1;
        }
        capture
    };

    let risk_level = captured("risk_level");
    let account_impact = captured("account_impact");
    let time_sensitivity = captured("time_sensitivity");
    let risk_category = captured("risk_category");
    let required_actions = captured("required_actions");
    let impact_analysis = captured("impact_analysis");
    let consequences = captured("consequences_if_ignored");
    let affected_resources = captured("affected_resources");
    let business_impact = captured("business_impact");
    let summary = captured("summary");
    let key_date = captured("key_date");

    let critical = CRITICAL_FLAG
        .captures(text)
        .map(|c| c.get(1).map(|m| m.as_str().eq_ignore_ascii_case("true")))
        .unwrap_or(None);
    if critical.is_some() {
        matched += 1;
    }

    if matched == 0 {
        return None;
    }

    let mut report = AnalysisReport {
        critical: critical.unwrap_or(false),
        risk_level: risk_level
            .as_deref()
            .and_then(RiskLevel::from_loose)
            .unwrap_or(RiskLevel::Medium),
        account_impact: account_impact
            .as_deref()
            .and_then(RiskLevel::from_loose)
            .unwrap_or(RiskLevel::Medium),
        time_sensitivity: time_sensitivity
            .as_deref()
            .and_then(|s| TimeSensitivity::from_str(s.trim()).ok())
            .unwrap_or(TimeSensitivity::Routine),
        risk_category: risk_category
            .as_deref()
            .and_then(|s| RiskCategory::from_str(s.trim()).ok())
            .unwrap_or(RiskCategory::Operational),
        required_actions: required_actions
            .unwrap_or_else(|| "Review event details manually - automated parsing incomplete".into()),
        impact_analysis: impact_analysis
            .unwrap_or_else(|| "Impact analysis extraction incomplete - manual review required".into()),
        consequences_if_ignored: consequences.unwrap_or_else(|| {
            "Consequences assessment incomplete - manual review required".into()
        }),
        affected_resources: affected_resources.unwrap_or_else(|| {
            "Resource identification incomplete - manual review required".into()
        }),
        key_date: key_date_from(key_date.as_deref()),
        business_impact: business_impact.unwrap_or_else(|| {
            "Business impact assessment incomplete - manual review required".into()
        }),
        summary: summary.unwrap_or_else(|| {
            "Analysis summary extraction incomplete - manual review required".into()
        }),
        source: AnalysisSource::Model,
        ..AnalysisReport::default()
    };

    report.enforce_consistency();
    Some(report)
}

/// Deterministic report for a response nothing could parse.
fn fallback_report(text: &str) -> AnalysisReport {
    let excerpt: String = text.chars().take(200).collect();

    AnalysisReport {
        risk_level: RiskLevel::Medium,
        account_impact: RiskLevel::Medium,
        required_actions: "Manual review required - automated analysis parsing failed".to_string(),
        impact_analysis: "Impact analysis unavailable due to parsing failure - manual review required"
            .to_string(),
        consequences_if_ignored: "Consequences assessment unavailable - manual review required"
            .to_string(),
        affected_resources: "Resource identification unavailable - manual review required"
            .to_string(),
        business_impact: "Business impact assessment unavailable due to parsing failure".to_string(),
        summary: "Analysis parsing failed - manual review of health events required".to_string(),
        manual_review_required: true,
        source: AnalysisSource::ModelFallback,
        failure_reason: Some(format!("response parsing failed; excerpt: {}", excerpt)),
        ..AnalysisReport::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str = r#"{
        "critical": true,
        "risk_level": "Critical",
        "account_impact": "High",
        "time_sensitivity": "Urgent",
        "risk_category": "Availability",
        "required_actions": "Rotate the expiring certificates",
        "impact_analysis": "TLS handshakes will fail across integrations",
        "consequences_if_ignored": "Full outage of partner traffic",
        "affected_resources": "api-gateway, load balancers",
        "key_date": "2026-09-01",
        "business_impact": "Revenue-affecting downtime",
        "summary": "Certificate expiry will break connectivity"
    }"#;

    #[test]
    fn stage_one_parses_well_formed_json() {
        let (report, method) = parse_analysis_response(WELL_FORMED);
        assert_eq!(method, ParseMethod::Structured);
        assert!(report.critical);
        assert_eq!(report.risk_level, RiskLevel::Critical);
        assert_eq!(report.time_sensitivity, TimeSensitivity::Urgent);
        assert_eq!(report.risk_category, RiskCategory::Availability);
        assert_eq!(
            report.key_date,
            Some(chrono::NaiveDate::from_ymd_opt(2026, 9, 1).unwrap())
        );
    }

    #[test]
    fn stage_one_fills_missing_fields_with_defaults() {
        let (report, method) = parse_analysis_response(r#"{"risk_level": "High"}"#);
        assert_eq!(method, ParseMethod::Structured);
        assert_eq!(report.risk_level, RiskLevel::High);
        assert_eq!(report.required_actions, "Review event details");
        assert!(!report.critical);
    }

    #[test]
    fn stage_two_extracts_fenced_block() {
        let text = format!(
            "Here is my analysis of the events:\n```json\n{}\n```\nLet me know if you need more.",
            WELL_FORMED
        );
        let (report, method) = parse_analysis_response(&text);
        assert_eq!(method, ParseMethod::ExtractedBlock);
        assert_eq!(report.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn stage_two_extracts_bare_object_from_prose() {
        let text = format!("Analysis follows. {} That concludes the report.", WELL_FORMED);
        let (report, method) = parse_analysis_response(&text);
        assert_eq!(method, ParseMethod::ExtractedBlock);
        assert_eq!(report.account_impact, RiskLevel::High);
    }

    #[test]
    fn stage_three_scrapes_fields_from_broken_json() {
        // Unescaped newline inside a string makes this invalid JSON.
        let text = "{\"risk_level\": \"High\", \"summary\": \"Multi\nline summary\", \"critical\": false";
        let (report, method) = parse_analysis_response(text);
        assert_eq!(method, ParseMethod::FieldRegex);
        assert_eq!(report.risk_level, RiskLevel::High);
        assert!(!report.critical);
    }

    #[test]
    fn stage_three_normalizes_loose_risk_words() {
        let text = "\"risk_level\": \"SEVERE\" and nothing else parseable {";
        let (report, method) = parse_analysis_response(text);
        assert_eq!(method, ParseMethod::FieldRegex);
        assert_eq!(report.risk_level, RiskLevel::Critical);
        // Consistency rule: a critical level implies the flag.
        assert!(report.critical);
    }

    #[test]
    fn garbage_falls_back_to_failed_report() {
        let (report, method) = parse_analysis_response("I could not analyze these events, sorry.");
        assert_eq!(method, ParseMethod::Failed);
        assert!(report.manual_review_required);
        assert_eq!(report.source, AnalysisSource::ModelFallback);
        assert_eq!(report.risk_level, RiskLevel::Medium);
        assert!(report.failure_reason.as_deref().unwrap().contains("parsing failed"));
    }

    #[test]
    fn null_key_date_is_none() {
        let (report, method) =
            parse_analysis_response(r#"{"risk_level": "Low", "key_date": "null"}"#);
        assert_eq!(method, ParseMethod::Structured);
        assert!(report.key_date.is_none());
    }
}
