//! Normalized analysis report model.
//!
//! Every account ends a workflow with exactly one of these, whether it
//! came from the model, a parsing fallback, or the rule-based
//! placeholder. Downstream grouping and rendering never needs to care
//! which path produced it beyond the `source` tag.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl RiskLevel {
    /// Parse model output leniently; the model occasionally invents
    /// synonyms for the extremes.
    pub fn from_loose(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        match trimmed.to_uppercase().as_str() {
            "CRITICAL" | "SEVERE" => Some(RiskLevel::Critical),
            "HIGH" => Some(RiskLevel::High),
            "MEDIUM" | "MODERATE" => Some(RiskLevel::Medium),
            "LOW" => Some(RiskLevel::Low),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum TimeSensitivity {
    Critical,
    Urgent,
    Routine,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum RiskCategory {
    Availability,
    Security,
    Performance,
    Cost,
    Compliance,
    Operational,
}

/// Which path produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisSource {
    /// Parsed from the model's response.
    Model,
    /// The model responded but nothing parseable survived.
    ModelFallback,
    /// Rule-based placeholder, model never produced a usable answer.
    Placeholder,
    /// Placeholder produced because analysis is disabled in config.
    TestPlaceholder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub critical: bool,
    pub risk_level: RiskLevel,
    pub account_impact: RiskLevel,
    pub time_sensitivity: TimeSensitivity,
    pub risk_category: RiskCategory,
    pub required_actions: String,
    pub impact_analysis: String,
    pub consequences_if_ignored: String,
    pub affected_resources: String,
    pub key_date: Option<NaiveDate>,
    pub business_impact: String,
    pub summary: String,
    #[serde(default)]
    pub manual_review_required: bool,
    pub source: AnalysisSource,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Default for AnalysisReport {
    fn default() -> Self {
        Self {
            critical: false,
            risk_level: RiskLevel::Low,
            account_impact: RiskLevel::Low,
            time_sensitivity: TimeSensitivity::Routine,
            risk_category: RiskCategory::Operational,
            required_actions: "Review event details".to_string(),
            impact_analysis: "Impact assessment pending".to_string(),
            consequences_if_ignored: "Unknown consequences".to_string(),
            affected_resources: "Unknown resources".to_string(),
            key_date: None,
            business_impact: "Business impact assessment pending".to_string(),
            summary: "Analysis summary pending".to_string(),
            manual_review_required: false,
            source: AnalysisSource::Model,
            failure_reason: None,
            retry_count: 0,
        }
    }
}

impl AnalysisReport {
    /// Keep the critical flag and the risk level in agreement; the
    /// model sometimes sets one without the other.
    pub fn enforce_consistency(&mut self) {
        if self.critical && self.risk_level != RiskLevel::Critical {
            self.risk_level = RiskLevel::Critical;
        }
        if self.risk_level == RiskLevel::Critical {
            self.critical = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loose_risk_levels_parse() {
        assert_eq!(RiskLevel::from_loose("critical"), Some(RiskLevel::Critical));
        assert_eq!(RiskLevel::from_loose("SEVERE"), Some(RiskLevel::Critical));
        assert_eq!(RiskLevel::from_loose(" Moderate "), Some(RiskLevel::Medium));
        assert_eq!(RiskLevel::from_loose("catastrophic"), None);
    }

    #[test]
    fn critical_flag_and_level_stay_consistent() {
        let mut report = AnalysisReport {
            critical: true,
            ..Default::default()
        };
        report.enforce_consistency();
        assert_eq!(report.risk_level, RiskLevel::Critical);

        let mut report = AnalysisReport {
            risk_level: RiskLevel::Critical,
            critical: false,
            ..Default::default()
        };
        report.enforce_consistency();
        assert!(report.critical);
    }
}
