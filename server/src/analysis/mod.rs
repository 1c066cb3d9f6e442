pub mod placeholder;
pub mod report;
pub mod worker;

pub use report::{AnalysisReport, AnalysisSource, RiskCategory, RiskLevel, TimeSensitivity};
pub use worker::AnalysisWorker;
