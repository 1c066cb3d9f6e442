//! Observability Module
//!
//! Counters and status reporting for the workflow pipeline: analysis
//! task outcomes, dispatch decisions, and email delivery results.

mod workflow_tracker;

pub use workflow_tracker::{WorkflowStats, WorkflowTracker};
