//! Result store seam.
//!
//! Keyed storage for per-(workflow, account) analysis results, the
//! idempotency markers that guard side effects, and the shared rate
//! limiter row. Any backend with conditional-put and a compare-and-swap
//! primitive satisfies these traits; the in-memory implementation in
//! [`memory`] backs single-node deployments and every test.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{analysis::AnalysisReport, error::AppResult, events::ProcessedEvent};

pub use memory::InMemoryStore;

/// Marker kinds. Existence of a marker row is the sole source of truth
/// for "has this side effect already happened".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MarkerKind {
    #[strum(serialize = "EMAIL_QUEUED_MARKER")]
    EmailQueued,
    #[strum(serialize = "EMAIL_SENT_MARKER")]
    EmailSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Completed,
}

/// What an analysis task persists for one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPayload {
    pub analysis: AnalysisReport,
    pub email_mapping: Option<String>,
    pub processed_events: Vec<ProcessedEvent>,
    pub event_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResult {
    pub workflow_id: String,
    pub account_id: String,
    pub status: ResultStatus,
    pub payload: ResultPayload,
    pub written_at: i64,
    pub ttl: i64,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Idempotent upsert keyed by (workflow_id, account_id);
    /// last write wins, re-delivery never duplicates a count.
    async fn put_result(&self, result: StoredResult) -> AppResult<()>;

    /// Number of distinct completed account rows for a workflow.
    /// Marker rows are never counted.
    async fn count(&self, workflow_id: &str) -> AppResult<usize>;

    /// All result rows for a workflow.
    async fn list(&self, workflow_id: &str) -> AppResult<Vec<StoredResult>>;

    /// Best-effort cleanup; TTL expiry is the safety net. Returns the
    /// number of rows removed.
    async fn delete_all(&self, workflow_id: &str) -> AppResult<usize>;

    /// Conditional create. `Ok(true)` means this caller created the
    /// marker; `Ok(false)` means it already existed (a concurrent
    /// caller won the race).
    async fn create_marker(&self, scope: &str, kind: MarkerKind, ttl: i64) -> AppResult<bool>;

    async fn marker_exists(&self, scope: &str, kind: MarkerKind) -> AppResult<bool>;
}

/// Shared rate limiter row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterState {
    pub window_start: i64,
    pub calls_in_window: u32,
    pub max_calls_per_window: u32,
}

/// Versioned access to the single limiter row. The version token makes
/// updates compare-and-swap: a stale writer loses and re-reads.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Current state with its version, if initialized.
    async fn load(&self) -> AppResult<Option<(LimiterState, u64)>>;

    /// Create the row if absent; returns whatever is stored afterwards
    /// (the existing row wins a creation race).
    async fn init(&self, state: LimiterState) -> AppResult<(LimiterState, u64)>;

    /// Swap in `new` only if the stored version still matches.
    /// `Ok(false)` signals a lost race; reload and retry.
    async fn compare_and_swap(&self, expected_version: u64, new: LimiterState) -> AppResult<bool>;
}
