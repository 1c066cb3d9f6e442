//! Workflow Tracker
//!
//! Cheap shared counters for everything the pipeline does, plus a
//! formatted status line for periodic logging. Cloned freely into
//! every worker; all counters are atomic.

use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc,
};

#[derive(Default)]
struct Counters {
    tasks_analyzed: AtomicU64,
    placeholders_written: AtomicU64,
    tasks_requeued: AtomicU64,
    workflows_completed: AtomicU64,
    notifications_queued: AtomicU64,
    emails_sent: AtomicU64,
    emails_deduplicated: AtomicU64,
    emails_dropped: AtomicU64,
    races_detected: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowStats {
    pub tasks_analyzed: u64,
    pub placeholders_written: u64,
    pub tasks_requeued: u64,
    pub workflows_completed: u64,
    pub notifications_queued: u64,
    pub emails_sent: u64,
    pub emails_deduplicated: u64,
    pub emails_dropped: u64,
    pub races_detected: u64,
}

#[derive(Clone, Default)]
pub struct WorkflowTracker {
    counters: Arc<Counters>,
}

impl WorkflowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_analyzed(&self) {
        self.counters.tasks_analyzed.fetch_add(1, Relaxed);
    }

    pub fn placeholder_written(&self) {
        self.counters.placeholders_written.fetch_add(1, Relaxed);
    }

    pub fn task_requeued(&self) {
        self.counters.tasks_requeued.fetch_add(1, Relaxed);
    }

    pub fn workflow_completed(&self) {
        self.counters.workflows_completed.fetch_add(1, Relaxed);
    }

    pub fn notifications_queued(&self, count: u64) {
        self.counters.notifications_queued.fetch_add(count, Relaxed);
    }

    pub fn email_sent(&self) {
        self.counters.emails_sent.fetch_add(1, Relaxed);
    }

    pub fn email_deduplicated(&self) {
        self.counters.emails_deduplicated.fetch_add(1, Relaxed);
    }

    pub fn email_dropped(&self) {
        self.counters.emails_dropped.fetch_add(1, Relaxed);
    }

    pub fn race_detected(&self) {
        self.counters.races_detected.fetch_add(1, Relaxed);
    }

    pub fn get_stats(&self) -> WorkflowStats {
        WorkflowStats {
            tasks_analyzed: self.counters.tasks_analyzed.load(Relaxed),
            placeholders_written: self.counters.placeholders_written.load(Relaxed),
            tasks_requeued: self.counters.tasks_requeued.load(Relaxed),
            workflows_completed: self.counters.workflows_completed.load(Relaxed),
            notifications_queued: self.counters.notifications_queued.load(Relaxed),
            emails_sent: self.counters.emails_sent.load(Relaxed),
            emails_deduplicated: self.counters.emails_deduplicated.load(Relaxed),
            emails_dropped: self.counters.emails_dropped.load(Relaxed),
            races_detected: self.counters.races_detected.load(Relaxed),
        }
    }

    /// One-line status for periodic logging.
    pub fn status_line(&self) -> String {
        let stats = self.get_stats();
        format!(
            "analyzed: {} (placeholders: {}, requeued: {}) workflows: {} queued: {} sent: {} (dedup: {}, dropped: {}) races: {}",
            stats.tasks_analyzed,
            stats.placeholders_written,
            stats.tasks_requeued,
            stats.workflows_completed,
            stats.notifications_queued,
            stats.emails_sent,
            stats.emails_deduplicated,
            stats.emails_dropped,
            stats.races_detected,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_across_clones() {
        let tracker = WorkflowTracker::new();
        let clone = tracker.clone();

        tracker.task_analyzed();
        clone.task_analyzed();
        clone.placeholder_written();
        tracker.notifications_queued(3);

        let stats = tracker.get_stats();
        assert_eq!(stats.tasks_analyzed, 2);
        assert_eq!(stats.placeholders_written, 1);
        assert_eq!(stats.notifications_queued, 3);
        assert!(tracker.status_line().contains("analyzed: 2"));
    }
}
