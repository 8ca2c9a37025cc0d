use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// What one pipeline run did. Spam items are persisted but counted under
/// `skipped_spam` because they never reach planning.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub fetched: usize,
    pub extracted: usize,
    pub skipped_spam: usize,
    pub skipped_other: usize,
    pub persisted_new: usize,
    pub persisted_updated: usize,
    pub encoded: usize,
    /// Bounded sample of item-level failures.
    pub errors: Vec<String>,
}

impl RunReport {
    pub fn record_error(&mut self, message: String) {
        crate::utils::push_bounded_error(&mut self.errors, message, 20);
    }
}

/// Process-wide ingestion counters feeding the health endpoint.
#[derive(Default)]
pub struct IngestMetrics {
    runs_ok: AtomicU64,
    runs_failed: AtomicU64,
    items_persisted: AtomicU64,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_run(&self, report: &RunReport) {
        self.runs_ok.fetch_add(1, Ordering::Relaxed);
        self.items_persisted.fetch_add(
            (report.persisted_new + report.persisted_updated) as u64,
            Ordering::Relaxed,
        );
    }

    pub fn record_failure(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Fraction of runs that completed, 1.0 when nothing ran yet.
    pub fn success_rate(&self) -> f64 {
        let ok = self.runs_ok.load(Ordering::Relaxed);
        let failed = self.runs_failed.load(Ordering::Relaxed);
        let total = ok + failed;
        if total == 0 {
            1.0
        } else {
            ok as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "runs_ok": self.runs_ok.load(Ordering::Relaxed),
            "runs_failed": self.runs_failed.load(Ordering::Relaxed),
            "items_persisted": self.items_persisted.load(Ordering::Relaxed),
            "success_rate": self.success_rate(),
        })
    }
}
