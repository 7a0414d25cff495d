use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

use super::RunSummary;
use crate::TARGET_RUNNER;

/// Snapshot of a running job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressReport {
    /// Results committed so far, across all runs.
    pub offset: usize,
    /// Entities this run will reach if it is not interrupted.
    pub target: usize,
    pub total: usize,
    pub processed_this_run: usize,
    pub failed_this_run: usize,
    pub rate_per_sec: f64,
    pub eta: Option<Duration>,
}

/// Where progress and run summaries are published.
pub trait ObservabilitySink: Send + Sync {
    fn progress(&self, report: &ProgressReport);

    fn finished(&self, summary: &RunSummary);
}

/// Logs progress through `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn progress(&self, report: &ProgressReport) {
        let eta = report
            .eta
            .map(|eta| format!("{}s", eta.as_secs()))
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            target: TARGET_RUNNER,
            "Progress: {}/{} ({} this run, {} failed, {:.2}/s, ETA {})",
            report.offset,
            report.total,
            report.processed_this_run,
            report.failed_this_run,
            report.rate_per_sec,
            eta
        );
    }

    fn finished(&self, summary: &RunSummary) {
        info!(
            target: TARGET_RUNNER,
            "Run finished{}: {} processed, {} matched, {} ambiguous, {} unmatched, {} failed ({:.1}%), {} awaiting adjudication, offset {}/{} in {:?}",
            if summary.interrupted { " (interrupted)" } else { "" },
            summary.processed,
            summary.stats.matched(),
            summary.stats.ambiguous,
            summary.stats.unmatched,
            summary.stats.failed,
            summary.failure_rate() * 100.0,
            summary.pending_adjudication,
            summary.committed_offset,
            summary.total,
            summary.elapsed
        );
    }
}

/// Collects everything it is sent; for tests and embedding callers.
#[derive(Debug, Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<ProgressReport>>,
    summaries: Mutex<Vec<RunSummary>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<ProgressReport> {
        self.reports
            .lock()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        self.summaries
            .lock()
            .map(|summaries| summaries.clone())
            .unwrap_or_default()
    }
}

impl ObservabilitySink for RecordingSink {
    fn progress(&self, report: &ProgressReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report.clone());
        }
    }

    fn finished(&self, summary: &RunSummary) {
        if let Ok(mut summaries) = self.summaries.lock() {
            summaries.push(summary.clone());
        }
    }
}

/// Computes rate and ETA from committed offsets.
#[derive(Debug)]
pub struct ProgressReporter {
    started: Instant,
    start_offset: usize,
    target: usize,
    total: usize,
}

impl ProgressReporter {
    pub fn new(start_offset: usize, target: usize, total: usize) -> Self {
        Self {
            started: Instant::now(),
            start_offset,
            target,
            total,
        }
    }

    pub fn report(&self, offset: usize, failed_this_run: usize) -> ProgressReport {
        self.report_at(offset, failed_this_run, self.started.elapsed())
    }

    fn report_at(&self, offset: usize, failed_this_run: usize, elapsed: Duration) -> ProgressReport {
        let processed = offset.saturating_sub(self.start_offset);
        let seconds = elapsed.as_secs_f64();
        let rate = if seconds > 0.0 {
            processed as f64 / seconds
        } else {
            0.0
        };
        let remaining = self.target.saturating_sub(offset);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if rate > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / rate))
        } else {
            None
        };

        ProgressReport {
            offset,
            target: self.target,
            total: self.total,
            processed_this_run: processed,
            failed_this_run,
            rate_per_sec: rate,
            eta,
        }
    }
}
