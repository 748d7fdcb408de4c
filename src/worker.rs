// src/worker.rs
//
// The worker pool. N logical workers share the bounded stream channel; each
// pulls an entry, decodes it, runs the cascade under the hard time ceiling,
// and publishes the verdict. A worker survives anything a single case can
// throw at it — malformed payloads, layer failures, sink outages.
//
// Processing times land in a 1 000-sample ring feeding the periodic
// performance report.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::engine::orchestrator::Orchestrator;
use crate::events::Decision;
use crate::publisher::{build_payload, VerdictPublisher};
use crate::stream::{decode_transaction, StreamEntry};

/// Hard per-investigation ceiling; the soft budget lives in the orchestrator.
const HARD_CEILING: Duration = Duration::from_secs(1);
const SAMPLE_CAPACITY: usize = 1_000;
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

// ── Performance tracking ──────────────────────────────────────────────────────

pub struct PerfStats {
    samples:       Mutex<VecDeque<f64>>,
    pub total:     AtomicU64,
    pub approved:  AtomicU64,
    pub blocked:   AtomicU64,
    pub review:    AtomicU64,
    pub malformed: AtomicU64,
    pub faults:    AtomicU64,
}

/// Serializable aggregate for the state snapshot and the stats line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerfReport {
    pub total_cases:  u64,
    pub auto_approved: u64,
    pub auto_blocked: u64,
    pub human_review: u64,
    pub malformed:    u64,
    pub avg_ms:       f64,
    pub p50_ms:       f64,
    pub p95_ms:       f64,
    pub p99_ms:       f64,
    pub max_ms:       f64,
}

impl PerfStats {
    pub fn new() -> Self {
        Self {
            samples:   Mutex::new(VecDeque::with_capacity(SAMPLE_CAPACITY)),
            total:     AtomicU64::new(0),
            approved:  AtomicU64::new(0),
            blocked:   AtomicU64::new(0),
            review:    AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            faults:    AtomicU64::new(0),
        }
    }

    pub fn record_case(&self, decision: Decision, processing_ms: u64) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match decision {
            Decision::AutoApproved => self.approved.fetch_add(1, Ordering::Relaxed),
            Decision::AutoBlocked  => self.blocked.fetch_add(1, Ordering::Relaxed),
            Decision::HumanReview  => self.review.fetch_add(1, Ordering::Relaxed),
        };
        let mut samples = self.samples.lock();
        if samples.len() == SAMPLE_CAPACITY {
            samples.pop_front();
        }
        samples.push_back(processing_ms as f64);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> PerfReport {
        let samples = self.samples.lock();
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };
        PerfReport {
            total_cases:   self.total.load(Ordering::Relaxed),
            auto_approved: self.approved.load(Ordering::Relaxed),
            auto_blocked:  self.blocked.load(Ordering::Relaxed),
            human_review:  self.review.load(Ordering::Relaxed),
            malformed:     self.malformed.load(Ordering::Relaxed),
            avg_ms:        avg,
            p50_ms:        percentile(&sorted, 0.50),
            p95_ms:        percentile(&sorted, 0.95),
            p99_ms:        percentile(&sorted, 0.99),
            max_ms:        sorted.last().copied().unwrap_or(0.0),
        }
    }

    /// Periodic performance line.
    pub async fn report_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(REPORT_INTERVAL).await;
            let r = self.report();
            info!(
                total = r.total_cases,
                approved = r.auto_approved,
                blocked = r.auto_blocked,
                review = r.human_review,
                malformed = r.malformed,
                avg_ms = format!("{:.1}", r.avg_ms),
                p95_ms = format!("{:.1}", r.p95_ms),
                p99_ms = format!("{:.1}", r.p99_ms),
                max_ms = format!("{:.1}", r.max_ms),
                "performance report"
            );
        }
    }
}

impl Default for PerfStats {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64 - 1.0) * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

// ── Pool ──────────────────────────────────────────────────────────────────────

/// Spawn `count` workers over the shared channel. The returned JoinSet
/// completes once the channel closes and every in-flight case has drained.
pub fn spawn_pool(
    count: usize,
    rx: mpsc::Receiver<StreamEntry>,
    orchestrator: Arc<Orchestrator>,
    publisher: Arc<VerdictPublisher>,
    stats: Arc<PerfStats>,
) -> JoinSet<()> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let mut pool = JoinSet::new();
    for worker_id in 0..count {
        let rx = Arc::clone(&rx);
        let orchestrator = Arc::clone(&orchestrator);
        let publisher = Arc::clone(&publisher);
        let stats = Arc::clone(&stats);
        pool.spawn(async move {
            loop {
                let entry = { rx.lock().await.recv().await };
                let Some(entry) = entry else { break };
                process_entry(worker_id, entry, &orchestrator, &publisher, &stats).await;
            }
        });
    }
    pool
}

async fn process_entry(
    worker_id: usize,
    entry: StreamEntry,
    orchestrator: &Orchestrator,
    publisher: &VerdictPublisher,
    stats: &PerfStats,
) {
    let tx = match decode_transaction(&entry.event_data) {
        Ok(tx) => tx,
        Err(e) => {
            warn!(worker = worker_id, id = %entry.id, error = %e, "malformed event skipped");
            stats.record_malformed();
            return;
        }
    };

    let report = match tokio::time::timeout(HARD_CEILING, orchestrator.investigate(&tx)).await {
        Ok(report) => report,
        Err(_) => {
            warn!(worker = worker_id, case = %tx.transaction_id, "hard ceiling hit");
            stats.record_fault();
            orchestrator.timeout_report(&tx)
        }
    };

    let payload = build_payload(&report);
    if let Err(e) = publisher.publish(&payload).await {
        // At-least-once: the sink dedupes on caseId, so dropping here after
        // bounded retries is safe.
        warn!(case = %report.case_id, error = %e, "verdict publish failed");
    }
    stats.record_case(report.decision, report.processing_ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_ring_is_bounded() {
        let stats = PerfStats::new();
        for i in 0..SAMPLE_CAPACITY + 200 {
            stats.record_case(Decision::AutoApproved, i as u64);
        }
        assert_eq!(stats.samples.lock().len(), SAMPLE_CAPACITY);
        assert_eq!(stats.total.load(Ordering::Relaxed), (SAMPLE_CAPACITY + 200) as u64);
    }

    #[test]
    fn report_percentiles() {
        let stats = PerfStats::new();
        for ms in 1..=100u64 {
            stats.record_case(Decision::AutoBlocked, ms);
        }
        let r = stats.report();
        assert_eq!(r.total_cases, 100);
        assert_eq!(r.auto_blocked, 100);
        assert!((r.avg_ms - 50.5).abs() < 1e-9);
        assert!((r.p50_ms - 51.0).abs() <= 1.0);
        assert!((r.p95_ms - 95.0).abs() <= 1.0);
        assert_eq!(r.max_ms, 100.0);
    }

    #[test]
    fn empty_report_is_zeroed() {
        let r = PerfStats::new().report();
        assert_eq!(r.total_cases, 0);
        assert_eq!(r.avg_ms, 0.0);
        assert_eq!(r.p99_ms, 0.0);
    }

    #[test]
    fn decision_counters_split() {
        let stats = PerfStats::new();
        stats.record_case(Decision::AutoApproved, 5);
        stats.record_case(Decision::HumanReview, 6);
        stats.record_case(Decision::HumanReview, 7);
        stats.record_malformed();
        let r = stats.report();
        assert_eq!(r.auto_approved, 1);
        assert_eq!(r.human_review, 2);
        assert_eq!(r.malformed, 1);
    }
}
