// src/engine/patterns.rs
//
// Pattern discovery over the processed-case ring. Keeps the last 10 000
// cases in memory and periodically partitions the auto-blocked subset by
// fixed feature signatures; a partition with enough unrepresented cases
// becomes a DiscoveredPattern. Patterns accumulate in a plain list that the
// anomaly layer may read at warmup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::events::{Decision, DiscoveredPattern, ProcessedCase};
use crate::layers::anomaly::{project, PROJECTION_DIM};

pub const RING_CAPACITY: usize = 10_000;
pub const MINE_INTERVAL: Duration = Duration::from_secs(300);
/// Cases recorded since the last run that force an early mine.
pub const MINE_CASE_TRIGGER: usize = 500;
const MIN_PARTITION: usize = 5;

struct Signature {
    pattern_type: &'static str,
    key:          &'static str,
    threshold:    f64,
}

const SIGNATURES: &[Signature] = &[
    Signature { pattern_type: "income_ratio_abuse",    key: "amount_income_ratio", threshold: 10.0 },
    Signature { pattern_type: "structuring",           key: "is_structuring",      threshold: 0.5 },
    Signature { pattern_type: "amount_escalation",     key: "is_escalating",       threshold: 0.5 },
    Signature { pattern_type: "shared_infrastructure", key: "network_risk_score",  threshold: 0.6 },
    Signature { pattern_type: "anonymous_network",     key: "ip_anonymity_score",  threshold: 0.5 },
];

pub struct PatternDiscovery {
    ring:       Mutex<VecDeque<ProcessedCase>>,
    patterns:   Mutex<Vec<DiscoveredPattern>>,
    since_mine: AtomicUsize,
}

impl PatternDiscovery {
    pub fn new() -> Self {
        Self {
            ring:       Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
            patterns:   Mutex::new(Vec::new()),
            since_mine: AtomicUsize::new(0),
        }
    }

    /// Append one processed case; the ring evicts from the front at capacity.
    pub fn record(&self, case: ProcessedCase) {
        {
            let mut ring = self.ring.lock();
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(case);
        }
        if self.since_mine.fetch_add(1, Ordering::Relaxed) + 1 >= MINE_CASE_TRIGGER {
            self.mine();
        }
    }

    pub fn ring_len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn patterns(&self) -> Vec<DiscoveredPattern> {
        self.patterns.lock().clone()
    }

    /// Warmup from a persisted snapshot.
    pub fn seed(&self, patterns: Vec<DiscoveredPattern>) {
        let mut list = self.patterns.lock();
        *list = patterns;
    }

    /// One mining pass. Returns the number of newly emitted patterns.
    pub fn mine(&self) -> usize {
        self.since_mine.store(0, Ordering::Relaxed);

        let cases: Vec<ProcessedCase> = self.ring.lock().iter().cloned().collect();
        if cases.is_empty() {
            return 0;
        }
        let total_blocked = cases.iter().filter(|c| c.decision == Decision::AutoBlocked).count();
        if total_blocked == 0 {
            return 0;
        }

        let mut emitted = 0;
        let mut patterns = self.patterns.lock();

        for sig in SIGNATURES {
            let matching: Vec<&ProcessedCase> = cases
                .iter()
                .filter(|c| c.features.get(sig.key) > sig.threshold)
                .collect();
            let blocked: Vec<&&ProcessedCase> = matching
                .iter()
                .filter(|c| c.decision == Decision::AutoBlocked)
                .collect();
            if blocked.len() < MIN_PARTITION {
                continue;
            }

            let first_seen = blocked.iter().map(|c| c.timestamp).min().unwrap_or_else(Utc::now);
            let last_seen = blocked.iter().map(|c| c.timestamp).max().unwrap_or_else(Utc::now);
            let precision = blocked.len() as f64 / matching.len() as f64;
            let recall = blocked.len() as f64 / total_blocked as f64;
            let centroid = partition_centroid(&blocked);

            if let Some(existing) = patterns.iter_mut().find(|p| p.pattern_type == sig.pattern_type) {
                existing.occurrences = blocked.len() as u64;
                existing.last_seen = last_seen;
                existing.precision = precision;
                existing.recall = recall;
                existing.centroid = centroid;
                continue;
            }

            let pattern = DiscoveredPattern {
                pattern_id: signature_id(sig),
                pattern_type: sig.pattern_type.to_string(),
                signature: format!("{} > {}", sig.key, sig.threshold),
                occurrences: blocked.len() as u64,
                first_seen,
                last_seen,
                precision,
                recall,
                centroid,
            };
            info!(
                pattern = %pattern.pattern_type,
                occurrences = pattern.occurrences,
                precision = format!("{:.2}", pattern.precision),
                "pattern discovered"
            );
            patterns.push(pattern);
            emitted += 1;
        }

        emitted
    }

    /// Periodic mining task.
    pub async fn mining_loop(self: std::sync::Arc<Self>) {
        loop {
            tokio::time::sleep(MINE_INTERVAL).await;
            let emitted = self.mine();
            if emitted > 0 {
                info!(emitted, total = self.patterns.lock().len(), "mining pass complete");
            }
        }
    }
}

impl Default for PatternDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean behavioral projection over the partition's blocked cases.
fn partition_centroid(blocked: &[&&ProcessedCase]) -> Vec<f64> {
    let mut centroid = [0.0f64; PROJECTION_DIM];
    let n = blocked.len().max(1) as f64;
    for case in blocked {
        let p = project(&case.features);
        for (c, v) in centroid.iter_mut().zip(p.iter()) {
            *c += v / n;
        }
    }
    centroid.to_vec()
}

fn signature_id(sig: &Signature) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sig.pattern_type.as_bytes());
    hasher.update(sig.key.as_bytes());
    hasher.update(sig.threshold.to_le_bytes());
    format!("fp-{}", hex::encode(&hasher.finalize()[..4]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureMap;

    fn case(decision: Decision, income_ratio: f64) -> ProcessedCase {
        let mut features = FeatureMap::zeroed();
        features.set("amount_income_ratio", income_ratio);
        ProcessedCase {
            case_id: "c".into(),
            features,
            ml_score: 0.9,
            ring_score: 0.0,
            anomaly_score: 0.0,
            combined_score: 0.9,
            decision,
            confidence: 0.9,
            processing_ms: 3,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn ring_is_bounded() {
        let discovery = PatternDiscovery::new();
        for _ in 0..RING_CAPACITY + 50 {
            discovery.record(case(Decision::AutoApproved, 0.1));
        }
        assert_eq!(discovery.ring_len(), RING_CAPACITY);
    }

    #[test]
    fn partition_of_five_emits_pattern() {
        let discovery = PatternDiscovery::new();
        for _ in 0..5 {
            discovery.record(case(Decision::AutoBlocked, 20.0));
        }
        assert_eq!(discovery.mine(), 1);
        let patterns = discovery.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].pattern_type, "income_ratio_abuse");
        assert_eq!(patterns[0].occurrences, 5);
        assert_eq!(patterns[0].signature, "amount_income_ratio > 10");
        // centroid carries the mean projection — income ratio slot is 20
        assert_eq!(patterns[0].centroid.len(), PROJECTION_DIM);
        assert!((patterns[0].centroid[1] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn small_partitions_stay_silent() {
        let discovery = PatternDiscovery::new();
        for _ in 0..4 {
            discovery.record(case(Decision::AutoBlocked, 20.0));
        }
        assert_eq!(discovery.mine(), 0);
        assert!(discovery.patterns().is_empty());
    }

    #[test]
    fn represented_patterns_update_not_duplicate() {
        let discovery = PatternDiscovery::new();
        for _ in 0..5 {
            discovery.record(case(Decision::AutoBlocked, 20.0));
        }
        discovery.mine();
        for _ in 0..3 {
            discovery.record(case(Decision::AutoBlocked, 20.0));
        }
        assert_eq!(discovery.mine(), 0);
        let patterns = discovery.patterns();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].occurrences, 8);
    }

    #[test]
    fn approved_cases_dilute_precision() {
        let discovery = PatternDiscovery::new();
        for _ in 0..5 {
            discovery.record(case(Decision::AutoBlocked, 20.0));
        }
        for _ in 0..5 {
            discovery.record(case(Decision::AutoApproved, 20.0));
        }
        discovery.mine();
        let patterns = discovery.patterns();
        assert!((patterns[0].precision - 0.5).abs() < 1e-9);
        assert!((patterns[0].recall - 1.0).abs() < 1e-9);
    }

    #[test]
    fn mining_without_blocked_cases_is_a_noop() {
        let discovery = PatternDiscovery::new();
        for _ in 0..10 {
            discovery.record(case(Decision::AutoApproved, 20.0));
        }
        assert_eq!(discovery.mine(), 0);
    }

    #[test]
    fn seed_replaces_pattern_list() {
        let discovery = PatternDiscovery::new();
        discovery.seed(vec![DiscoveredPattern {
            pattern_id: "fp-test".into(),
            pattern_type: "restored".into(),
            signature: "x > 1".into(),
            occurrences: 9,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            precision: 0.8,
            recall: 0.2,
            centroid: vec![0.0; PROJECTION_DIM],
        }]);
        assert_eq!(discovery.patterns().len(), 1);
        assert_eq!(discovery.patterns()[0].pattern_type, "restored");
    }
}
