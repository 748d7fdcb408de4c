// src/layers/anomaly.rs
//
// Layer 4 — behavioral sequence deviation. Each user carries a FIFO of at
// most 10 six-dimensional projections of their recent feature maps; the
// current projection is scored against the mean of the prior ones and
// against a small library of known fraud shapes.
//
// Buffers live in a DashMap (fine-grained per-user locking) with a
// timestamp-based global eviction sweep: when the population exceeds
// MAX_TRACKED_USERS, the least-recently-touched tenth is dropped.

use std::collections::VecDeque;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::features::FeatureMap;

pub const SEQ_CAPACITY: usize = 10;
pub const MAX_TRACKED_USERS: usize = 50_000;

const DEVIATION_ALERT: f64 = 0.7;
const DEVIATION_WEIGHT: f64 = 0.4;
const PATTERN_WEIGHT: f64 = 0.3;
const PATTERN_DISTANCE: f64 = 2.0;

/// Projection order: amount_log, amount_income_ratio, account_age_log,
/// ip_anonymity_score, network_risk_score, doc_risk.
pub const PROJECTION_DIM: usize = 6;

#[derive(Debug, Clone)]
pub struct AnomalyPattern {
    pub tag:      &'static str,
    pub centroid: [f64; PROJECTION_DIM],
}

const PATTERN_LIBRARY: &[AnomalyPattern] = &[
    AnomalyPattern { tag: "rapid_escalation", centroid: [9.0, 10.0, 3.0, 0.25, 0.20, 0.30] },
    AnomalyPattern { tag: "structuring",      centroid: [9.2, 4.0, 5.0, 0.00, 0.10, 0.10] },
    AnomalyPattern { tag: "account_takeover", centroid: [8.0, 6.0, 8.5, 0.75, 0.70, 0.50] },
];

#[derive(Debug, Clone, Default)]
pub struct AnomalyResult {
    pub anomaly_score: f64,
    pub tags:          Vec<String>,
}

struct SeqBuffer {
    window:     VecDeque<[f64; PROJECTION_DIM]>,
    last_touch: Instant,
}

pub struct AnomalyDetector {
    buffers:  DashMap<String, SeqBuffer>,
    /// Extra centroids seeded from pattern discovery at warmup.
    learned:  RwLock<Vec<(String, [f64; PROJECTION_DIM])>>,
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self { buffers: DashMap::new(), learned: RwLock::new(Vec::new()) }
    }

    /// Warmup hook — centroids mined by PatternDiscovery in a prior run.
    pub fn load_patterns(&self, patterns: Vec<(String, [f64; PROJECTION_DIM])>) {
        let mut learned = self.learned.write();
        *learned = patterns;
    }

    /// Ingest the current case's projection and score it against the user's
    /// recent behavior.
    pub fn observe(&self, user_id: &str, features: &FeatureMap) -> AnomalyResult {
        let projection = project(features);
        let mut score = 0.0;
        let mut tags = Vec::new();

        {
            let mut entry = self.buffers.entry(user_id.to_string()).or_insert_with(|| SeqBuffer {
                window:     VecDeque::with_capacity(SEQ_CAPACITY),
                last_touch: Instant::now(),
            });
            entry.last_touch = Instant::now();

            // Deviation against the mean of what came before this point.
            // One prior point is no baseline; the check starts at two.
            if entry.window.len() >= 2 {
                let prior: Vec<[f64; PROJECTION_DIM]> = entry.window.iter().copied().collect();
                let deviation = deviation_from_prior(&projection, &prior);
                if deviation > DEVIATION_ALERT {
                    score += DEVIATION_WEIGHT;
                    tags.push("sudden_behavior_change".to_string());
                }
            }

            if entry.window.len() == SEQ_CAPACITY {
                entry.window.pop_front();
            }
            entry.window.push_back(projection);
        }

        for pattern in PATTERN_LIBRARY {
            if euclidean(&projection, &pattern.centroid) < PATTERN_DISTANCE {
                score += PATTERN_WEIGHT;
                tags.push(pattern.tag.to_string());
            }
        }
        for (tag, centroid) in self.learned.read().iter() {
            if euclidean(&projection, centroid) < PATTERN_DISTANCE {
                score += PATTERN_WEIGHT;
                tags.push(tag.clone());
            }
        }

        self.evict_if_crowded();

        AnomalyResult { anomaly_score: score.min(1.0), tags }
    }

    pub fn tracked_users(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_len(&self, user_id: &str) -> usize {
        self.buffers.get(user_id).map(|b| b.window.len()).unwrap_or(0)
    }

    /// Global LRU pressure valve: over capacity, drop the stalest tenth.
    fn evict_if_crowded(&self) {
        if self.buffers.len() <= MAX_TRACKED_USERS {
            return;
        }
        let mut ages: Vec<(String, Instant)> = self
            .buffers
            .iter()
            .map(|e| (e.key().clone(), e.value().last_touch))
            .collect();
        ages.sort_by_key(|(_, touch)| *touch);
        let evict = self.buffers.len() - MAX_TRACKED_USERS + MAX_TRACKED_USERS / 10;
        for (user, _) in ages.into_iter().take(evict) {
            self.buffers.remove(&user);
        }
        debug!(evicted = evict, remaining = self.buffers.len(), "sequence buffers evicted");
    }
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed numeric projection of the feature map.
pub fn project(features: &FeatureMap) -> [f64; PROJECTION_DIM] {
    [
        features.get("amount_log"),
        features.get("amount_income_ratio"),
        features.get("account_age_log"),
        features.get("ip_anonymity_score"),
        features.get("network_risk_score"),
        features.get("doc_risk"),
    ]
}

/// min(‖current − mean(prior)‖ / 10, 1.0)
fn deviation_from_prior(current: &[f64; PROJECTION_DIM], prior: &[[f64; PROJECTION_DIM]]) -> f64 {
    let n = prior.len() as f64;
    let mut mean = [0.0; PROJECTION_DIM];
    for p in prior {
        for (m, v) in mean.iter_mut().zip(p.iter()) {
            *m += v / n;
        }
    }
    (euclidean(current, &mean) / 10.0).min(1.0)
}

fn euclidean(a: &[f64; PROJECTION_DIM], b: &[f64; PROJECTION_DIM]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}
