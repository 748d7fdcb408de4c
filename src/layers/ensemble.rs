// src/layers/ensemble.rs
//
// Layer 2 — weighted rule ensemble. Five groups, each scored as the maximum
// fired predicate times the group weight; the final probability is the
// weighted mean over the groups that fired (silent groups carry no evidence
// either way, so they drop out of the denominator).
//
// The rule table is the model. Every threshold is enumerable below; changing
// one is a model change and belongs in review.

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::events::ProcessedCase;
use crate::features::FeatureMap;

/// Update-buffer capacity — the batch learning hook runs on fill.
pub const UPDATE_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum Group {
    Amount   = 0,
    Velocity = 1,
    Network  = 2,
    Geo      = 3,
    Identity = 4,
}

const N_GROUPS: usize = 5;

/// Boot weights per group — refined online through the batch hook.
const BOOT_WEIGHTS: [f64; N_GROUPS] = [0.25, 0.20, 0.20, 0.20, 0.15];

type Pred = fn(&FeatureMap) -> bool;

struct Rule {
    group: Group,
    name:  &'static str,
    score: f64,
    fires: Pred,
}

const RULES: &[Rule] = &[
    // ── amount ────────────────────────────────────────────────────────────────
    Rule { group: Group::Amount, name: "income_ratio_gt_15", score: 0.90,
           fires: |f| f.get("amount_income_ratio") > 15.0 },
    Rule { group: Group::Amount, name: "income_ratio_gt_10", score: 0.70,
           fires: |f| f.get("amount_income_ratio") > 10.0 },
    Rule { group: Group::Amount, name: "income_ratio_gt_5", score: 0.50,
           fires: |f| f.get("amount_income_ratio") > 5.0 },
    Rule { group: Group::Amount, name: "new_account_large_amount", score: 0.95,
           fires: |f| f.flag("is_new_account") && f.get("amount_raw") > 5000.0 },
    Rule { group: Group::Amount, name: "zscore_gt_4", score: 0.80,
           fires: |f| f.get("amount_zscore") > 4.0 },
    Rule { group: Group::Amount, name: "zscore_gt_2_5", score: 0.55,
           fires: |f| f.get("amount_zscore") > 2.5 },
    Rule { group: Group::Amount, name: "structuring_band", score: 0.90,
           fires: |f| f.flag("is_structuring") },
    // ── velocity ──────────────────────────────────────────────────────────────
    Rule { group: Group::Velocity, name: "txn_24h_gt_20", score: 0.90,
           fires: |f| f.get("txn_last_24h") > 20.0 },
    Rule { group: Group::Velocity, name: "txn_24h_gt_10", score: 0.60,
           fires: |f| f.get("txn_last_24h") > 10.0 },
    Rule { group: Group::Velocity, name: "withdrawals_24h_gt_5", score: 0.70,
           fires: |f| f.get("withdrawals_last_24h") > 5.0 },
    Rule { group: Group::Velocity, name: "amount_escalation", score: 0.75,
           fires: |f| f.flag("is_escalating") },
    Rule { group: Group::Velocity, name: "txn_7d_gt_50", score: 0.65,
           fires: |f| f.get("txn_last_7d") > 50.0 },
    // ── network ───────────────────────────────────────────────────────────────
    Rule { group: Group::Network, name: "multi_device_ip", score: 0.80,
           fires: |f| f.flag("is_multi_device_ip") },
    Rule { group: Group::Network, name: "network_risk_gt_0_6", score: 0.75,
           fires: |f| f.get("network_risk_score") > 0.6 },
    Rule { group: Group::Network, name: "tor_exit", score: 0.85,
           fires: |f| f.flag("ip_is_tor") },
    Rule { group: Group::Network, name: "anonymity_gt_0_5", score: 0.70,
           fires: |f| f.get("ip_anonymity_score") > 0.5 },
    Rule { group: Group::Network, name: "device_flag_rate_gt_0_3", score: 0.80,
           fires: |f| f.get("device_flag_rate") > 0.3 },
    // ── geo ───────────────────────────────────────────────────────────────────
    Rule { group: Group::Geo, name: "sanctioned_country", score: 1.00,
           fires: |f| f.flag("ip_is_sanctioned") },
    Rule { group: Group::Geo, name: "tor_from_high_risk", score: 0.80,
           fires: |f| f.flag("ip_is_tor") && f.flag("ip_is_high_risk") },
    Rule { group: Group::Geo, name: "high_risk_country", score: 0.60,
           fires: |f| f.flag("ip_is_high_risk") },
    Rule { group: Group::Geo, name: "ip_risk_gt_0_7", score: 0.65,
           fires: |f| f.get("ip_risk_score") > 0.7 },
    // ── identity ──────────────────────────────────────────────────────────────
    Rule { group: Group::Identity, name: "very_new_account", score: 0.95,
           fires: |f| f.flag("is_very_new_account") },
    Rule { group: Group::Identity, name: "new_account", score: 0.60,
           fires: |f| f.flag("is_new_account") },
    Rule { group: Group::Identity, name: "forged_or_synthetic_doc", score: 0.95,
           fires: |f| f.flag("doc_is_forged") || f.flag("doc_is_ai_generated") },
    Rule { group: Group::Identity, name: "doc_risk_gt_0_5", score: 0.65,
           fires: |f| f.get("doc_risk") > 0.5 },
    Rule { group: Group::Identity, name: "unverified_kyc_over_1k", score: 0.70,
           fires: |f| f.flag("kyc_unverified") && f.get("amount_raw") > 1000.0 },
];

// Post-hoc risk-factor mapping for the verdict payload.
const RISK_FACTORS: &[(&str, Pred)] = &[
    ("high_income_ratio",    |f| f.get("amount_income_ratio") > 5.0),
    ("sanctioned_country",   |f| f.flag("ip_is_sanctioned")),
    ("anonymous_connection", |f| f.get("ip_anonymity_score") > 0.5),
    ("new_account",          |f| f.flag("is_new_account")),
    ("shared_resources",     |f| f.get("network_risk_score") > 0.6),
    ("structuring_pattern",  |f| f.flag("is_structuring")),
    ("amount_escalation",    |f| f.flag("is_escalating")),
    ("weak_documents",       |f| f.get("doc_risk") > 0.5),
];

pub struct GradientEnsemble {
    weights:       RwLock<[f64; N_GROUPS]>,
    update_buffer: Mutex<Vec<ProcessedCase>>,
}

impl GradientEnsemble {
    pub fn new() -> Self {
        Self {
            weights:       RwLock::new(BOOT_WEIGHTS),
            update_buffer: Mutex::new(Vec::with_capacity(UPDATE_BATCH)),
        }
    }

    /// Restore weights from a persisted snapshot; wrong-shaped blobs are
    /// ignored and boot weights stand.
    pub fn restore_weights(&self, weights: &[f64]) {
        if weights.len() == N_GROUPS && weights.iter().all(|w| w.is_finite() && *w > 0.0) {
            *self.weights.write() = [weights[0], weights[1], weights[2], weights[3], weights[4]];
        }
    }

    pub fn weights(&self) -> Vec<f64> {
        self.weights.read().to_vec()
    }

    /// Score a feature map. Returns the fraud probability and the post-hoc
    /// top risk factors.
    pub fn score(&self, features: &FeatureMap) -> (f64, Vec<String>) {
        let mut group_max = [0.0f64; N_GROUPS];
        for rule in RULES {
            if (rule.fires)(features) {
                let g = rule.group as usize;
                if rule.score > group_max[g] {
                    group_max[g] = rule.score;
                }
            }
        }

        let weights = self.weights.read();
        let mut num = 0.0;
        let mut denom = 0.0;
        for g in 0..N_GROUPS {
            if group_max[g] > 0.0 {
                num += weights[g] * group_max[g];
                denom += weights[g];
            }
        }
        let score = if denom > 0.0 { (num / denom).clamp(0.0, 1.0) } else { 0.0 };

        let factors = RISK_FACTORS
            .iter()
            .filter(|(_, fires)| fires(features))
            .map(|(name, _)| (*name).to_string())
            .collect();

        (score, factors)
    }

    /// Names of the rules that fired, for diagnostics.
    pub fn fired_rules(&self, features: &FeatureMap) -> Vec<&'static str> {
        RULES.iter().filter(|r| (r.fires)(features)).map(|r| r.name).collect()
    }

    /// Feed a verified case into the online-learning buffer. On fill the
    /// batch hook drains it. The hook is contracted but deliberately inert:
    /// correctness never depends on it.
    pub fn record_verified(&self, case: ProcessedCase) {
        let batch = {
            let mut buffer = self.update_buffer.lock();
            buffer.push(case);
            if buffer.len() >= UPDATE_BATCH {
                std::mem::take(&mut *buffer)
            } else {
                return;
            }
        };
        self.learn_batch(&batch);
    }

    pub fn buffered_updates(&self) -> usize {
        self.update_buffer.lock().len()
    }

    fn learn_batch(&self, batch: &[ProcessedCase]) {
        let blocked = batch.iter().filter(|c| c.decision == crate::events::Decision::AutoBlocked).count();
        info!(
            batch = batch.len(),
            blocked,
            approved = batch.len() - blocked,
            "ensemble batch hook: weights unchanged"
        );
    }
}

impl Default for GradientEnsemble {
    fn default() -> Self {
        Self::new()
    }
}
