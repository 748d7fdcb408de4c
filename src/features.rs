// src/features.rs
//
// Schema-locked feature map. FEATURE_KEYS is the single source of truth: the
// extractor writes only these keys, tests enumerate them, and the verdict
// payload's flag objects project from them. Boolean features are stored as
// 0.0/1.0.
//
// Every write passes through a finiteness normalizer — NaN and infinities
// collapse to 0.0 so no layer ever sees a non-finite number.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const FEATURE_KEYS: &[&str] = &[
    // Amount
    "amount_raw",
    "amount_log",
    "amount_income_ratio",
    "amount_zscore",
    // Temporal
    "hour_of_day",
    "day_of_week",
    "is_night",
    "is_business_hours",
    "is_weekend",
    // Account age
    "account_age_hours",
    "account_age_days",
    "account_age_log",
    "is_new_account",
    "is_very_new_account",
    // Velocity (database-driven)
    "txn_last_24h",
    "deposits_last_24h",
    "withdrawals_last_24h",
    "txn_last_7d",
    "deposits_last_7d",
    "txn_last_30d",
    "avg_amount_30d",
    "stddev_amount_30d",
    "total_txns",
    "total_deposits",
    "total_withdrawals",
    "deposit_withdrawal_ratio",
    "avg_transaction_size",
    // Network fanout
    "device_unique_users",
    "device_unique_ips",
    "device_flag_rate",
    "ip_unique_users",
    "ip_unique_devices",
    "ip_flag_rate",
    "network_risk_score",
    "is_multi_device_ip",
    "is_shared_device",
    "is_shared_ip",
    // Escalation / structuring
    "is_escalating",
    "escalation_ratio",
    "escalation_count",
    "is_structuring",
    "structuring_count_48h",
    "structuring_total_48h",
    // Behavioral risk
    "employment_risk",
    "source_of_funds_risk",
    // IP / identity
    "ip_anonymity_score",
    "ip_is_vpn",
    "ip_is_tor",
    "ip_is_proxy",
    "ip_is_datacenter",
    "ip_is_sanctioned",
    "ip_is_high_risk",
    "ip_risk_score",
    "device_is_emulator",
    "kyc_unverified",
    // Document
    "doc_risk",
    "doc_face_match",
    "doc_is_forged",
    "doc_is_ai_generated",
    // Fraud history
    "has_fraud_history",
    "prior_fraud_cases",
    "confirmed_fraud_cases",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FeatureMap {
    values: BTreeMap<String, f64>,
}

impl FeatureMap {
    /// Empty map — reads return 0.0 until the extractor fills the schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fully zero-filled schema, used for degraded-input verdicts.
    pub fn zeroed() -> Self {
        let mut map = Self::new();
        for key in FEATURE_KEYS {
            map.values.insert((*key).to_string(), 0.0);
        }
        map
    }

    pub fn set(&mut self, key: &str, value: f64) {
        debug_assert!(FEATURE_KEYS.contains(&key), "unknown feature key: {key}");
        self.values.insert(key.to_string(), normalize(value));
    }

    pub fn set_flag(&mut self, key: &str, value: bool) {
        self.set(key, if value { 1.0 } else { 0.0 });
    }

    pub fn get(&self, key: &str) -> f64 {
        self.values.get(key).copied().unwrap_or(0.0)
    }

    /// Boolean view of a 0/1 feature.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) > 0.5
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// NaN and infinities collapse to 0.0 — the schema guarantees finite values.
fn normalize(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}
