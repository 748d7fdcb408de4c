// src/layers/extract.rs
//
// Layer 1 — feature extraction. One transaction plus six concurrent history
// reads become the schema-locked feature map every later layer consumes.
//
// A failed read zero-fills its feature block and marks the extraction
// degraded; the orchestrator refuses to auto-decide on degraded inputs.

use std::sync::Arc;

use chrono::{Datelike, Timelike, Utc};
use tracing::warn;

use crate::events::Transaction;
use crate::features::FeatureMap;
use crate::history::{
    DeviceHistory, EscalationCheck, FraudHistory, HistoryReader, IpHistory, StructuringCheck,
    VelocityMetrics,
};

const NEW_ACCOUNT_HOURS:      f64 = 24.0;
const VERY_NEW_ACCOUNT_HOURS: f64 = 1.0;
const FANOUT_SATURATION:      f64 = 20.0;

pub struct FeatureExtractor {
    history: Arc<dyn HistoryReader>,
}

/// L1 output: the feature map plus the degradation record.
#[derive(Debug)]
pub struct Extraction {
    pub features:       FeatureMap,
    pub degraded:       bool,
    pub failed_queries: Vec<&'static str>,
}

impl FeatureExtractor {
    pub fn new(history: Arc<dyn HistoryReader>) -> Self {
        Self { history }
    }

    pub async fn extract(&self, tx: &Transaction) -> Extraction {
        let amount = tx.amount_f64();

        let (velocity, device, ip, escalation, structuring, fraud) = tokio::join!(
            self.history.velocity(&tx.user_id),
            self.history.device_history(&tx.device_id),
            self.history.ip_history(&tx.ip_address),
            self.history.detect_escalation(&tx.user_id, amount),
            self.history.detect_structuring(&tx.user_id, amount),
            self.history.user_fraud_history(&tx.user_id),
        );

        let mut failed: Vec<&'static str> = Vec::new();
        let velocity = unwrap_or_track(velocity, "velocity", &mut failed);
        let device = unwrap_or_track(device, "device_history", &mut failed);
        let ip = unwrap_or_track(ip, "ip_history", &mut failed);
        let escalation = unwrap_or_track(escalation, "detect_escalation", &mut failed);
        let structuring = unwrap_or_track(structuring, "detect_structuring", &mut failed);
        let fraud = unwrap_or_track(fraud, "user_fraud_history", &mut failed);

        if !failed.is_empty() {
            warn!(user = %tx.user_id, queries = ?failed, "history reads degraded, zero-filling");
        }

        let features = build_features(tx, &velocity, &device, &ip, &escalation, &structuring, &fraud);
        Extraction { degraded: !failed.is_empty(), failed_queries: failed, features }
    }
}

fn unwrap_or_track<T: Default>(
    result: Result<T, crate::error::EngineError>,
    query: &'static str,
    failed: &mut Vec<&'static str>,
) -> T {
    match result {
        Ok(v) => v,
        Err(_) => {
            failed.push(query);
            T::default()
        }
    }
}

fn build_features(
    tx: &Transaction,
    velocity: &VelocityMetrics,
    device: &DeviceHistory,
    ip: &IpHistory,
    escalation: &EscalationCheck,
    structuring: &StructuringCheck,
    fraud: &FraudHistory,
) -> FeatureMap {
    let mut f = FeatureMap::new();
    let amount = tx.amount_f64();

    // Amount
    f.set("amount_raw", amount);
    f.set("amount_log", (1.0 + amount).ln());
    f.set("amount_income_ratio", amount / tx.user.declared_monthly_income.max(1.0));
    let zscore = if velocity.stddev_amount_30d > 0.0 {
        (amount - velocity.avg_amount_30d).abs() / velocity.stddev_amount_30d
    } else {
        0.0
    };
    f.set("amount_zscore", zscore);

    // Temporal
    let hour = tx.timestamp.hour() as f64;
    let weekday = tx.timestamp.weekday().num_days_from_monday() as f64;
    f.set("hour_of_day", hour);
    f.set("day_of_week", weekday);
    f.set_flag("is_night", hour >= 22.0 || hour <= 6.0);
    f.set_flag("is_business_hours", (9.0..=17.0).contains(&hour));
    f.set_flag("is_weekend", weekday >= 5.0);

    // Account age — wall clock against the declared creation timestamp.
    let age_hours = tx
        .user
        .account_created_at
        .map(|created| (Utc::now() - created).num_seconds().max(0) as f64 / 3600.0)
        .unwrap_or(0.0);
    f.set("account_age_hours", age_hours);
    f.set("account_age_days", age_hours / 24.0);
    f.set("account_age_log", (1.0 + age_hours).ln());
    f.set_flag("is_new_account", age_hours < NEW_ACCOUNT_HOURS);
    f.set_flag("is_very_new_account", age_hours < VERY_NEW_ACCOUNT_HOURS);

    // Velocity
    f.set("txn_last_24h", velocity.txn_last_24h as f64);
    f.set("deposits_last_24h", velocity.deposits_last_24h as f64);
    f.set("withdrawals_last_24h", velocity.withdrawals_last_24h as f64);
    f.set("txn_last_7d", velocity.txn_last_7d as f64);
    f.set("deposits_last_7d", velocity.deposits_last_7d as f64);
    f.set("txn_last_30d", velocity.txn_last_30d as f64);
    f.set("avg_amount_30d", velocity.avg_amount_30d);
    f.set("stddev_amount_30d", velocity.stddev_amount_30d);
    f.set("total_txns", velocity.total_txns as f64);
    f.set("total_deposits", velocity.total_deposits);
    f.set("total_withdrawals", velocity.total_withdrawals);
    f.set("deposit_withdrawal_ratio", velocity.total_deposits / velocity.total_withdrawals.max(1.0));
    f.set("avg_transaction_size", velocity.total_deposits / (velocity.total_txns.max(1) as f64));

    // Network fanout
    f.set("device_unique_users", device.unique_users as f64);
    f.set("device_unique_ips", device.unique_ips as f64);
    f.set("device_flag_rate", device.flag_rate);
    f.set("ip_unique_users", ip.unique_users as f64);
    f.set("ip_unique_devices", ip.unique_devices as f64);
    f.set("ip_flag_rate", ip.flag_rate);
    let fanout = (device.unique_users + ip.unique_users) as f64;
    f.set("network_risk_score", (fanout / FANOUT_SATURATION).min(1.0));
    f.set_flag("is_multi_device_ip", device.unique_users > 3 && ip.unique_users > 3);
    f.set_flag("is_shared_device", device.unique_users > 1);
    f.set_flag("is_shared_ip", ip.unique_users > 1);

    // Escalation / structuring
    f.set_flag("is_escalating", escalation.is_escalating);
    f.set("escalation_ratio", escalation.escalation_ratio);
    f.set("escalation_count", escalation.count as f64);
    f.set_flag("is_structuring", structuring.is_structuring);
    f.set("structuring_count_48h", structuring.similar_48h as f64);
    f.set("structuring_total_48h", structuring.total_amount_48h);

    // Behavioral risk
    f.set("employment_risk", employment_risk(&tx.user.employment_status));
    f.set("source_of_funds_risk", source_of_funds_risk(&tx.user.source_of_funds));

    // IP / identity
    let anonymity_flags = [tx.ip.is_vpn, tx.ip.is_tor, tx.ip.is_proxy, tx.ip.is_datacenter];
    let anonymity = anonymity_flags.iter().filter(|&&b| b).count() as f64 / anonymity_flags.len() as f64;
    f.set("ip_anonymity_score", anonymity);
    f.set_flag("ip_is_vpn", tx.ip.is_vpn);
    f.set_flag("ip_is_tor", tx.ip.is_tor);
    f.set_flag("ip_is_proxy", tx.ip.is_proxy);
    f.set_flag("ip_is_datacenter", tx.ip.is_datacenter);
    f.set_flag("ip_is_sanctioned", tx.ip.is_sanctioned_country);
    f.set_flag("ip_is_high_risk", tx.ip.is_high_risk_country);
    f.set("ip_risk_score", tx.ip.risk_score);
    f.set_flag("device_is_emulator", tx.device.is_emulator);
    f.set_flag("kyc_unverified", !tx.user.kyc_status.eq_ignore_ascii_case("verified"));

    // Document
    f.set("doc_risk", 1.0 - tx.document.score);
    f.set_flag("doc_face_match", tx.document.face_match);
    f.set_flag("doc_is_forged", tx.document.is_forged);
    f.set_flag("doc_is_ai_generated", tx.document.is_ai_generated);

    // Fraud history
    f.set_flag("has_fraud_history", fraud.has_history);
    f.set("prior_fraud_cases", fraud.total_cases as f64);
    f.set("confirmed_fraud_cases", fraud.confirmed_cases as f64);

    f
}

fn employment_risk(status: &str) -> f64 {
    match status.to_ascii_lowercase().as_str() {
        "unemployed"    => 0.7,
        "student"       => 0.5,
        "self_employed" => 0.3,
        "employed"      => 0.1,
        "retired"       => 0.2,
        _               => 0.5,
    }
}

fn source_of_funds_risk(source: &str) -> f64 {
    match source.to_ascii_lowercase().as_str() {
        "salary"      => 0.1,
        "business"    => 0.2,
        "investment"  => 0.3,
        "inheritance" => 0.4,
        "other"       => 0.6,
        _             => 0.5,
    }
}
