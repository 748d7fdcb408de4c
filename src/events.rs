// src/events.rs
//
// Domain types flowing through the pipeline: the inbound transaction event
// with its embedded read-only profiles, per-layer outcomes, the investigation
// report, processed cases, and discovered patterns.
//
// Transactions arrive as the `event_data` JSON of a stream entry and are
// immutable once decoded. Missing profile fields default — upstream schema
// drift must never kill an investigation.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::features::FeatureMap;

// ── Inbound transaction ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,
    pub user_id:        String,
    pub timestamp:      DateTime<Utc>,
    pub amount:         Decimal,
    #[serde(default)]
    pub currency:       String,
    pub transaction_type: TxnType,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default)]
    pub ip_address:     String,
    #[serde(default)]
    pub device_id:      String,
    #[serde(default)]
    pub country_code:   String,

    #[serde(default)]
    pub user:     UserProfile,
    #[serde(default)]
    pub ip:       IpProfile,
    #[serde(default)]
    pub device:   DeviceProfile,
    #[serde(default)]
    pub document: DocumentProfile,
}

impl Transaction {
    /// Amount as the f64 the feature pipeline consumes. Non-representable
    /// decimals clamp to 0 rather than poisoning downstream math.
    pub fn amount_f64(&self) -> f64 {
        self.amount.to_f64().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnType {
    Deposit,
    Withdrawal,
    Trade,
}

impl std::fmt::Display for TxnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deposit    => write!(f, "deposit"),
            Self::Withdrawal => write!(f, "withdrawal"),
            Self::Trade      => write!(f, "trade"),
        }
    }
}

// ── Embedded read-only profiles ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub declared_monthly_income: f64,
    pub account_created_at:      Option<DateTime<Utc>>,
    pub risk_level:              RiskLevel,
    pub kyc_status:              String,
    pub employment_status:       String,
    pub source_of_funds:         String,
    pub total_deposits:          f64,
    pub total_withdrawals:       f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpProfile {
    pub is_vpn:                bool,
    pub is_tor:                bool,
    pub is_proxy:              bool,
    pub is_datacenter:         bool,
    pub is_anonymous:          bool,
    pub is_sanctioned_country: bool,
    pub is_high_risk_country:  bool,
    pub risk_score:            f64,
    pub unique_users:          u32,
    pub unique_devices:        u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub is_emulator:  bool,
    pub unique_users: u32,
    pub unique_ips:   u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentProfile {
    pub verification_status: String,
    pub score:               f64,
    pub face_match:          bool,
    pub is_forged:           bool,
    pub is_ai_generated:     bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

// ── Decisions & layers ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AutoApproved,
    AutoBlocked,
    HumanReview,
}

impl Decision {
    /// Sink-facing status string; `human_review` maps to the case-management
    /// vocabulary.
    pub fn sink_status(&self) -> &'static str {
        match self {
            Self::AutoApproved => "auto_approved",
            Self::AutoBlocked  => "auto_blocked",
            Self::HumanReview  => "under_investigation",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoApproved => write!(f, "auto_approved"),
            Self::AutoBlocked  => write!(f, "auto_blocked"),
            Self::HumanReview  => write!(f, "human_review"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub enum LayerKind {
    RuleBased,
    MlModels,
    GraphAnalysis,
    PatternDetection,
    LlmReasoning,
}

impl LayerKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::RuleBased        => "rule_based",
            Self::MlModels         => "ml_models",
            Self::GraphAnalysis    => "graph_analysis",
            Self::PatternDetection => "pattern_detection",
            Self::LlmReasoning     => "llm_reasoning",
        }
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_name())
    }
}

// ── Investigation report ──────────────────────────────────────────────────────
//
// Single output of the orchestrator per case; the publisher projects this into
// the sink payload and PatternDiscovery keeps the ProcessedCase projection.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationReport {
    pub case_id:          String,
    pub user_id:          String,
    pub decision:         Decision,
    pub confidence:       f64,
    pub combined_score:   f64,
    pub ml_score:         f64,
    /// None when the layer was gated away (wire: null sub-object).
    pub ring_score:       Option<f64>,
    pub anomaly_score:    Option<f64>,
    pub llm_confidence:   Option<f64>,
    pub top_risk_factors: Vec<String>,
    pub anomaly_tags:     Vec<String>,
    pub connected_users:  Vec<String>,
    pub fraud_ring_id:    Option<String>,
    pub layers_executed:  Vec<LayerKind>,
    pub layers_skipped:   Vec<LayerKind>,
    pub annotations:      Vec<String>,
    pub reasoning:        String,
    pub recommendation:   String,
    pub features:         FeatureMap,
    pub feature_count:    usize,
    pub processing_ms:    u64,
    pub timestamp:        DateTime<Utc>,
}

impl InvestigationReport {
    pub fn layer_executed(&self, layer: LayerKind) -> bool {
        self.layers_executed.contains(&layer)
    }
}

// ── Processed case (discovery ring entry) ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedCase {
    pub case_id:        String,
    pub features:       FeatureMap,
    pub ml_score:       f64,
    pub ring_score:     f64,
    pub anomaly_score:  f64,
    pub combined_score: f64,
    pub decision:       Decision,
    pub confidence:     f64,
    pub processing_ms:  u64,
    pub timestamp:      DateTime<Utc>,
}

impl From<&InvestigationReport> for ProcessedCase {
    fn from(r: &InvestigationReport) -> Self {
        Self {
            case_id:        r.case_id.clone(),
            features:       r.features.clone(),
            ml_score:       r.ml_score,
            ring_score:     r.ring_score.unwrap_or(0.0),
            anomaly_score:  r.anomaly_score.unwrap_or(0.0),
            combined_score: r.combined_score,
            decision:       r.decision,
            confidence:     r.confidence,
            processing_ms:  r.processing_ms,
            timestamp:      r.timestamp,
        }
    }
}

// ── Discovered pattern ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPattern {
    pub pattern_id:   String,
    pub pattern_type: String,
    /// Human-readable predicate over the feature map, e.g.
    /// "amount_income_ratio > 10".
    pub signature:    String,
    pub occurrences:  u64,
    pub first_seen:   DateTime<Utc>,
    pub last_seen:    DateTime<Utc>,
    pub precision:    f64,
    pub recall:       f64,
    /// Mean behavioral projection of the matching blocked cases — consumed
    /// by the anomaly layer at warmup.
    pub centroid:     Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn minimal_tx_json() -> &'static str {
        r#"{
            "transaction_id": "tx-1",
            "user_id": "u-1",
            "timestamp": "2026-03-01T12:00:00Z",
            "amount": "123.45",
            "transaction_type": "deposit"
        }"#
    }

    #[test]
    fn transaction_decodes_with_defaulted_profiles() {
        let tx: Transaction = serde_json::from_str(minimal_tx_json()).unwrap();
        assert_eq!(tx.transaction_id, "tx-1");
        assert_eq!(tx.transaction_type, TxnType::Deposit);
        assert_eq!(tx.amount, Decimal::new(12345, 2));
        assert_eq!(tx.user.declared_monthly_income, 0.0);
        assert!(!tx.ip.is_tor);
        assert_eq!(tx.user.risk_level, RiskLevel::Low);
    }

    #[test]
    fn decision_sink_mapping() {
        assert_eq!(Decision::AutoApproved.sink_status(), "auto_approved");
        assert_eq!(Decision::AutoBlocked.sink_status(), "auto_blocked");
        assert_eq!(Decision::HumanReview.sink_status(), "under_investigation");
    }

    #[test]
    fn layer_wire_names() {
        assert_eq!(LayerKind::RuleBased.wire_name(), "rule_based");
        assert_eq!(LayerKind::LlmReasoning.wire_name(), "llm_reasoning");
    }

    #[test]
    fn risk_level_parses_lowercase() {
        assert_eq!(serde_json::from_str::<RiskLevel>(r#""high""#).unwrap(), RiskLevel::High);
    }
}
