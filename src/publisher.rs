// src/publisher.rs
//
// Verdict publisher. Projects an InvestigationReport into the
// case-management payload and POSTs it with a bounded exponential backoff.
// The sink is idempotent on caseId, so a duplicate delivery after a partial
// failure is harmless; a final failure is logged and the stream moves on.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::warn;

use crate::error::EngineError;
use crate::events::{InvestigationReport, LayerKind};

pub const MODEL_VERSION: &str = "2.1.0";

const SINK_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_JITTER_MS: u64 = 100;

// ── Payload ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictPayload {
    pub case_id:              String,
    pub status:               &'static str,
    pub confidence_score:     f64,
    pub fraud_probability:    f64,
    pub triggered_by:         &'static str,
    pub detection_signals:    DetectionSignals,
    pub ai_signals:           AiSignals,
    pub identity_flags:       IdentityFlags,
    pub behavioral_flags:     BehavioralFlags,
    pub network_flags:        NetworkFlags,
    pub ai_reasoning:         String,
    pub ai_recommendations:   String,
    pub investigation_layers: Vec<&'static str>,
    pub processing_time_ms:   u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraud_ring_id:        Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub related_accounts:     Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSignals {
    pub ensemble_score:     f64,
    pub ring_score:         Option<f64>,
    pub anomaly_score:      Option<f64>,
    pub combined_score:     f64,
    pub processing_time_ms: u64,
    pub model_version:      &'static str,
    pub top_risk_factors:   Vec<String>,
    pub detected_anomalies: Vec<String>,
    pub layers_executed:    Vec<&'static str>,
    pub layers_skipped:     Vec<&'static str>,
}

/// Per-layer diagnostics; a skipped layer serializes as null.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSignals {
    pub rule_based:        Option<RuleSignal>,
    pub ml_models:         Option<MlSignal>,
    pub graph_analysis:    Option<GraphSignal>,
    pub pattern_detection: Option<PatternSignal>,
    pub llm_reasoning:     Option<LlmSignal>,
    pub layer_unavailable: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSignal {
    pub feature_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MlSignal {
    pub score:       f64,
    pub risk_factors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSignal {
    pub ring_score:      f64,
    pub connected_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternSignal {
    pub anomaly_score: f64,
    pub tags:          Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSignal {
    pub confidence: f64,
    pub reasoning:  String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityFlags {
    pub new_account:           bool,
    pub very_new_account:      bool,
    pub kyc_unverified:        bool,
    pub document_risk:         f64,
    pub forged_document:       bool,
    pub ai_generated_document: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BehavioralFlags {
    pub structuring:        bool,
    pub escalation:         bool,
    pub night_transaction:  bool,
    pub high_velocity:      bool,
    pub amount_zscore:      f64,
    pub income_ratio:       f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFlags {
    pub anonymity_score:    f64,
    pub tor:                bool,
    pub vpn:                bool,
    pub proxy:              bool,
    pub datacenter:         bool,
    pub sanctioned_country: bool,
    pub high_risk_country:  bool,
    pub shared_device:      bool,
    pub shared_ip:          bool,
    pub multi_device_ip:    bool,
    pub network_risk_score: f64,
}

/// Project a finished investigation into the sink payload.
pub fn build_payload(report: &InvestigationReport) -> VerdictPayload {
    let f = &report.features;
    let executed: Vec<&'static str> =
        report.layers_executed.iter().map(LayerKind::wire_name).collect();
    let skipped: Vec<&'static str> =
        report.layers_skipped.iter().map(LayerKind::wire_name).collect();

    let degraded = report
        .annotations
        .iter()
        .any(|a| a == "degraded_inputs" || a == "layer_unavailable");

    VerdictPayload {
        case_id: report.case_id.clone(),
        status: report.decision.sink_status(),
        confidence_score: report.confidence,
        fraud_probability: report.combined_score,
        triggered_by: "AI_INVESTIGATION",
        detection_signals: DetectionSignals {
            ensemble_score:     report.ml_score,
            ring_score:         report.ring_score,
            anomaly_score:      report.anomaly_score,
            combined_score:     report.combined_score,
            processing_time_ms: report.processing_ms,
            model_version:      MODEL_VERSION,
            top_risk_factors:   report.top_risk_factors.clone(),
            detected_anomalies: report.anomaly_tags.clone(),
            layers_executed:    executed.clone(),
            layers_skipped:     skipped,
        },
        ai_signals: AiSignals {
            rule_based: report
                .layer_executed(LayerKind::RuleBased)
                .then(|| RuleSignal { feature_count: report.feature_count }),
            ml_models: report.layer_executed(LayerKind::MlModels).then(|| MlSignal {
                score:        report.ml_score,
                risk_factors: report.top_risk_factors.clone(),
            }),
            graph_analysis: report.ring_score.map(|ring_score| GraphSignal {
                ring_score,
                connected_users: report.connected_users.clone(),
            }),
            pattern_detection: report.anomaly_score.map(|anomaly_score| PatternSignal {
                anomaly_score,
                tags: report.anomaly_tags.clone(),
            }),
            llm_reasoning: report.llm_confidence.map(|confidence| LlmSignal {
                confidence,
                reasoning: report.reasoning.clone(),
            }),
            layer_unavailable: degraded,
        },
        identity_flags: IdentityFlags {
            new_account:           f.flag("is_new_account"),
            very_new_account:      f.flag("is_very_new_account"),
            kyc_unverified:        f.flag("kyc_unverified"),
            document_risk:         f.get("doc_risk"),
            forged_document:       f.flag("doc_is_forged"),
            ai_generated_document: f.flag("doc_is_ai_generated"),
        },
        behavioral_flags: BehavioralFlags {
            structuring:       f.flag("is_structuring"),
            escalation:        f.flag("is_escalating"),
            night_transaction: f.flag("is_night"),
            high_velocity:     f.get("txn_last_24h") > 10.0,
            amount_zscore:     f.get("amount_zscore"),
            income_ratio:      f.get("amount_income_ratio"),
        },
        network_flags: NetworkFlags {
            anonymity_score:    f.get("ip_anonymity_score"),
            tor:                f.flag("ip_is_tor"),
            vpn:                f.flag("ip_is_vpn"),
            proxy:              f.flag("ip_is_proxy"),
            datacenter:         f.flag("ip_is_datacenter"),
            sanctioned_country: f.flag("ip_is_sanctioned"),
            high_risk_country:  f.flag("ip_is_high_risk"),
            shared_device:      f.flag("is_shared_device"),
            shared_ip:          f.flag("is_shared_ip"),
            multi_device_ip:    f.flag("is_multi_device_ip"),
            network_risk_score: f.get("network_risk_score"),
        },
        ai_reasoning: report.reasoning.clone(),
        ai_recommendations: report.recommendation.clone(),
        investigation_layers: executed,
        processing_time_ms: report.processing_ms,
        fraud_ring_id: report.fraud_ring_id.clone(),
        related_accounts: report.connected_users.clone(),
    }
}

// ── Publisher ─────────────────────────────────────────────────────────────────

pub struct VerdictPublisher {
    client: reqwest::Client,
    url:    String,
}

impl VerdictPublisher {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SINK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, url: url.into() }
    }

    /// POST with bounded exponential backoff. A final failure surfaces as
    /// `sink_unavailable`; the caller logs and moves on.
    pub async fn publish(&self, payload: &VerdictPayload) -> Result<(), EngineError> {
        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            match self.client.post(&self.url).json(payload).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_error = format!("sink returned {}", response.status());
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
            if attempt + 1 < MAX_ATTEMPTS {
                let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
                let delay = BACKOFF_BASE_MS * (1u64 << attempt) + jitter;
                warn!(case = %payload.case_id, attempt, delay_ms = delay, "verdict POST failed, retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        Err(EngineError::SinkUnavailable(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Decision, InvestigationReport};
    use crate::features::FeatureMap;
    use chrono::Utc;

    fn report(decision: Decision) -> InvestigationReport {
        let mut features = FeatureMap::zeroed();
        features.set_flag("is_structuring", true);
        features.set("amount_income_ratio", 12.0);
        InvestigationReport {
            case_id: "case-7".into(),
            user_id: "u-7".into(),
            decision,
            confidence: 0.62,
            combined_score: 0.58,
            ml_score: 0.55,
            ring_score: Some(0.4),
            anomaly_score: Some(0.3),
            llm_confidence: None,
            top_risk_factors: vec!["structuring_pattern".into()],
            anomaly_tags: vec!["structuring".into()],
            connected_users: vec!["peer-1".into()],
            fraud_ring_id: None,
            layers_executed: vec![
                LayerKind::RuleBased,
                LayerKind::MlModels,
                LayerKind::GraphAnalysis,
                LayerKind::PatternDetection,
            ],
            layers_skipped: vec![LayerKind::LlmReasoning],
            annotations: Vec::new(),
            reasoning: "Fused score 0.58".into(),
            recommendation: "Queue for manual investigation.".into(),
            features,
            feature_count: crate::features::FEATURE_KEYS.len(),
            processing_ms: 42,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn human_review_maps_to_under_investigation() {
        let payload = build_payload(&report(Decision::HumanReview));
        assert_eq!(payload.status, "under_investigation");
        assert_eq!(payload.triggered_by, "AI_INVESTIGATION");
    }

    #[test]
    fn payload_serializes_with_camel_case_keys() {
        let payload = build_payload(&report(Decision::AutoBlocked));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["caseId"], "case-7");
        assert_eq!(json["status"], "auto_blocked");
        assert_eq!(json["detectionSignals"]["modelVersion"], MODEL_VERSION);
        assert_eq!(json["behavioralFlags"]["structuring"], true);
        assert_eq!(json["processingTimeMs"], 42);
        assert_eq!(json["investigationLayers"][0], "rule_based");
        // absent ring id is omitted entirely
        assert!(json.get("fraudRingId").is_none());
    }

    #[test]
    fn skipped_layers_serialize_null_signals() {
        let mut r = report(Decision::AutoApproved);
        r.ring_score = None;
        r.anomaly_score = None;
        r.layers_executed = vec![LayerKind::RuleBased, LayerKind::MlModels];
        r.layers_skipped = vec![
            LayerKind::GraphAnalysis,
            LayerKind::PatternDetection,
            LayerKind::LlmReasoning,
        ];
        let json = serde_json::to_value(build_payload(&r)).unwrap();
        assert!(json["aiSignals"]["graphAnalysis"].is_null());
        assert!(json["aiSignals"]["patternDetection"].is_null());
        assert!(json["aiSignals"]["llmReasoning"].is_null());
        assert!(!json["aiSignals"]["mlModels"].is_null());
    }

    #[test]
    fn degraded_annotation_sets_layer_unavailable() {
        let mut r = report(Decision::HumanReview);
        r.annotations.push("degraded_inputs".into());
        let payload = build_payload(&r);
        assert!(payload.ai_signals.layer_unavailable);

        let clean = build_payload(&report(Decision::HumanReview));
        assert!(!clean.ai_signals.layer_unavailable);
    }

    #[test]
    fn confidence_and_probability_stay_in_unit_range() {
        let payload = build_payload(&report(Decision::AutoBlocked));
        assert!((0.0..=1.0).contains(&payload.confidence_score));
        assert!((0.0..=1.0).contains(&payload.fraud_probability));
    }

    #[tokio::test]
    async fn unreachable_sink_reports_sink_unavailable() {
        let publisher = VerdictPublisher::new("http://127.0.0.1:9/cases");
        let payload = build_payload(&report(Decision::AutoBlocked));
        let err = publisher.publish(&payload).await.unwrap_err();
        assert_eq!(err.kind(), "sink_unavailable");
    }
}
