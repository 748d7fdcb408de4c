// src/engine/orchestrator.rs
//
// The investigation cascade. Cheap layers run first and short-circuit the
// obvious cases; only the gray area pays for graph and anomaly analysis, and
// only the truly borderline slice pays for the LLM.
//
// The cascade never aborts: every layer failure has a neutral substitute and
// every path ends in exactly one report. Uncertainty always degrades toward
// human review, never toward an automatic decision.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{HUMAN_MAX, HUMAN_MIN};
use crate::events::{Decision, InvestigationReport, LayerKind, ProcessedCase, Transaction};
use crate::features::FeatureMap;
use crate::history::HistoryReader;
use crate::layers::anomaly::AnomalyDetector;
use crate::layers::ensemble::GradientEnsemble;
use crate::layers::extract::FeatureExtractor;
use crate::layers::graph::{GraphAnalyzer, RingAnalysis};
use crate::layers::reasoner::{build_context, Reasoner};
use crate::engine::patterns::PatternDiscovery;

/// Soft per-case latency budget; overruns are logged, not enforced.
const SOFT_BUDGET_MS: u64 = 100;

/// Score fusion weights across L2/L3/L4.
const W_ML: f64 = 0.4;
const W_RING: f64 = 0.3;
const W_ANOMALY: f64 = 0.3;

pub struct Orchestrator {
    history:   Arc<dyn HistoryReader>,
    extractor: FeatureExtractor,
    ensemble:  Arc<GradientEnsemble>,
    graph:     GraphAnalyzer,
    anomaly:   Arc<AnomalyDetector>,
    reasoner:  Arc<Reasoner>,
    discovery: Arc<PatternDiscovery>,
    gray_min:  f64,
    gray_max:  f64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        history: Arc<dyn HistoryReader>,
        ensemble: Arc<GradientEnsemble>,
        anomaly: Arc<AnomalyDetector>,
        reasoner: Arc<Reasoner>,
        discovery: Arc<PatternDiscovery>,
        gray_min: f64,
        gray_max: f64,
    ) -> Self {
        Self {
            extractor: FeatureExtractor::new(Arc::clone(&history)),
            graph: GraphAnalyzer::new(Arc::clone(&history)),
            history,
            ensemble,
            anomaly,
            reasoner,
            discovery,
            gray_min,
            gray_max,
        }
    }

    /// Run the full cascade for one transaction. Infallible by design — the
    /// worst inputs produce a human-review report, never an error.
    pub async fn investigate(&self, tx: &Transaction) -> InvestigationReport {
        let started = Instant::now();

        // L1 — features
        let extraction = self.extractor.extract(tx).await;
        let features = extraction.features;

        // L2 — rule ensemble
        let (ml_score, top_risk_factors) = self.ensemble.score(&features);
        debug!(
            case = %tx.transaction_id,
            ml = format!("{ml_score:.4}"),
            rules = ?self.ensemble.fired_rules(&features),
            "ensemble scored"
        );

        let mut report = if extraction.degraded {
            // History reads failed: inputs are zero-filled noise, so neither
            // gate nor the deep layers can be trusted. Force human review.
            self.degraded_report(tx, features, ml_score, top_risk_factors, &extraction.failed_queries)
        } else if ml_score > self.gray_max {
            self.short_circuit(tx, features, ml_score, top_risk_factors, Decision::AutoBlocked)
        } else if ml_score < self.gray_min {
            self.short_circuit(tx, features, ml_score, top_risk_factors, Decision::AutoApproved)
        } else {
            self.deep_investigation(tx, features, ml_score, top_risk_factors).await
        };
        report.processing_ms = started.elapsed().as_millis() as u64;
        if report.processing_ms > SOFT_BUDGET_MS {
            warn!(case = %report.case_id, ms = report.processing_ms, "soft latency budget exceeded");
        }

        // Record the case for discovery; terminal decisions also feed the
        // ensemble's online-learning buffer.
        let processed = ProcessedCase::from(&report);
        if matches!(report.decision, Decision::AutoBlocked | Decision::AutoApproved) {
            self.ensemble.record_verified(processed.clone());
        }
        self.discovery.record(processed);

        report
    }

    /// Fallback report for a case that blew the hard investigation ceiling.
    pub fn timeout_report(&self, tx: &Transaction) -> InvestigationReport {
        InvestigationReport {
            case_id: tx.transaction_id.clone(),
            user_id: tx.user_id.clone(),
            decision: Decision::HumanReview,
            confidence: 0.5,
            combined_score: 0.0,
            ml_score: 0.0,
            ring_score: None,
            anomaly_score: None,
            llm_confidence: None,
            top_risk_factors: Vec::new(),
            anomaly_tags: Vec::new(),
            connected_users: Vec::new(),
            fraud_ring_id: None,
            layers_executed: Vec::new(),
            layers_skipped: all_layers(),
            annotations: vec!["investigation_timeout".to_string()],
            reasoning: "Investigation exceeded the hard time ceiling".to_string(),
            recommendation: recommendation_for(Decision::HumanReview).to_string(),
            features: FeatureMap::zeroed(),
            feature_count: 0,
            processing_ms: 0,
            timestamp: Utc::now(),
        }
    }

    fn degraded_report(
        &self,
        tx: &Transaction,
        features: FeatureMap,
        ml_score: f64,
        top_risk_factors: Vec<String>,
        failed_queries: &[&'static str],
    ) -> InvestigationReport {
        let mut annotations = vec!["degraded_inputs".to_string()];
        annotations.extend(failed_queries.iter().map(|q| format!("storage_failed:{q}")));
        InvestigationReport {
            case_id: tx.transaction_id.clone(),
            user_id: tx.user_id.clone(),
            decision: Decision::HumanReview,
            confidence: 0.5,
            combined_score: ml_score,
            ml_score,
            ring_score: None,
            anomaly_score: None,
            llm_confidence: None,
            top_risk_factors,
            anomaly_tags: Vec::new(),
            connected_users: Vec::new(),
            fraud_ring_id: None,
            layers_executed: vec![LayerKind::RuleBased, LayerKind::MlModels],
            layers_skipped: vec![
                LayerKind::GraphAnalysis,
                LayerKind::PatternDetection,
                LayerKind::LlmReasoning,
            ],
            annotations,
            reasoning: "Historical context unavailable; automatic decision withheld".to_string(),
            recommendation: recommendation_for(Decision::HumanReview).to_string(),
            feature_count: features.len(),
            features,
            processing_ms: 0,
            timestamp: Utc::now(),
        }
    }

    fn short_circuit(
        &self,
        tx: &Transaction,
        features: FeatureMap,
        ml_score: f64,
        top_risk_factors: Vec<String>,
        decision: Decision,
    ) -> InvestigationReport {
        InvestigationReport {
            case_id: tx.transaction_id.clone(),
            user_id: tx.user_id.clone(),
            decision,
            confidence: ml_score,
            combined_score: ml_score,
            ml_score,
            ring_score: None,
            anomaly_score: None,
            llm_confidence: None,
            reasoning: format!(
                "Rule ensemble {:.2} outside the gray area: {}",
                ml_score,
                summarize(&top_risk_factors)
            ),
            recommendation: recommendation_for(decision).to_string(),
            top_risk_factors,
            anomaly_tags: Vec::new(),
            connected_users: Vec::new(),
            fraud_ring_id: None,
            layers_executed: vec![LayerKind::RuleBased, LayerKind::MlModels],
            layers_skipped: vec![
                LayerKind::GraphAnalysis,
                LayerKind::PatternDetection,
                LayerKind::LlmReasoning,
            ],
            annotations: Vec::new(),
            feature_count: features.len(),
            features,
            processing_ms: 0,
            timestamp: Utc::now(),
        }
    }

    async fn deep_investigation(
        &self,
        tx: &Transaction,
        features: FeatureMap,
        ml_score: f64,
        top_risk_factors: Vec<String>,
    ) -> InvestigationReport {
        let mut annotations: Vec<String> = Vec::new();

        // L3 ∥ L4
        let (ring, anomaly) = tokio::join!(self.graph.analyze(tx), async {
            self.anomaly.observe(&tx.user_id, &features)
        });

        let ring = match ring {
            Ok(r) => r,
            Err(e) => {
                warn!(case = %tx.transaction_id, error = %e, "graph layer degraded");
                annotations.push("layer_unavailable".to_string());
                RingAnalysis::default()
            }
        };

        let combined =
            W_ML * ml_score + W_RING * ring.ring_score + W_ANOMALY * anomaly.anomaly_score;

        let mut layers_executed = vec![
            LayerKind::RuleBased,
            LayerKind::MlModels,
            LayerKind::GraphAnalysis,
            LayerKind::PatternDetection,
        ];
        let mut layers_skipped = vec![LayerKind::LlmReasoning];
        let mut llm_confidence = None;

        let (decision, confidence, reasoning) = if (HUMAN_MIN..=HUMAN_MAX).contains(&combined) {
            // Borderline — the reasoner has the final word. Confirmed
            // patterns already tied to this user join the context; a failed
            // lookup just means less context, not a failed case.
            let similar = self.history.similar_patterns(&tx.user_id).await.unwrap_or_default();
            let context = build_context(
                tx,
                &features,
                ml_score,
                ring.ring_score,
                anomaly.anomaly_score,
                &similar,
            );
            let verdict = self.reasoner.assess(&context).await;
            layers_executed.push(LayerKind::LlmReasoning);
            layers_skipped.clear();
            llm_confidence = Some(verdict.confidence);
            (verdict.recommendation, verdict.confidence, verdict.reasoning)
        } else if combined >= self.gray_max {
            (Decision::AutoBlocked, combined, fused_reasoning(combined, &top_risk_factors, &anomaly.tags))
        } else if combined <= self.gray_min {
            (Decision::AutoApproved, combined, fused_reasoning(combined, &top_risk_factors, &anomaly.tags))
        } else {
            (Decision::HumanReview, combined, fused_reasoning(combined, &top_risk_factors, &anomaly.tags))
        };

        let fraud_ring_id = if ring.connected_users.len() >= 3 || ring.coordinated {
            Some(ring_id(&tx.user_id, &ring.connected_users))
        } else {
            None
        };

        InvestigationReport {
            case_id: tx.transaction_id.clone(),
            user_id: tx.user_id.clone(),
            decision,
            confidence,
            combined_score: combined,
            ml_score,
            ring_score: Some(ring.ring_score),
            anomaly_score: Some(anomaly.anomaly_score),
            llm_confidence,
            top_risk_factors,
            anomaly_tags: anomaly.tags,
            connected_users: ring.connected_users,
            fraud_ring_id,
            layers_executed,
            layers_skipped,
            annotations,
            reasoning,
            recommendation: recommendation_for(decision).to_string(),
            feature_count: features.len(),
            features,
            processing_ms: 0,
            timestamp: Utc::now(),
        }
    }
}

fn all_layers() -> Vec<LayerKind> {
    vec![
        LayerKind::RuleBased,
        LayerKind::MlModels,
        LayerKind::GraphAnalysis,
        LayerKind::PatternDetection,
        LayerKind::LlmReasoning,
    ]
}

fn recommendation_for(decision: Decision) -> &'static str {
    match decision {
        Decision::AutoApproved => "No action required; continue monitoring.",
        Decision::AutoBlocked  => "Block the transaction and suspend the account pending review.",
        Decision::HumanReview  => "Queue for manual investigation.",
    }
}

fn summarize(factors: &[String]) -> String {
    if factors.is_empty() {
        "no elevated risk factors".to_string()
    } else {
        factors.join(", ")
    }
}

fn fused_reasoning(combined: f64, factors: &[String], tags: &[String]) -> String {
    let mut parts = vec![format!("Fused score {combined:.2}")];
    if !factors.is_empty() {
        parts.push(format!("risk factors: {}", factors.join(", ")));
    }
    if !tags.is_empty() {
        parts.push(format!("anomalies: {}", tags.join(", ")));
    }
    parts.join("; ")
}

/// Deterministic ring identifier over the sorted member set.
fn ring_id(user_id: &str, connected: &[String]) -> String {
    let mut members: Vec<&str> = connected.iter().map(String::as_str).collect();
    members.push(user_id);
    members.sort_unstable();
    members.dedup();
    let mut hasher = Sha256::new();
    for member in members {
        hasher.update(member.as_bytes());
        hasher.update(b"|");
    }
    format!("ring-{}", hex::encode(&hasher.finalize()[..6]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GRAY_MAX_DEFAULT, GRAY_MIN_DEFAULT, LlmConfig};
    use crate::events::RiskLevel;
    use crate::history::testing::StubHistory;
    use crate::history::{ConnectedUser, CoordinatedTiming, StructuringCheck, VelocityMetrics};
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn orchestrator(stub: StubHistory) -> Orchestrator {
        Orchestrator::new(
            Arc::new(stub),
            Arc::new(GradientEnsemble::new()),
            Arc::new(AnomalyDetector::new()),
            Arc::new(Reasoner::new(LlmConfig {
                // unroutable port: the reasoner fails fast into its fallback
                url:     "http://127.0.0.1:9/".to_string(),
                api_key: String::new(),
                model:   "test".to_string(),
            })),
            Arc::new(PatternDiscovery::new()),
            GRAY_MIN_DEFAULT,
            GRAY_MAX_DEFAULT,
        )
    }

    fn base_tx() -> Transaction {
        let mut tx: Transaction = serde_json::from_str(
            r#"{
                "transaction_id": "tx-1",
                "user_id": "u-1",
                "timestamp": "2026-03-02T12:30:00Z",
                "amount": "0",
                "transaction_type": "deposit"
            }"#,
        )
        .unwrap();
        tx.user.kyc_status = "verified".to_string();
        tx
    }

    /// S1 — trivially clean deposit short-circuits to approval.
    #[tokio::test]
    async fn trivial_approve_skips_deep_layers() {
        let mut tx = base_tx();
        tx.amount = Decimal::from(50);
        tx.user.declared_monthly_income = 5000.0;
        tx.user.account_created_at = Some(Utc::now() - Duration::days(400));
        tx.document.score = 0.95;

        let orch = orchestrator(StubHistory::default());
        let report = orch.investigate(&tx).await;

        assert_eq!(report.decision, Decision::AutoApproved);
        assert_eq!(report.confidence, report.ml_score);
        assert!(report.ml_score < 0.20);
        assert_eq!(
            report.layers_executed,
            vec![LayerKind::RuleBased, LayerKind::MlModels]
        );
        assert!(report.layers_skipped.contains(&LayerKind::LlmReasoning));
        assert!(report.ring_score.is_none());
    }

    /// S2 — sanctioned tor exit on a brand-new account short-circuits to block.
    #[tokio::test]
    async fn trivial_block_skips_deep_layers() {
        let mut tx = base_tx();
        tx.amount = Decimal::from(200_000);
        tx.user.declared_monthly_income = 1000.0;
        tx.user.account_created_at = Some(Utc::now() - Duration::minutes(30));
        tx.ip.is_sanctioned_country = true;
        tx.ip.is_tor = true;
        tx.document.score = 0.9;

        let orch = orchestrator(StubHistory::default());
        let report = orch.investigate(&tx).await;

        assert_eq!(report.decision, Decision::AutoBlocked);
        assert!(report.ml_score > 0.80);
        assert_eq!(report.confidence, report.ml_score);
        assert!(!report.layer_executed(LayerKind::GraphAnalysis));
        assert!(report.top_risk_factors.contains(&"sanctioned_country".to_string()));
    }

    /// S3 — structuring: three prior band deposits plus a 9950 current.
    #[tokio::test]
    async fn structuring_case_scores_hot() {
        let mut tx = base_tx();
        tx.amount = Decimal::from(9950);
        tx.user.declared_monthly_income = 800.0;
        tx.user.account_created_at = Some(Utc::now() - Duration::days(30));
        tx.document.score = 0.9;

        let stub = StubHistory {
            structuring: StructuringCheck {
                is_structuring: true,
                similar_48h: 3,
                total_amount_48h: 29_400.0,
            },
            velocity: VelocityMetrics {
                avg_amount_30d: 200.0,
                stddev_amount_30d: 80.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let orch = orchestrator(stub);
        let report = orch.investigate(&tx).await;

        // structuring (0.90) + income ratio (0.70) + zscore (0.80) push the
        // ensemble over the block gate on its own
        assert_eq!(report.decision, Decision::AutoBlocked);
        assert!(report.features.flag("is_structuring"));
        assert!(report.top_risk_factors.contains(&"structuring_pattern".to_string()));
    }

    /// S4 — fraud ring: gray ensemble, hot graph.
    #[tokio::test]
    async fn ring_case_blocks_on_combined_score() {
        let mut tx = base_tx();
        tx.amount = Decimal::from(4000);
        tx.user.declared_monthly_income = 500.0; // ratio 8 → amount group 0.5
        tx.user.account_created_at = Some(Utc::now() - Duration::days(200));
        tx.document.score = 0.9;

        let connected: Vec<ConnectedUser> = (0..6)
            .map(|i| ConnectedUser {
                user_id:    format!("peer-{i}"),
                strength:   6 - i as i64,
                risk_level: if i < 2 { RiskLevel::High } else { RiskLevel::Low },
            })
            .collect();
        let stub = StubHistory {
            connected,
            timing: CoordinatedTiming { is_coordinated: true, coordinated_windows: 3, ring_size: 7 },
            ..Default::default()
        };
        let orch = orchestrator(stub);
        let report = orch.investigate(&tx).await;

        let ring = report.ring_score.unwrap();
        assert!(ring >= 0.9, "ring score {ring} below expectation");
        // ml = 0.5 (amount group only) → combined = 0.4·0.5 + 0.3·1.0 = 0.50,
        // inside the human band → reasoner fallback review
        assert!(report.layer_executed(LayerKind::GraphAnalysis));
        assert!(report.layer_executed(LayerKind::LlmReasoning));
        assert_eq!(report.decision, Decision::HumanReview);
        assert!(report.fraud_ring_id.is_some());
        assert_eq!(report.connected_users.len(), 6);
    }

    /// S5-shaped gray case: the ensemble stays inside the gray area, deep
    /// layers run, but combined stays below the human band → plain review
    /// without the reasoner.
    #[tokio::test]
    async fn gray_case_below_band_reviews_without_reasoner() {
        let mut tx = base_tx();
        tx.amount = Decimal::from(9000);
        tx.user.declared_monthly_income = 1200.0; // ratio 7.5 → amount 0.50
        tx.user.account_created_at = Some(Utc::now() - Duration::days(20));
        tx.document.score = 0.3; // doc_risk 0.7 → identity 0.65

        let orch = orchestrator(StubHistory::default());
        let report = orch.investigate(&tx).await;

        // ml = (0.25·0.50 + 0.15·0.65)/0.40 = 0.55625 → gray
        assert!((report.ml_score - 0.55625).abs() < 1e-9);
        assert!(report.layer_executed(LayerKind::GraphAnalysis));
        assert!(report.layer_executed(LayerKind::PatternDetection));
        // combined = 0.4·0.55625 = 0.2225 → below HUMAN_MIN, no L5
        assert!((report.combined_score - 0.2225).abs() < 1e-9);
        assert!(!report.layer_executed(LayerKind::LlmReasoning));
        assert_eq!(report.decision, Decision::HumanReview);
        assert_eq!(report.confidence, report.combined_score);
    }

    /// L5 runs iff combined ∈ [0.40, 0.60]; with the endpoint down the
    /// defensive fallback takes the verdict to human review at 0.5.
    #[tokio::test]
    async fn human_band_consults_reasoner() {
        let mut tx = base_tx();
        tx.amount = Decimal::from(9000);
        tx.user.declared_monthly_income = 1200.0; // ratio 7.5 → amount 0.50
        tx.user.account_created_at = Some(Utc::now() - Duration::days(20));
        tx.ip.is_tor = true; // network 0.85 (geo needs high-risk too)
        tx.document.score = 0.3; // identity 0.65

        // 3 peers, 2 high-risk, no coordination → ring 0.3 + 0.4 = 0.7
        let connected: Vec<ConnectedUser> = (0..3)
            .map(|i| ConnectedUser {
                user_id:    format!("peer-{i}"),
                strength:   3 - i as i64,
                risk_level: if i < 2 { RiskLevel::High } else { RiskLevel::Low },
            })
            .collect();
        let orch = orchestrator(StubHistory { connected, ..Default::default() });
        let report = orch.investigate(&tx).await;

        // ml = (0.25·0.50 + 0.20·0.85 + 0.15·0.65)/0.60 = 0.6541666…
        // combined = 0.4·ml + 0.3·0.7 = 0.4716666… → inside the band
        assert!((HUMAN_MIN..=HUMAN_MAX).contains(&report.combined_score));
        assert!(report.layer_executed(LayerKind::LlmReasoning));
        assert!(report.layers_skipped.is_empty());
        // unreachable endpoint → deterministic fallback
        assert_eq!(report.decision, Decision::HumanReview);
        assert_eq!(report.confidence, 0.5);
        assert_eq!(report.reasoning, "LLM analysis failed");
        assert_eq!(report.llm_confidence, Some(0.5));
    }

    /// S6 — storage outage forces human review at confidence 0.5.
    #[tokio::test]
    async fn storage_outage_forces_human_review() {
        let mut tx = base_tx();
        tx.amount = Decimal::from(50);
        tx.user.declared_monthly_income = 5000.0;
        tx.user.account_created_at = Some(Utc::now() - Duration::days(400));
        tx.document.score = 0.95;

        let stub = StubHistory::default();
        stub.fail("velocity");
        stub.fail("device_history");
        let orch = orchestrator(stub);
        let report = orch.investigate(&tx).await;

        assert_eq!(report.decision, Decision::HumanReview);
        assert_eq!(report.confidence, 0.5);
        assert!(report.annotations.contains(&"degraded_inputs".to_string()));
        assert!(report.annotations.iter().any(|a| a == "storage_failed:velocity"));
        assert!(!report.layer_executed(LayerKind::GraphAnalysis));
    }

    /// Graph-layer storage failure degrades to ring 0 with an annotation.
    #[tokio::test]
    async fn graph_failure_degrades_not_aborts() {
        let mut tx = base_tx();
        tx.amount = Decimal::from(9000);
        tx.user.declared_monthly_income = 1200.0;
        tx.user.account_created_at = Some(Utc::now() - Duration::days(20));
        tx.document.score = 0.3;

        let stub = StubHistory::default();
        stub.fail("connected_users");
        let orch = orchestrator(stub);
        let report = orch.investigate(&tx).await;

        assert_eq!(report.ring_score, Some(0.0));
        assert!(report.annotations.contains(&"layer_unavailable".to_string()));
        // still exactly one verdict
        assert!(matches!(
            report.decision,
            Decision::AutoApproved | Decision::AutoBlocked | Decision::HumanReview
        ));
    }

    #[tokio::test]
    async fn every_report_is_recorded_for_discovery() {
        let discovery = Arc::new(PatternDiscovery::new());
        let orch = Orchestrator::new(
            Arc::new(StubHistory::default()),
            Arc::new(GradientEnsemble::new()),
            Arc::new(AnomalyDetector::new()),
            Arc::new(Reasoner::new(LlmConfig {
                url: "http://127.0.0.1:9/".into(),
                api_key: String::new(),
                model: "test".into(),
            })),
            Arc::clone(&discovery),
            GRAY_MIN_DEFAULT,
            GRAY_MAX_DEFAULT,
        );

        let mut tx = base_tx();
        tx.amount = Decimal::from(50);
        tx.user.declared_monthly_income = 5000.0;
        tx.user.account_created_at = Some(Utc::now() - Duration::days(400));
        tx.document.score = 0.95;
        orch.investigate(&tx).await;
        assert_eq!(discovery.ring_len(), 1);
    }

    #[test]
    fn ring_id_is_deterministic_and_order_free() {
        let a = ring_id("u", &["b".into(), "a".into()]);
        let b = ring_id("u", &["a".into(), "b".into()]);
        assert_eq!(a, b);
        assert!(a.starts_with("ring-"));
        assert_ne!(a, ring_id("u", &["a".into(), "c".into()]));
    }
}
