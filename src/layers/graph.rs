// src/layers/graph.rs
//
// Layer 3 — fraud-ring probability from shared-device/IP connectivity and
// coordinated timing. Connectivity comes from the relational store; the
// scoring itself is pure arithmetic over the query results.

use std::sync::Arc;

use crate::error::EngineError;
use crate::events::{RiskLevel, Transaction};
use crate::history::{ConnectedUser, CoordinatedTiming, HistoryReader};

/// Cap on how many connected users join the timing probe (caller + 10).
const TIMING_PROBE_LIMIT: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct RingAnalysis {
    pub ring_score:      f64,
    pub connected_users: Vec<String>,
    pub coordinated:     bool,
}

pub struct GraphAnalyzer {
    history: Arc<dyn HistoryReader>,
}

impl GraphAnalyzer {
    pub fn new(history: Arc<dyn HistoryReader>) -> Self {
        Self { history }
    }

    pub async fn analyze(&self, tx: &Transaction) -> Result<RingAnalysis, EngineError> {
        let connected = self
            .history
            .connected_users(&tx.user_id, &tx.device_id, &tx.ip_address)
            .await?;

        let timing = if connected.len() >= 2 {
            let mut probe: Vec<String> = Vec::with_capacity(TIMING_PROBE_LIMIT + 1);
            probe.push(tx.user_id.clone());
            probe.extend(connected.iter().take(TIMING_PROBE_LIMIT).map(|c| c.user_id.clone()));
            Some(self.history.coordinated_timing(&probe).await?)
        } else {
            None
        };

        let ring_score = ring_score(&connected, timing.as_ref());
        Ok(RingAnalysis {
            ring_score,
            connected_users: connected.into_iter().map(|c| c.user_id).collect(),
            coordinated: timing.map(|t| t.is_coordinated).unwrap_or(false),
        })
    }
}

/// Additive ring score, clipped to 1.0:
///   connectivity   +0.5 (≥5) / +0.3 (≥3) / +0.1 (≥1)
///   high-risk ties +0.4 (≥2) / +0.2 (≥1)
///   coordination   +0.3
pub fn ring_score(connected: &[ConnectedUser], timing: Option<&CoordinatedTiming>) -> f64 {
    let mut score: f64 = 0.0;

    score += match connected.len() {
        0 => 0.0,
        1..=2 => 0.1,
        3..=4 => 0.3,
        _ => 0.5,
    };

    let high_risk = connected.iter().filter(|c| c.risk_level == RiskLevel::High).count();
    score += match high_risk {
        0 => 0.0,
        1 => 0.2,
        _ => 0.4,
    };

    if timing.map(|t| t.is_coordinated).unwrap_or(false) {
        score += 0.3;
    }

    score.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::testing::StubHistory;
    use rust_decimal::Decimal;

    fn connected(n: usize, high_risk: usize) -> Vec<ConnectedUser> {
        (0..n)
            .map(|i| ConnectedUser {
                user_id:    format!("u-{i}"),
                strength:   (n - i) as i64,
                risk_level: if i < high_risk { RiskLevel::High } else { RiskLevel::Low },
            })
            .collect()
    }

    fn tx() -> Transaction {
        let mut tx: Transaction = serde_json::from_str(
            r#"{
                "transaction_id": "tx-1",
                "user_id": "caller",
                "timestamp": "2026-03-01T12:00:00Z",
                "amount": "100",
                "transaction_type": "deposit"
            }"#,
        )
        .unwrap();
        tx.amount = Decimal::from(100);
        tx
    }

    #[test]
    fn empty_graph_scores_zero() {
        assert_eq!(ring_score(&[], None), 0.0);
    }

    #[test]
    fn connectivity_tiers() {
        assert_eq!(ring_score(&connected(1, 0), None), 0.1);
        assert_eq!(ring_score(&connected(3, 0), None), 0.3);
        assert_eq!(ring_score(&connected(5, 0), None), 0.5);
    }

    #[test]
    fn high_risk_ties_add() {
        assert!((ring_score(&connected(3, 1), None) - 0.5).abs() < 1e-9);
        assert!((ring_score(&connected(3, 2), None) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn full_ring_clips_at_one() {
        // 6 connections, 2 high risk, coordinated: 0.5 + 0.4 + 0.3 → clipped.
        let timing = CoordinatedTiming { is_coordinated: true, coordinated_windows: 4, ring_size: 7 };
        let score = ring_score(&connected(6, 2), Some(&timing));
        assert_eq!(score, 1.0);
    }

    #[test]
    fn ring_scenario_scores_at_least_0_9() {
        // Shared device with 6 users, 2 HIGH, coordinated timing.
        let timing = CoordinatedTiming { is_coordinated: true, coordinated_windows: 2, ring_size: 7 };
        assert!(ring_score(&connected(6, 2), Some(&timing)) >= 0.9);
    }

    #[tokio::test]
    async fn timing_probe_skipped_below_two_connections() {
        let stub = StubHistory {
            connected: connected(1, 0),
            timing: CoordinatedTiming { is_coordinated: true, coordinated_windows: 9, ring_size: 2 },
            ..Default::default()
        };
        let analyzer = GraphAnalyzer::new(Arc::new(stub));
        let out = analyzer.analyze(&tx()).await.unwrap();
        // coordination never queried, so it cannot contribute
        assert!(!out.coordinated);
        assert!((out.ring_score - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn analyze_propagates_storage_errors() {
        let stub = StubHistory { connected: connected(4, 1), ..Default::default() };
        stub.fail("connected_users");
        let analyzer = GraphAnalyzer::new(Arc::new(stub));
        assert!(analyzer.analyze(&tx()).await.is_err());
    }

    #[tokio::test]
    async fn analyze_reports_member_ids() {
        let stub = StubHistory { connected: connected(4, 0), ..Default::default() };
        let analyzer = GraphAnalyzer::new(Arc::new(stub));
        let out = analyzer.analyze(&tx()).await.unwrap();
        assert_eq!(out.connected_users.len(), 4);
        assert_eq!(out.connected_users[0], "u-0");
    }
}
