// src/history/mod.rs
//
// Read-only historical queries against the relational store. Each operation
// is one pooled query (two for connected_users) with a hard 50 ms deadline —
// a slow datastore must degrade a case, never stall the worker pool.
//
// The engine talks to `dyn HistoryReader`, constructed once at startup and
// shared by reference. `PgHistoryStore` is the production implementation;
// tests inject an in-memory stub. Decision logic that does not need SQL
// (escalation, structuring, coordinated buckets) lives in pure functions
// below the trait so it can be exercised without a database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use serde::{Deserialize, Serialize};
use tokio_postgres::NoTls;
use tracing::debug;

use crate::error::EngineError;
use crate::events::RiskLevel;

/// Per-query deadline. Queries racing this lose as `storage_timeout`.
pub const QUERY_DEADLINE: Duration = Duration::from_millis(50);

/// Pool bounds — min kept warm by recycling, max caps datastore pressure.
pub const POOL_MIN: usize = 5;
pub const POOL_MAX: usize = 20;

const STRUCTURING_LOW:  f64 = 9_500.0;
const STRUCTURING_HIGH: f64 = 9_999.0;
const STRUCTURING_MIN_SIMILAR: i64 = 3;

// ── Query results ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VelocityMetrics {
    pub txn_last_24h:         i64,
    pub deposits_last_24h:    i64,
    pub withdrawals_last_24h: i64,
    pub txn_last_7d:          i64,
    pub deposits_last_7d:     i64,
    pub txn_last_30d:         i64,
    pub avg_amount_30d:       f64,
    pub stddev_amount_30d:    f64,
    pub total_txns:           i64,
    pub total_deposits:       f64,
    pub total_withdrawals:    f64,
    pub last_txn_at:          Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceHistory {
    pub unique_users: i64,
    pub unique_ips:   i64,
    pub total_txns:   i64,
    pub flagged_txns: i64,
    pub flag_rate:    f64,
}

#[derive(Debug, Clone, Default)]
pub struct IpHistory {
    pub unique_users:   i64,
    pub unique_devices: i64,
    pub total_txns:     i64,
    pub flagged_txns:   i64,
    pub flag_rate:      f64,
    pub last_seen:      Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct EscalationCheck {
    pub is_escalating:    bool,
    pub escalation_ratio: f64,
    pub count:            usize,
}

#[derive(Debug, Clone, Default)]
pub struct StructuringCheck {
    pub is_structuring:   bool,
    pub similar_48h:      i64,
    pub total_amount_48h: f64,
}

#[derive(Debug, Clone)]
pub struct ConnectedUser {
    pub user_id:    String,
    pub strength:   i64,
    pub risk_level: RiskLevel,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatedTiming {
    pub is_coordinated:      bool,
    pub coordinated_windows: usize,
    pub ring_size:           usize,
}

#[derive(Debug, Clone, Default)]
pub struct FraudHistory {
    pub total_cases:     i64,
    pub confirmed_cases: i64,
    pub has_history:     bool,
    pub last_case_at:    Option<DateTime<Utc>>,
    pub fraud_types:     Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SimilarPattern {
    pub pattern_id:   String,
    pub pattern_type: String,
    pub description:  String,
    pub confidence:   f64,
}

// ── Trait seam ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait HistoryReader: Send + Sync {
    async fn velocity(&self, user_id: &str) -> Result<VelocityMetrics, EngineError>;
    async fn device_history(&self, device_id: &str) -> Result<DeviceHistory, EngineError>;
    async fn ip_history(&self, ip: &str) -> Result<IpHistory, EngineError>;
    async fn detect_escalation(&self, user_id: &str, current_amount: f64)
        -> Result<EscalationCheck, EngineError>;
    async fn detect_structuring(&self, user_id: &str, current_amount: f64)
        -> Result<StructuringCheck, EngineError>;
    async fn connected_users(&self, user_id: &str, device_id: &str, ip: &str)
        -> Result<Vec<ConnectedUser>, EngineError>;
    async fn coordinated_timing(&self, user_ids: &[String])
        -> Result<CoordinatedTiming, EngineError>;
    async fn user_fraud_history(&self, user_id: &str) -> Result<FraudHistory, EngineError>;
    async fn similar_patterns(&self, user_id: &str) -> Result<Vec<SimilarPattern>, EngineError>;
}

// ── Pure decision cores ───────────────────────────────────────────────────────

/// Escalation over the last-7d amounts (chronological) plus the current one.
/// Escalating iff every step grows by at least ~25% (a[i] < a[i+1] * 0.8).
pub fn escalation_from_amounts(prior: &[f64], current_amount: f64) -> EscalationCheck {
    if prior.len() < 2 {
        return EscalationCheck { is_escalating: false, escalation_ratio: 0.0, count: prior.len() + 1 };
    }
    let mut seq: Vec<f64> = prior.to_vec();
    seq.push(current_amount);
    let is_escalating = seq.windows(2).all(|w| w[0] < w[1] * 0.8);
    let escalation_ratio = if seq[0] > 0.0 { current_amount / seq[0] } else { 0.0 };
    EscalationCheck { is_escalating, escalation_ratio, count: seq.len() }
}

/// Structuring: ≥3 deposits just under the reporting threshold in 48 h, and
/// the current amount sits in the same band.
pub fn structuring_from_counts(similar_48h: i64, total_amount_48h: f64, current_amount: f64) -> StructuringCheck {
    let in_band = (STRUCTURING_LOW..=STRUCTURING_HIGH).contains(&current_amount);
    StructuringCheck {
        is_structuring: similar_48h >= STRUCTURING_MIN_SIMILAR && in_band,
        similar_48h,
        total_amount_48h,
    }
}

/// Coordination over hourly buckets: a bucket counts when it holds at least
/// min(3, ring_size) distinct users.
pub fn coordination_from_buckets(bucket_user_counts: &[i64], ring_size: usize) -> CoordinatedTiming {
    let needed = (ring_size as i64).min(3);
    let coordinated_windows = bucket_user_counts.iter().filter(|&&c| c >= needed).count();
    CoordinatedTiming {
        is_coordinated: coordinated_windows > 0,
        coordinated_windows,
        ring_size,
    }
}

fn flag_rate(flagged: i64, total: i64) -> f64 {
    flagged as f64 / total.max(1) as f64
}

fn parse_risk_level(s: &str) -> RiskLevel {
    match s.to_ascii_lowercase().as_str() {
        "high"   => RiskLevel::High,
        "medium" => RiskLevel::Medium,
        _        => RiskLevel::Low,
    }
}

// ── Postgres implementation ───────────────────────────────────────────────────

pub struct PgHistoryStore {
    pool: Pool,
}

impl PgHistoryStore {
    pub fn connect(database_url: &str) -> Result<Self, EngineError> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e: tokio_postgres::Error| EngineError::StorageUnavailable(e.to_string()))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );
        let pool = Pool::builder(manager)
            .max_size(POOL_MAX)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(QUERY_DEADLINE))
            .build()
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))?;
        debug!(min = POOL_MIN, max = POOL_MAX, "history pool configured");
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, EngineError> {
        Ok(self.pool.get().await?)
    }
}

/// Race a query against the 50 ms deadline.
macro_rules! deadline {
    ($what:expr, $fut:expr) => {
        match tokio::time::timeout(QUERY_DEADLINE, $fut).await {
            Ok(result) => result,
            Err(_) => return Err(EngineError::StorageTimeout($what)),
        }
    };
}

#[async_trait]
impl HistoryReader for PgHistoryStore {
    async fn velocity(&self, user_id: &str) -> Result<VelocityMetrics, EngineError> {
        const SQL: &str = "\
            SELECT \
              count(*) FILTER (WHERE created_at > now() - interval '24 hours'), \
              count(*) FILTER (WHERE created_at > now() - interval '24 hours' \
                                 AND transaction_type = 'deposit'), \
              count(*) FILTER (WHERE created_at > now() - interval '24 hours' \
                                 AND transaction_type = 'withdrawal'), \
              count(*) FILTER (WHERE created_at > now() - interval '7 days'), \
              count(*) FILTER (WHERE created_at > now() - interval '7 days' \
                                 AND transaction_type = 'deposit'), \
              count(*) FILTER (WHERE created_at > now() - interval '30 days'), \
              coalesce(avg(amount::float8) \
                  FILTER (WHERE created_at > now() - interval '30 days'), 0), \
              coalesce(stddev_pop(amount::float8) \
                  FILTER (WHERE created_at > now() - interval '30 days'), 0), \
              count(*), \
              coalesce(sum(amount::float8) FILTER (WHERE transaction_type = 'deposit'), 0), \
              coalesce(sum(amount::float8) FILTER (WHERE transaction_type = 'withdrawal'), 0), \
              max(created_at) \
            FROM transactions WHERE user_id = $1";
        let client = self.client().await?;
        let row = deadline!("velocity", client.query_one(SQL, &[&user_id]))?;
        Ok(VelocityMetrics {
            txn_last_24h:         row.get(0),
            deposits_last_24h:    row.get(1),
            withdrawals_last_24h: row.get(2),
            txn_last_7d:          row.get(3),
            deposits_last_7d:     row.get(4),
            txn_last_30d:         row.get(5),
            avg_amount_30d:       row.get(6),
            stddev_amount_30d:    row.get(7),
            total_txns:           row.get(8),
            total_deposits:       row.get(9),
            total_withdrawals:    row.get(10),
            last_txn_at:          row.get(11),
        })
    }

    async fn device_history(&self, device_id: &str) -> Result<DeviceHistory, EngineError> {
        const SQL: &str = "\
            SELECT count(DISTINCT user_id), count(DISTINCT ip_address), count(*), \
                   count(*) FILTER (WHERE velocity_flag OR amount_anomaly_flag) \
            FROM transactions \
            WHERE device_id = $1 AND created_at > now() - interval '90 days'";
        let client = self.client().await?;
        let row = deadline!("device_history", client.query_one(SQL, &[&device_id]))?;
        let (unique_users, unique_ips, total_txns, flagged_txns) =
            (row.get(0), row.get(1), row.get(2), row.get(3));
        Ok(DeviceHistory {
            unique_users,
            unique_ips,
            total_txns,
            flagged_txns,
            flag_rate: flag_rate(flagged_txns, total_txns),
        })
    }

    async fn ip_history(&self, ip: &str) -> Result<IpHistory, EngineError> {
        const SQL: &str = "\
            SELECT count(DISTINCT user_id), count(DISTINCT device_id), count(*), \
                   count(*) FILTER (WHERE velocity_flag OR amount_anomaly_flag), \
                   max(created_at) \
            FROM transactions \
            WHERE ip_address = $1 AND created_at > now() - interval '90 days'";
        let client = self.client().await?;
        let row = deadline!("ip_history", client.query_one(SQL, &[&ip]))?;
        let (unique_users, unique_devices, total_txns, flagged_txns) =
            (row.get(0), row.get(1), row.get(2), row.get(3));
        Ok(IpHistory {
            unique_users,
            unique_devices,
            total_txns,
            flagged_txns,
            flag_rate: flag_rate(flagged_txns, total_txns),
            last_seen: row.get(4),
        })
    }

    async fn detect_escalation(&self, user_id: &str, current_amount: f64)
        -> Result<EscalationCheck, EngineError>
    {
        const SQL: &str = "\
            SELECT amount::float8 FROM transactions \
            WHERE user_id = $1 AND created_at > now() - interval '7 days' \
            ORDER BY created_at";
        let client = self.client().await?;
        let rows = deadline!("detect_escalation", client.query(SQL, &[&user_id]))?;
        let prior: Vec<f64> = rows.iter().map(|r| r.get::<_, f64>(0)).collect();
        Ok(escalation_from_amounts(&prior, current_amount))
    }

    async fn detect_structuring(&self, user_id: &str, current_amount: f64)
        -> Result<StructuringCheck, EngineError>
    {
        const SQL: &str = "\
            SELECT count(*), coalesce(sum(amount::float8), 0) \
            FROM transactions \
            WHERE user_id = $1 AND transaction_type = 'deposit' \
              AND created_at > now() - interval '48 hours' \
              AND amount::float8 BETWEEN 9500 AND 9999";
        let client = self.client().await?;
        let row = deadline!("detect_structuring", client.query_one(SQL, &[&user_id]))?;
        Ok(structuring_from_counts(row.get(0), row.get(1), current_amount))
    }

    async fn connected_users(&self, user_id: &str, device_id: &str, ip: &str)
        -> Result<Vec<ConnectedUser>, EngineError>
    {
        // Share strength = sum of shared rows across both relations.
        const SQL: &str = "\
            SELECT user_id, sum(cnt)::int8 AS strength FROM ( \
              SELECT user_id, count(*) AS cnt FROM user_devices \
               WHERE device_id = $2 AND user_id <> $1 \
                 AND last_seen_at > now() - interval '90 days' \
               GROUP BY user_id \
              UNION ALL \
              SELECT user_id, count(*) FROM user_ip_history \
               WHERE ip_address = $3 AND user_id <> $1 \
                 AND last_seen_at > now() - interval '90 days' \
               GROUP BY user_id \
            ) shared \
            GROUP BY user_id ORDER BY strength DESC LIMIT 20";
        const RISK_SQL: &str = "SELECT id, risk_level FROM users WHERE id = ANY($1)";

        let client = self.client().await?;
        let rows = deadline!("connected_users", client.query(SQL, &[&user_id, &device_id, &ip]))?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|r| r.get::<_, String>(0)).collect();
        let risk_rows = deadline!("connected_users_risk", client.query(RISK_SQL, &[&ids]))?;
        let risk_by_id: std::collections::HashMap<String, RiskLevel> = risk_rows
            .iter()
            .map(|r| (r.get::<_, String>(0), parse_risk_level(r.get(1))))
            .collect();

        Ok(rows
            .iter()
            .map(|r| {
                let id: String = r.get(0);
                let risk_level = risk_by_id.get(&id).copied().unwrap_or_default();
                ConnectedUser { user_id: id, strength: r.get(1), risk_level }
            })
            .collect())
    }

    async fn coordinated_timing(&self, user_ids: &[String])
        -> Result<CoordinatedTiming, EngineError>
    {
        const SQL: &str = "\
            SELECT count(DISTINCT user_id) \
            FROM transactions \
            WHERE user_id = ANY($1) AND created_at > now() - interval '7 days' \
            GROUP BY date_trunc('hour', created_at)";
        let ids: Vec<String> = user_ids.to_vec();
        let client = self.client().await?;
        let rows = deadline!("coordinated_timing", client.query(SQL, &[&ids]))?;
        let counts: Vec<i64> = rows.iter().map(|r| r.get::<_, i64>(0)).collect();
        Ok(coordination_from_buckets(&counts, user_ids.len()))
    }

    async fn user_fraud_history(&self, user_id: &str) -> Result<FraudHistory, EngineError> {
        const SQL: &str = "\
            SELECT count(*), count(*) FILTER (WHERE confirmed), \
                   max(created_at), \
                   coalesce(array_agg(DISTINCT fraud_type) \
                       FILTER (WHERE fraud_type IS NOT NULL), '{}') \
            FROM historical_fraud_cases WHERE user_id = $1";
        let client = self.client().await?;
        let row = deadline!("user_fraud_history", client.query_one(SQL, &[&user_id]))?;
        let total_cases: i64 = row.get(0);
        Ok(FraudHistory {
            total_cases,
            confirmed_cases: row.get(1),
            has_history: total_cases > 0,
            last_case_at: row.get(2),
            fraud_types: row.get(3),
        })
    }

    async fn similar_patterns(&self, user_id: &str) -> Result<Vec<SimilarPattern>, EngineError> {
        const SQL: &str = "\
            SELECT pattern_id, pattern_type, description, confidence::float8 \
            FROM fraud_patterns \
            WHERE confirmed AND $1 = ANY(user_ids) \
            ORDER BY confidence DESC LIMIT 5";
        let client = self.client().await?;
        let rows = deadline!("similar_patterns", client.query(SQL, &[&user_id]))?;
        Ok(rows
            .iter()
            .map(|r| SimilarPattern {
                pattern_id:   r.get(0),
                pattern_type: r.get(1),
                description:  r.get(2),
                confidence:   r.get(3),
            })
            .collect())
    }
}

// ── In-memory stub for engine tests ───────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashSet;
    use parking_lot::RwLock;

    /// Configurable in-memory HistoryReader. Any query named in `failing`
    /// returns `storage_unavailable`; everything else serves the canned value.
    #[derive(Default)]
    pub struct StubHistory {
        pub velocity:       VelocityMetrics,
        pub device:         DeviceHistory,
        pub ip:             IpHistory,
        pub escalation:     EscalationCheck,
        pub structuring:    StructuringCheck,
        pub connected:      Vec<ConnectedUser>,
        pub timing:         CoordinatedTiming,
        pub fraud_history:  FraudHistory,
        pub patterns:       Vec<SimilarPattern>,
        pub failing:        RwLock<HashSet<&'static str>>,
    }

    impl StubHistory {
        pub fn fail(&self, query: &'static str) {
            self.failing.write().insert(query);
        }

        fn check(&self, query: &'static str) -> Result<(), EngineError> {
            if self.failing.read().contains(query) {
                Err(EngineError::StorageUnavailable(format!("stub: {query} down")))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl HistoryReader for StubHistory {
        async fn velocity(&self, _: &str) -> Result<VelocityMetrics, EngineError> {
            self.check("velocity")?;
            Ok(self.velocity.clone())
        }
        async fn device_history(&self, _: &str) -> Result<DeviceHistory, EngineError> {
            self.check("device_history")?;
            Ok(self.device.clone())
        }
        async fn ip_history(&self, _: &str) -> Result<IpHistory, EngineError> {
            self.check("ip_history")?;
            Ok(self.ip.clone())
        }
        async fn detect_escalation(&self, _: &str, _: f64) -> Result<EscalationCheck, EngineError> {
            self.check("detect_escalation")?;
            Ok(self.escalation.clone())
        }
        async fn detect_structuring(&self, _: &str, _: f64) -> Result<StructuringCheck, EngineError> {
            self.check("detect_structuring")?;
            Ok(self.structuring.clone())
        }
        async fn connected_users(&self, _: &str, _: &str, _: &str)
            -> Result<Vec<ConnectedUser>, EngineError>
        {
            self.check("connected_users")?;
            Ok(self.connected.clone())
        }
        async fn coordinated_timing(&self, _: &[String]) -> Result<CoordinatedTiming, EngineError> {
            self.check("coordinated_timing")?;
            Ok(self.timing.clone())
        }
        async fn user_fraud_history(&self, _: &str) -> Result<FraudHistory, EngineError> {
            self.check("user_fraud_history")?;
            Ok(self.fraud_history.clone())
        }
        async fn similar_patterns(&self, _: &str) -> Result<Vec<SimilarPattern>, EngineError> {
            self.check("similar_patterns")?;
            Ok(self.patterns.clone())
        }
    }
}
