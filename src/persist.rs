// src/persist.rs
//
// State snapshot: discovered patterns, ensemble weights, and the aggregate
// performance counters, serialized as one opaque bincode blob. Saved on
// graceful shutdown and by the periodic checkpoint loop; absence at startup
// means a fresh start, never an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::engine::patterns::PatternDiscovery;
use crate::error::EngineError;
use crate::events::DiscoveredPattern;
use crate::layers::ensemble::GradientEnsemble;
use crate::worker::{PerfReport, PerfStats};

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub learned_patterns:  Vec<DiscoveredPattern>,
    pub model_weights:     Vec<f64>,
    pub performance_stats: PerfReport,
    pub last_updated:      DateTime<Utc>,
}

/// Gather the current state from the live components.
pub fn capture(
    ensemble: &GradientEnsemble,
    discovery: &PatternDiscovery,
    stats: &PerfStats,
) -> PersistedState {
    PersistedState {
        learned_patterns:  discovery.patterns(),
        model_weights:     ensemble.weights(),
        performance_stats: stats.report(),
        last_updated:      Utc::now(),
    }
}

pub fn save(path: &Path, state: &PersistedState) -> Result<(), EngineError> {
    let blob = bincode::serialize(state)
        .map_err(|e| EngineError::InternalFault(format!("snapshot encode: {e}")))?;
    std::fs::write(path, blob)
        .map_err(|e| EngineError::InternalFault(format!("snapshot write: {e}")))?;
    debug!(path = %path.display(), "state snapshot written");
    Ok(())
}

/// Missing or unreadable snapshots start the system fresh.
pub fn load(path: &Path) -> Option<PersistedState> {
    let blob = std::fs::read(path).ok()?;
    match bincode::deserialize::<PersistedState>(&blob) {
        Ok(state) => {
            info!(
                path = %path.display(),
                patterns = state.learned_patterns.len(),
                last_updated = %state.last_updated,
                "state snapshot restored"
            );
            Some(state)
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "snapshot unreadable, starting fresh");
            None
        }
    }
}

/// Periodic background checkpoint, mirroring the shutdown save.
pub async fn checkpoint_loop(
    path: PathBuf,
    ensemble: Arc<GradientEnsemble>,
    discovery: Arc<PatternDiscovery>,
    stats: Arc<PerfStats>,
) {
    loop {
        tokio::time::sleep(CHECKPOINT_INTERVAL).await;
        let state = capture(&ensemble, &discovery, &stats);
        if let Err(e) = save(&path, &state) {
            error!(error = %e, "checkpoint failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fraudguard_test_{name}_{}", std::process::id()))
    }

    #[test]
    fn snapshot_round_trips() {
        let ensemble = GradientEnsemble::new();
        let discovery = PatternDiscovery::new();
        let stats = PerfStats::new();
        stats.record_case(crate::events::Decision::AutoBlocked, 12);

        let state = capture(&ensemble, &discovery, &stats);
        let path = tmp_path("roundtrip");
        save(&path, &state).unwrap();

        let restored = load(&path).unwrap();
        assert_eq!(restored.model_weights, ensemble.weights());
        assert_eq!(restored.performance_stats.total_cases, 1);
        assert_eq!(restored.performance_stats.auto_blocked, 1);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_snapshot_is_none() {
        assert!(load(Path::new("/nonexistent/fraudguard.bin")).is_none());
    }

    #[test]
    fn corrupt_snapshot_is_none() {
        let path = tmp_path("corrupt");
        std::fs::write(&path, b"definitely not bincode").unwrap();
        assert!(load(&path).is_none());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn restored_patterns_reseed_discovery() {
        let discovery = PatternDiscovery::new();
        let pattern = DiscoveredPattern {
            pattern_id: "fp-abc".into(),
            pattern_type: "income_ratio_abuse".into(),
            signature: "amount_income_ratio > 10".into(),
            occurrences: 7,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            precision: 0.9,
            recall: 0.4,
            centroid: vec![9.0, 12.0, 4.0, 0.2, 0.1, 0.3],
        };
        let state = PersistedState {
            learned_patterns:  vec![pattern],
            model_weights:     vec![0.25, 0.2, 0.2, 0.2, 0.15],
            performance_stats: PerfReport::default(),
            last_updated:      Utc::now(),
        };
        let path = tmp_path("reseed");
        save(&path, &state).unwrap();
        let restored = load(&path).unwrap();
        discovery.seed(restored.learned_patterns);
        assert_eq!(discovery.patterns().len(), 1);
        assert_eq!(discovery.patterns()[0].occurrences, 7);
        std::fs::remove_file(&path).ok();
    }
}
