//! Shadow-sync control plane for the local → managed migration.
//!
//! Tracks dual-write and shadow-read counters and owns the four-phase
//! promotion state machine. Performs no I/O.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{MAX_REPLICATION_FAILURE_RATE, MIN_SHADOW_READS, SHADOW_MATCH_THRESHOLD};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ShadowPhase {
    #[default]
    Off,
    Shadow,
    Verified,
    Promoted,
}

impl ShadowPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Shadow => "shadow",
            Self::Verified => "verified",
            Self::Promoted => "promoted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(Self::Off),
            "shadow" => Some(Self::Shadow),
            "verified" => Some(Self::Verified),
            "promoted" => Some(Self::Promoted),
            _ => None,
        }
    }

    /// Dual-write and shadow-read are active in every phase except `off`.
    #[must_use]
    pub fn mirrors_writes(self) -> bool {
        self != Self::Off
    }
}

impl Display for ShadowPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable part of the manager. Metrics are process-local and not included.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShadowConfig {
    pub phase: ShadowPhase,
    pub dual_write_enabled: bool,
    pub shadow_read_enabled: bool,
    #[serde(default)]
    pub managed_endpoint: String,
    #[serde(default)]
    pub managed_api_key: String,
}

impl ShadowConfig {
    /// Config for `phase` with mirroring flags derived from the phase.
    #[must_use]
    pub fn for_phase(phase: ShadowPhase, endpoint: &str, api_key: &str) -> Self {
        Self {
            phase,
            dual_write_enabled: phase.mirrors_writes(),
            shadow_read_enabled: phase.mirrors_writes(),
            managed_endpoint: endpoint.to_string(),
            managed_api_key: api_key.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ShadowMetrics {
    pub primary_writes: u64,
    pub managed_replications: u64,
    pub replication_failures: u64,
    pub shadow_reads: u64,
    pub shadow_matches: u64,
    pub shadow_divergences: u64,
    pub shadow_match_rate: f64,
}

impl ShadowMetrics {
    /// `replication_failures / (managed_replications + replication_failures)`, 0 with no attempts.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn replication_failure_rate(&self) -> f64 {
        let total = self.managed_replications + self.replication_failures;
        if total == 0 {
            0.0
        } else {
            self.replication_failures as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromotionReadiness {
    pub ready: bool,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ShadowSyncManager {
    config: ShadowConfig,
    metrics: ShadowMetrics,
}

impl ShadowSyncManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a manager from a persisted config. Counters start at zero.
    #[must_use]
    pub fn from_config(config: ShadowConfig) -> Self {
        Self { config, metrics: ShadowMetrics::default() }
    }

    #[must_use]
    pub fn phase(&self) -> ShadowPhase {
        self.config.phase
    }

    #[must_use]
    pub fn dual_write_enabled(&self) -> bool {
        self.config.dual_write_enabled
    }

    #[must_use]
    pub fn shadow_read_enabled(&self) -> bool {
        self.config.shadow_read_enabled
    }

    /// Copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> ShadowMetrics {
        self.metrics
    }

    /// Zero every counter. Phase and config are untouched.
    pub fn reset_metrics(&mut self) {
        self.metrics = ShadowMetrics::default();
    }

    pub fn record_primary_write(&mut self) {
        self.metrics.primary_writes += 1;
    }

    pub fn record_replication(&mut self, success: bool) {
        if success {
            self.metrics.managed_replications += 1;
        } else {
            self.metrics.replication_failures += 1;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn record_shadow_read(&mut self, matched: bool) {
        self.metrics.shadow_reads += 1;
        if matched {
            self.metrics.shadow_matches += 1;
        } else {
            self.metrics.shadow_divergences += 1;
        }
        self.metrics.shadow_match_rate =
            self.metrics.shadow_matches as f64 / self.metrics.shadow_reads as f64;
    }

    /// Evaluate every promotion gate and report all that fail.
    #[must_use]
    pub fn is_ready_for_promotion(&self) -> PromotionReadiness {
        let metrics = &self.metrics;
        let mut reasons = Vec::new();

        if metrics.shadow_reads < MIN_SHADOW_READS {
            reasons.push(format!(
                "Insufficient shadow reads: {}/{MIN_SHADOW_READS}",
                metrics.shadow_reads
            ));
        }

        if metrics.shadow_match_rate < SHADOW_MATCH_THRESHOLD {
            reasons.push(format!(
                "Shadow match rate too low: {:.1}% (need >={:.0}%)",
                metrics.shadow_match_rate * 100.0,
                SHADOW_MATCH_THRESHOLD * 100.0
            ));
        }

        let failure_rate = metrics.replication_failure_rate();
        if failure_rate > MAX_REPLICATION_FAILURE_RATE {
            reasons.push(format!(
                "Replication failure rate too high: {:.1}% (need <={:.0}%)",
                failure_rate * 100.0,
                MAX_REPLICATION_FAILURE_RATE * 100.0
            ));
        }

        PromotionReadiness { ready: reasons.is_empty(), reasons }
    }

    /// Move one step forward. `shadow → verified` only when every gate passes.
    pub fn advance_phase(&mut self) -> ShadowPhase {
        match self.config.phase {
            ShadowPhase::Off => {
                self.config.phase = ShadowPhase::Shadow;
                self.config.dual_write_enabled = true;
                self.config.shadow_read_enabled = true;
            }
            ShadowPhase::Shadow => {
                if self.is_ready_for_promotion().ready {
                    self.config.phase = ShadowPhase::Verified;
                }
            }
            ShadowPhase::Verified => {
                self.config.phase = ShadowPhase::Promoted;
            }
            ShadowPhase::Promoted => {}
        }
        self.config.phase
    }

    /// Return to `off` from any phase and stop mirroring.
    pub fn rollback(&mut self) {
        self.config.phase = ShadowPhase::Off;
        self.config.dual_write_enabled = false;
        self.config.shadow_read_enabled = false;
    }

    #[must_use]
    pub fn to_config(&self) -> ShadowConfig {
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager_in(phase: ShadowPhase) -> ShadowSyncManager {
        ShadowSyncManager::from_config(ShadowConfig::for_phase(phase, "", ""))
    }

    fn record_reads(manager: &mut ShadowSyncManager, matches: u64, divergences: u64) {
        for _ in 0..matches {
            manager.record_shadow_read(true);
        }
        for _ in 0..divergences {
            manager.record_shadow_read(false);
        }
    }

    fn record_replications(manager: &mut ShadowSyncManager, successes: u64, failures: u64) {
        for _ in 0..successes {
            manager.record_replication(true);
        }
        for _ in 0..failures {
            manager.record_replication(false);
        }
    }

    #[test]
    fn match_rate_is_zero_before_any_read() {
        let manager = ShadowSyncManager::new();
        assert!(manager.snapshot().shadow_match_rate.abs() < f64::EPSILON);
    }

    #[test]
    fn ninety_five_of_hundred_matches_is_exactly_point_ninety_five() {
        let mut manager = manager_in(ShadowPhase::Shadow);
        record_reads(&mut manager, 95, 5);
        let metrics = manager.snapshot();
        assert_eq!(metrics.shadow_reads, 100);
        assert_eq!(metrics.shadow_matches, 95);
        assert_eq!(metrics.shadow_divergences, 5);
        assert!((metrics.shadow_match_rate - 0.95).abs() < 1e-12);
    }

    #[test]
    fn primary_writes_are_counted_independently_of_replication() {
        let mut manager = manager_in(ShadowPhase::Shadow);
        for _ in 0..100 {
            manager.record_primary_write();
        }
        record_replications(&mut manager, 98, 2);
        let metrics = manager.snapshot();
        assert_eq!(metrics.primary_writes, 100);
        assert_eq!(metrics.managed_replications, 98);
        assert_eq!(metrics.replication_failures, 2);
        assert!((metrics.replication_failure_rate() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn exactly_one_percent_failure_rate_passes_the_gate() {
        let mut manager = manager_in(ShadowPhase::Shadow);
        record_reads(&mut manager, 100, 0);
        record_replications(&mut manager, 99, 1);
        let readiness = manager.is_ready_for_promotion();
        assert!(readiness.ready, "unexpected reasons: {:?}", readiness.reasons);
        assert!(readiness.reasons.is_empty());
    }

    #[test]
    fn failure_rate_above_one_percent_is_rejected() {
        let mut manager = manager_in(ShadowPhase::Shadow);
        record_reads(&mut manager, 100, 0);
        record_replications(&mut manager, 989, 11);
        let readiness = manager.is_ready_for_promotion();
        assert!(!readiness.ready);
        assert_eq!(readiness.reasons.len(), 1);
        assert!(readiness.reasons[0].contains("failure rate"));
    }

    #[test]
    fn low_match_rate_is_rejected() {
        let mut manager = manager_in(ShadowPhase::Shadow);
        record_reads(&mut manager, 90, 10);
        let readiness = manager.is_ready_for_promotion();
        assert!(!readiness.ready);
        assert!(readiness.reasons.iter().any(|reason| reason.contains("match rate")));
    }

    #[test]
    fn too_few_reads_is_rejected() {
        let mut manager = manager_in(ShadowPhase::Shadow);
        record_reads(&mut manager, 99, 0);
        let readiness = manager.is_ready_for_promotion();
        assert!(!readiness.ready);
        assert!(readiness
            .reasons
            .iter()
            .any(|reason| reason.contains("Insufficient shadow reads")));
        assert_eq!(manager.clone().advance_phase(), ShadowPhase::Shadow);
    }

    #[test]
    fn every_failing_gate_is_reported() {
        let mut manager = manager_in(ShadowPhase::Shadow);
        record_reads(&mut manager, 5, 5);
        record_replications(&mut manager, 1, 1);
        let readiness = manager.is_ready_for_promotion();
        assert!(!readiness.ready);
        assert_eq!(readiness.reasons.len(), 3);
        assert!(readiness.reasons[0].contains("Insufficient shadow reads"));
        assert!(readiness.reasons[1].contains("match rate"));
        assert!(readiness.reasons[2].contains("failure rate"));
    }

    #[test]
    fn shadow_phase_holds_until_gates_pass() {
        let mut manager = ShadowSyncManager::new();
        assert_eq!(manager.advance_phase(), ShadowPhase::Shadow);
        for _ in 0..5 {
            assert_eq!(manager.advance_phase(), ShadowPhase::Shadow);
        }
    }

    #[test]
    fn full_lifecycle_takes_exactly_three_advances_once_gates_pass() {
        let mut manager = ShadowSyncManager::new();
        assert_eq!(manager.phase(), ShadowPhase::Off);
        assert!(!manager.dual_write_enabled());
        assert!(!manager.shadow_read_enabled());

        record_reads(&mut manager, 100, 0);
        record_replications(&mut manager, 100, 0);

        assert_eq!(manager.advance_phase(), ShadowPhase::Shadow);
        assert!(manager.dual_write_enabled());
        assert!(manager.shadow_read_enabled());
        assert_eq!(manager.advance_phase(), ShadowPhase::Verified);
        assert_eq!(manager.advance_phase(), ShadowPhase::Promoted);
        assert_eq!(manager.advance_phase(), ShadowPhase::Promoted);
    }

    #[test]
    fn rollback_returns_to_off_from_every_phase() {
        for phase in
            [ShadowPhase::Off, ShadowPhase::Shadow, ShadowPhase::Verified, ShadowPhase::Promoted]
        {
            let mut manager = manager_in(phase);
            manager.rollback();
            assert_eq!(manager.phase(), ShadowPhase::Off);
            let config = manager.to_config();
            assert!(!config.dual_write_enabled);
            assert!(!config.shadow_read_enabled);
        }
    }

    #[test]
    fn config_round_trips_through_json_without_metrics() -> Result<(), serde_json::Error> {
        let mut manager = ShadowSyncManager::from_config(ShadowConfig::for_phase(
            ShadowPhase::Verified,
            "postgresql://db.example/mem",
            "key-1",
        ));
        record_reads(&mut manager, 10, 0);

        let json = serde_json::to_string(&manager.to_config())?;
        assert!(json.contains("\"dualWriteEnabled\":true"));
        assert!(json.contains("\"phase\":\"verified\""));

        let restored = ShadowSyncManager::from_config(serde_json::from_str(&json)?);
        assert_eq!(restored.to_config(), manager.to_config());
        assert_eq!(restored.phase(), ShadowPhase::Verified);
        assert_eq!(restored.snapshot().shadow_reads, 0);
        Ok(())
    }

    #[test]
    fn reset_metrics_keeps_phase() {
        let mut manager = manager_in(ShadowPhase::Shadow);
        record_reads(&mut manager, 3, 1);
        manager.record_primary_write();
        manager.reset_metrics();
        assert_eq!(manager.snapshot(), ShadowMetrics::default());
        assert_eq!(manager.phase(), ShadowPhase::Shadow);
    }

    #[test]
    fn phase_parse_and_as_str_agree() {
        for phase in
            [ShadowPhase::Off, ShadowPhase::Shadow, ShadowPhase::Verified, ShadowPhase::Promoted]
        {
            assert_eq!(ShadowPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(ShadowPhase::parse("cutover"), None);
    }

    proptest! {
        #[test]
        fn match_rate_equals_matches_over_reads(
            outcomes in proptest::collection::vec(any::<bool>(), 0..400)
        ) {
            let mut manager = ShadowSyncManager::new();
            for matched in &outcomes {
                manager.record_shadow_read(*matched);
            }
            let metrics = manager.snapshot();
            prop_assert_eq!(metrics.shadow_reads, outcomes.len() as u64);
            prop_assert_eq!(
                metrics.shadow_matches + metrics.shadow_divergences,
                metrics.shadow_reads
            );
            let expected = if metrics.shadow_reads == 0 {
                0.0
            } else {
                metrics.shadow_matches as f64 / metrics.shadow_reads as f64
            };
            prop_assert!((metrics.shadow_match_rate - expected).abs() < 1e-12);
        }
    }
}
