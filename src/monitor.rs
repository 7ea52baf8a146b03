//! Per-unit contention bookkeeping.
//!
//! Version conflicts and lock denials both land in a unit's rolling window.
//! A unit is a hot spot while the window holds more than `hot_threshold`
//! events. State is in-process only and starts empty on every restart.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::warn;

use crate::config::MonitorConfig;
use crate::model::UnitId;
use crate::observability;

#[derive(Debug, Default)]
struct ConflictRecord {
    version_conflicts: u64,
    lock_denials: u64,
    retries_resolved: u64,
    retries_exhausted: u64,
    retries_abandoned: u64,
    window: VecDeque<Instant>,
    hot: bool,
}

impl ConflictRecord {
    fn prune(&mut self, now: Instant, window: std::time::Duration) {
        while let Some(front) = self.window.front() {
            if now.duration_since(*front) >= window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Outcome of a write that hit at least one conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Resolved,
    Exhausted,
    /// Stopped for another reason: the mutator refused the newer record, or
    /// the store failed.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitConflictStats {
    pub unit_id: UnitId,
    pub version_conflicts: u64,
    pub lock_denials: u64,
    pub retries_resolved: u64,
    pub retries_exhausted: u64,
    pub retries_abandoned: u64,
    pub events_in_window: usize,
    /// Contention events per second over the window.
    pub conflict_rate: f64,
    /// Share of conflicted writes that eventually succeeded. None when no
    /// write on this unit ever conflicted.
    pub retry_success_rate: Option<f64>,
    pub hot: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub window_secs: f64,
    pub hot_threshold: usize,
    pub units: Vec<UnitConflictStats>,
    pub total_version_conflicts: u64,
    pub total_lock_denials: u64,
    pub conflict_rate: f64,
    pub retry_success_rate: Option<f64>,
    pub hot_units: Vec<UnitId>,
}

fn success_rate(resolved: u64, failed: u64) -> Option<f64> {
    let total = resolved + failed;
    (total > 0).then(|| resolved as f64 / total as f64)
}

pub struct ConflictMonitor {
    records: DashMap<UnitId, ConflictRecord>,
    config: MonitorConfig,
}

impl Default for ConflictMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl ConflictMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    pub fn record_conflict(&self, unit_id: &str) {
        metrics::counter!(observability::VERSION_CONFLICTS_TOTAL).increment(1);
        self.record_contention(unit_id, |r| r.version_conflicts += 1);
    }

    pub fn record_lock_denial(&self, unit_id: &str) {
        metrics::counter!(observability::LOCK_DENIALS_TOTAL).increment(1);
        self.record_contention(unit_id, |r| r.lock_denials += 1);
    }

    pub fn record_retry_outcome(&self, unit_id: &str, outcome: RetryOutcome) {
        let mut record = self.records.entry(unit_id.to_string()).or_default();
        match outcome {
            RetryOutcome::Resolved => record.retries_resolved += 1,
            RetryOutcome::Exhausted => {
                record.retries_exhausted += 1;
                metrics::counter!(observability::WRITES_EXHAUSTED_TOTAL).increment(1);
            }
            RetryOutcome::Abandoned => record.retries_abandoned += 1,
        }
    }

    fn record_contention(&self, unit_id: &str, bump: impl FnOnce(&mut ConflictRecord)) {
        let now = Instant::now();
        let mut entry = self.records.entry(unit_id.to_string()).or_default();
        let record = entry.value_mut();
        bump(record);
        record.window.push_back(now);
        self.refresh(unit_id, record, now);
    }

    /// Drop stale window entries and re-evaluate the hot flag.
    fn refresh(&self, unit_id: &str, record: &mut ConflictRecord, now: Instant) -> bool {
        record.prune(now, self.config.window);
        let hot = record.window.len() > self.config.hot_threshold;
        if hot && !record.hot {
            warn!(
                unit_id,
                events = record.window.len(),
                window_secs = self.config.window.as_secs_f64(),
                "unit became a contention hot spot"
            );
            metrics::gauge!(observability::HOT_UNITS).increment(1.0);
        } else if !hot && record.hot {
            metrics::gauge!(observability::HOT_UNITS).decrement(1.0);
        }
        record.hot = hot;
        hot
    }

    pub fn is_hot_spot(&self, unit_id: &str) -> bool {
        let now = Instant::now();
        match self.records.get_mut(unit_id) {
            Some(mut entry) => self.refresh(unit_id, entry.value_mut(), now),
            None => false,
        }
    }

    pub fn hot_spots(&self) -> Vec<UnitId> {
        let mut hot: Vec<UnitId> = self
            .snapshot()
            .units
            .into_iter()
            .filter(|u| u.hot)
            .map(|u| u.unit_id)
            .collect();
        hot.sort();
        hot
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let now = Instant::now();
        let window_secs = self.config.window.as_secs_f64().max(f64::EPSILON);
        let mut units = Vec::with_capacity(self.records.len());

        for mut entry in self.records.iter_mut() {
            let unit_id = entry.key().clone();
            let record = entry.value_mut();
            let hot = self.refresh(&unit_id, record, now);
            let events_in_window = record.window.len();
            units.push(UnitConflictStats {
                unit_id,
                version_conflicts: record.version_conflicts,
                lock_denials: record.lock_denials,
                retries_resolved: record.retries_resolved,
                retries_exhausted: record.retries_exhausted,
                retries_abandoned: record.retries_abandoned,
                events_in_window,
                conflict_rate: events_in_window as f64 / window_secs,
                retry_success_rate: success_rate(
                    record.retries_resolved,
                    record.retries_exhausted + record.retries_abandoned,
                ),
                hot,
            });
        }
        units.sort_by(|a, b| a.unit_id.cmp(&b.unit_id));

        let total_events: usize = units.iter().map(|u| u.events_in_window).sum();
        let resolved: u64 = units.iter().map(|u| u.retries_resolved).sum();
        let failed: u64 = units
            .iter()
            .map(|u| u.retries_exhausted + u.retries_abandoned)
            .sum();
        MonitorSnapshot {
            window_secs,
            hot_threshold: self.config.hot_threshold,
            total_version_conflicts: units.iter().map(|u| u.version_conflicts).sum(),
            total_lock_denials: units.iter().map(|u| u.lock_denials).sum(),
            conflict_rate: total_events as f64 / window_secs,
            retry_success_rate: success_rate(resolved, failed),
            hot_units: units.iter().filter(|u| u.hot).map(|u| u.unit_id.clone()).collect(),
            units,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn monitor(threshold: usize, window_secs: u64) -> ConflictMonitor {
        ConflictMonitor::new(MonitorConfig {
            hot_threshold: threshold,
            window: Duration::from_secs(window_secs),
        })
    }

    #[tokio::test]
    async fn hot_once_threshold_exceeded() {
        let m = monitor(5, 60);
        for _ in 0..5 {
            m.record_conflict("S1");
        }
        assert!(!m.is_hot_spot("S1"));
        m.record_conflict("S1");
        assert!(m.is_hot_spot("S1"));
        assert!(!m.is_hot_spot("S2"));
        assert_eq!(m.hot_spots(), vec!["S1".to_string()]);
    }

    #[tokio::test]
    async fn lock_denials_count_toward_window() {
        let m = monitor(2, 60);
        m.record_lock_denial("S1");
        m.record_lock_denial("S1");
        m.record_conflict("S1");
        assert!(m.is_hot_spot("S1"));

        let snap = m.snapshot();
        assert_eq!(snap.units[0].lock_denials, 2);
        assert_eq!(snap.units[0].version_conflicts, 1);
        assert_eq!(snap.total_lock_denials, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn window_expiry_cools_unit_down() {
        let m = monitor(1, 10);
        m.record_conflict("S1");
        m.record_conflict("S1");
        assert!(m.is_hot_spot("S1"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!m.is_hot_spot("S1"));
        let snap = m.snapshot();
        assert_eq!(snap.units[0].events_in_window, 0);
        // Lifetime counters survive the window.
        assert_eq!(snap.units[0].version_conflicts, 2);
        assert!(snap.hot_units.is_empty());
    }

    #[tokio::test]
    async fn retry_success_rate() {
        let m = monitor(5, 60);
        assert_eq!(m.snapshot().retry_success_rate, None);

        m.record_retry_outcome("S1", RetryOutcome::Resolved);
        m.record_retry_outcome("S1", RetryOutcome::Resolved);
        m.record_retry_outcome("S1", RetryOutcome::Resolved);
        m.record_retry_outcome("S2", RetryOutcome::Exhausted);

        let snap = m.snapshot();
        assert_eq!(snap.retry_success_rate, Some(0.75));
        let s1 = snap.units.iter().find(|u| u.unit_id == "S1").unwrap();
        assert_eq!(s1.retry_success_rate, Some(1.0));
        let s2 = snap.units.iter().find(|u| u.unit_id == "S2").unwrap();
        assert_eq!(s2.retry_success_rate, Some(0.0));
    }

    #[tokio::test]
    async fn conflict_rate_is_per_second_over_window() {
        let m = monitor(100, 10);
        for _ in 0..5 {
            m.record_conflict("S1");
        }
        let snap = m.snapshot();
        assert!((snap.units[0].conflict_rate - 0.5).abs() < 1e-9);
        assert!((snap.conflict_rate - 0.5).abs() < 1e-9);
    }
}
