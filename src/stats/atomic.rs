//! Lock-free fleet-wide statistics using atomic operations.
//!
//! Aggregate counters only — per-instance history lives in the Vote Log and
//! each `Instance`'s own fields, not here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fleet-wide counters aggregated across every instance's attempts.
#[derive(Debug, Default)]
pub struct FleetStats {
    pub total_attempts: AtomicU64,
    pub total_success: AtomicU64,
    pub total_failures: AtomicU64,
    pub global_hourly_limit_events: AtomicU64,
    pub active_instances: AtomicU64,
    pub start_time: AtomicU64,
}

impl FleetStats {
    pub fn new() -> Self {
        Self {
            start_time: AtomicU64::new(now_secs()),
            ..Default::default()
        }
    }

    pub fn record_success(&self) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        self.total_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_global_hourly_limit(&self) {
        self.global_hourly_limit_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_instances(&self, count: u64) {
        self.active_instances.store(count, Ordering::Relaxed);
    }

    pub fn attempts_per_hour(&self) -> f64 {
        let start = self.start_time.load(Ordering::Relaxed);
        let elapsed_hours = (now_secs().saturating_sub(start)) as f64 / 3600.0;
        if elapsed_hours < 0.001 {
            return 0.0;
        }
        self.total_attempts.load(Ordering::Relaxed) as f64 / elapsed_hours
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.total_attempts.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.total_success.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn snapshot(&self) -> FleetStatsSnapshot {
        FleetStatsSnapshot {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            total_success: self.total_success.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            global_hourly_limit_events: self.global_hourly_limit_events.load(Ordering::Relaxed),
            active_instances: self.active_instances.load(Ordering::Relaxed),
            success_rate: self.success_rate(),
            attempts_per_hour: self.attempts_per_hour(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Serializable snapshot of fleet stats, as surfaced through the external
/// interface.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatsSnapshot {
    pub total_attempts: u64,
    pub total_success: u64,
    pub total_failures: u64,
    pub global_hourly_limit_events: u64,
    pub active_instances: u64,
    pub success_rate: f64,
    pub attempts_per_hour: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_with_no_attempts_is_one() {
        let stats = FleetStats::new();
        assert_eq!(stats.success_rate(), 1.0);
    }

    #[test]
    fn success_rate_tracks_mixed_outcomes() {
        let stats = FleetStats::new();
        stats.record_success();
        stats.record_success();
        stats.record_failure();
        assert!((stats.success_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
