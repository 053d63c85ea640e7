//! Instance: a single proxy-bound voter, its state machine, and the
//! per-instance attempt loop. Every Instance runs as one cooperative task;
//! there is no reference back from `Instance` to the scheduler beyond the
//! shared `FleetSignals` handle, so the two never form a cycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use crate::browser::{self, ActiveBrowsers, WorkerAttempt, WorkerConfig};
use crate::classifier::Outcome;
use crate::proxy::ProxyAllocator;
use crate::session_store::{SessionRecord, SessionStore};
use crate::stats::FleetStats;
use crate::votelog::{VoteLog, VoteLogEntry};

const MAX_CONSECUTIVE_INIT_FAILURES: u32 = 5;
const BACKOFF_BASE_SECS: u64 = 30;
const BACKOFF_CAP_SECS: u64 = 300;
const EXCLUDED_RECHECK: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Idle,
    Launching,
    Voting,
    Cooldown,
    RetryBackoff,
    Paused,
    Excluded,
    Terminated,
}

/// Fleet-wide signals every Instance reads (and the global-limit path
/// writes to). Owned by whatever constructs the fleet, shared by `Arc`.
#[derive(Default)]
pub struct FleetSignals {
    pub global_hourly_limit_active: AtomicBool,
    pub global_reactivation_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    pub global_started_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
}

impl FleetSignals {
    pub fn trigger_global_limit(&self, reactivation_at: DateTime<Utc>) {
        self.global_hourly_limit_active.store(true, Ordering::SeqCst);
        *self.global_started_at.write() = Some(Utc::now());
        *self.global_reactivation_at.write() = Some(reactivation_at);
    }

    pub fn clear_global_limit(&self) {
        self.global_hourly_limit_active.store(false, Ordering::SeqCst);
        *self.global_started_at.write() = None;
        *self.global_reactivation_at.write() = None;
    }

    pub fn is_active(&self) -> bool {
        self.global_hourly_limit_active.load(Ordering::SeqCst)
    }
}

pub struct InstanceDeps {
    pub vote_log: Arc<VoteLog>,
    pub session_store: Arc<SessionStore>,
    pub proxy: Arc<ProxyAllocator>,
    pub launch_budget: Arc<Semaphore>,
    pub active_browsers: Arc<ActiveBrowsers>,
    pub worker_config: Arc<WorkerConfig>,
    pub fleet_signals: Arc<FleetSignals>,
    pub stats: Arc<FleetStats>,
    pub retry_delay_technical: Duration,
    pub retry_delay_cooldown: Duration,
    pub session_scan_interval: Duration,
}

/// A single proxy-bound voter. All mutable fields use atomics or a
/// `parking_lot::RwLock` so a snapshot can be taken from the external
/// interface without blocking the attempt loop.
pub struct Instance {
    pub id: u32,
    pub name: String,
    state: parking_lot::RwLock<InstanceState>,
    vote_count: AtomicU64,
    last_success_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_attempt_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_failure_type: parking_lot::RwLock<Option<String>>,
    last_failure_reason: parking_lot::RwLock<Option<String>>,
    consecutive_init_failures: AtomicU32,
    paused: AtomicBool,
    excluded: AtomicBool,
    browser_opened_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: u32,
    pub name: String,
    pub state: InstanceState,
    pub vote_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_failure_type: Option<String>,
    pub last_failure_reason: Option<String>,
    pub consecutive_init_failures: u32,
    pub paused: bool,
    pub excluded: bool,
}

impl Instance {
    pub fn new(id: u32, name: impl Into<String>, record: Option<&SessionRecord>) -> Self {
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            id,
            name: name.into(),
            state: parking_lot::RwLock::new(InstanceState::Idle),
            vote_count: AtomicU64::new(record.map(|r| r.vote_count).unwrap_or(0)),
            last_success_at: parking_lot::RwLock::new(record.and_then(|r| r.last_success_at)),
            last_attempt_at: parking_lot::RwLock::new(None),
            last_failure_type: parking_lot::RwLock::new(None),
            last_failure_reason: parking_lot::RwLock::new(None),
            consecutive_init_failures: AtomicU32::new(0),
            paused: AtomicBool::new(false),
            excluded: AtomicBool::new(false),
            browser_opened_at: parking_lot::RwLock::new(None),
            pause_tx,
            pause_rx,
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: *self.state.read(),
            vote_count: self.vote_count.load(Ordering::SeqCst),
            last_success_at: *self.last_success_at.read(),
            last_attempt_at: *self.last_attempt_at.read(),
            last_failure_type: self.last_failure_type.read().clone(),
            last_failure_reason: self.last_failure_reason.read().clone(),
            consecutive_init_failures: self.consecutive_init_failures.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            excluded: self.excluded.load(Ordering::SeqCst),
        }
    }

    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        *self.last_success_at.read()
    }

    pub fn set_last_success_at(&self, at: DateTime<Utc>) {
        *self.last_success_at.write() = Some(at);
    }

    pub fn is_excluded(&self) -> bool {
        self.excluded.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Edge-triggered: only fires the watch channel on an actual flip.
    pub fn set_paused(&self, paused: bool) {
        let previous = self.paused.swap(paused, Ordering::SeqCst);
        if previous != paused {
            let _ = self.pause_tx.send(paused);
            info!(instance_id = self.id, paused, "pause state changed");
        }
    }

    /// §4.7 time_until_next_vote: five-step priority, the later of any two
    /// that apply. Also reports which candidate won, since the external
    /// interface needs to surface *why* an instance is waiting, not just
    /// how long.
    pub fn time_until_next_vote(
        &self,
        now: DateTime<Utc>,
        fleet_signals: &FleetSignals,
        retry_delay_technical: Duration,
        retry_delay_cooldown: Duration,
    ) -> NextVoteTiming {
        let mut candidates: Vec<(Duration, &'static str)> = Vec::new();

        if fleet_signals.is_active() {
            if let Some(reactivation) = *fleet_signals.global_reactivation_at.read() {
                candidates.push((non_negative(reactivation - now), "global_hourly_limit"));
            }
        }

        let failure_type = self.last_failure_type.read().clone();
        let last_attempt = *self.last_attempt_at.read();

        if failure_type.as_deref() == Some("technical") {
            if let Some(last) = last_attempt {
                candidates.push((
                    non_negative(last + chrono::Duration::from_std(retry_delay_technical).unwrap_or_default() - now),
                    "technical",
                ));
            }
        }
        if failure_type.as_deref() == Some("ip_cooldown") {
            if let Some(last) = last_attempt {
                candidates.push((
                    non_negative(last + chrono::Duration::from_std(retry_delay_cooldown).unwrap_or_default() - now),
                    "ip_cooldown",
                ));
            }
        }
        if let Some(success) = *self.last_success_at.read() {
            candidates.push((
                non_negative(success + chrono::Duration::from_std(retry_delay_cooldown).unwrap_or_default() - now),
                "success_cooldown",
            ));
        }

        candidates
            .into_iter()
            .max_by_key(|(wait, _)| *wait)
            .map(|(wait, retry_type)| NextVoteTiming { wait, retry_type })
            .unwrap_or(NextVoteTiming { wait: Duration::ZERO, retry_type: "none" })
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.write() = state;
    }
}

/// Result of `Instance::time_until_next_vote`: how long to wait, and which
/// of the five priority candidates produced that wait (`"none"` when the
/// instance is immediately eligible).
#[derive(Debug, Clone, Copy)]
pub struct NextVoteTiming {
    pub wait: Duration,
    pub retry_type: &'static str,
}

fn non_negative(d: chrono::Duration) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

/// Run the state machine for one instance until it is Excluded or the
/// process is shutting down. Owns its own sleeping/backoff; never touches
/// any other instance.
pub async fn run(instance: Arc<Instance>, deps: Arc<InstanceDeps>, storage_dir: PathBuf) {
    loop {
        if instance.is_excluded() {
            instance.set_state(InstanceState::Excluded);
            tokio::time::sleep(EXCLUDED_RECHECK).await;
            continue;
        }

        let timing = instance.time_until_next_vote(
            Utc::now(),
            &deps.fleet_signals,
            deps.retry_delay_technical,
            deps.retry_delay_cooldown,
        );
        if timing.wait > Duration::ZERO {
            instance.set_state(InstanceState::Cooldown);
            tokio::time::sleep(timing.wait.min(deps.session_scan_interval)).await;
            continue;
        }

        if instance.is_paused() {
            instance.set_state(InstanceState::Paused);
            let mut rx = instance.pause_rx.clone();
            while *rx.borrow() {
                if rx.changed().await.is_err() {
                    return;
                }
            }
            continue;
        }

        instance.set_state(InstanceState::Launching);
        run_attempt(&instance, &deps, &storage_dir).await;
    }
}

async fn run_attempt(instance: &Arc<Instance>, deps: &Arc<InstanceDeps>, storage_dir: &PathBuf) {
    let allocation = match deps.proxy.acquire(instance.id).await {
        Ok(a) => a,
        Err(e) => {
            warn!(instance_id = instance.id, "proxy allocation failed: {}", e);
            record_technical_failure(instance, deps, "proxy allocation failed", None, None).await;
            return;
        }
    };

    let vote_count_before = instance.vote_count.load(Ordering::SeqCst);

    instance.set_state(InstanceState::Voting);
    let attempt = WorkerAttempt {
        instance_id: instance.id,
        storage_dir: storage_dir.clone(),
        proxy_url: Some(allocation.endpoint.clone()),
        vote_count_before,
    };

    let result = browser::run_worker(&deps.launch_budget, &deps.active_browsers, &deps.worker_config, attempt).await;
    *instance.browser_opened_at.write() = result.browser_opened_at;

    handle_outcome(instance, deps, &allocation, result).await;
}

async fn handle_outcome(
    instance: &Arc<Instance>,
    deps: &Arc<InstanceDeps>,
    allocation: &crate::proxy::Allocation,
    result: browser::WorkerResult,
) {
    let now = Utc::now();
    *instance.last_attempt_at.write() = Some(now);

    // A successful browser open clears the init-failure streak regardless of
    // how the attempt itself turns out — the streak tracks the instance's
    // ability to get a browser open at all, not per-attempt outcomes.
    if result.browser_opened_at.is_some() {
        instance.consecutive_init_failures.store(0, Ordering::SeqCst);
    }

    let sleep_duration;
    let mut log_status = "failed".to_string();

    match &result.outcome {
        Outcome::Success { .. } | Outcome::SuccessUnverified { .. } => {
            log_status = "success".to_string();
            instance.vote_count.fetch_add(1, Ordering::SeqCst);
            *instance.last_success_at.write() = Some(now);
            *instance.last_failure_type.write() = None;
            *instance.last_failure_reason.write() = None;
            sleep_duration = deps.retry_delay_cooldown;
            deps.stats.record_success();
            persist_session(instance, deps, allocation, now).await;
        }
        Outcome::InstanceCooldown { message } => {
            *instance.last_failure_type.write() = Some("ip_cooldown".to_string());
            *instance.last_failure_reason.write() = Some(message.clone());
            sleep_duration = deps.retry_delay_cooldown;
            deps.stats.record_failure();
        }
        Outcome::GlobalHourlyLimit { message } => {
            *instance.last_failure_type.write() = Some("global_hourly_limit".to_string());
            *instance.last_failure_reason.write() = Some(message.clone());
            let reactivation = next_top_of_hour(now);
            deps.fleet_signals.trigger_global_limit(reactivation);
            sleep_duration = deps.retry_delay_cooldown;
            deps.stats.record_failure();
            deps.stats.record_global_hourly_limit();
        }
        Outcome::LoginRequired { button_text } => {
            *instance.last_failure_type.write() = Some("login_required".to_string());
            *instance.last_failure_reason.write() = Some(button_text.clone());
            instance.excluded.store(true, Ordering::SeqCst);
            info!(instance_id = instance.id, "excluded: login required");
            sleep_duration = Duration::ZERO;
            deps.stats.record_failure();
        }
        Outcome::Technical { reason } => {
            note_init_failure(instance, reason.clone());
            sleep_duration = current_backoff(instance);
            deps.stats.record_failure();
        }
        Outcome::NavigationError => {
            note_init_failure(instance, "navigation error".to_string());
            sleep_duration = current_backoff(instance);
            deps.stats.record_failure();
        }
        Outcome::LaunchLockTimeout => {
            // §4.6/S5: a launch-lock timeout means the instance never even
            // got a turn — it must not grow the back-off or count toward
            // auto-pause. Fixed 30s sleep and retry, no failure recorded.
            *instance.last_failure_type.write() = Some("technical".to_string());
            *instance.last_failure_reason.write() = Some("launch lock timeout".to_string());
            sleep_duration = Duration::from_secs(30);
        }
    }

    let entry = VoteLogEntry {
        timestamp: now,
        instance_id: instance.id,
        instance_name: instance.name.clone(),
        time_of_click: now.to_rfc3339(),
        status: log_status,
        voting_url: deps.worker_config.target_url.clone(),
        cooldown_message: cooldown_message(&result.outcome),
        failure_type: result.outcome.failure_type().to_string(),
        failure_reason: failure_reason(&result.outcome),
        initial_vote_count: result.initial_count,
        final_vote_count: result.final_count,
        vote_count_change: match (result.initial_count, result.final_count) {
            (Some(i), Some(f)) => Some(f as i64 - i as i64),
            _ => None,
        },
        proxy_ip: allocation.observed_ip.clone(),
        session_token: allocation.session_token.clone(),
        click_attempts: click_attempts(&result.outcome),
        error_message: failure_reason(&result.outcome),
        browser_closed: true,
    };

    if let Err(e) = deps.vote_log.append_attempt(entry).await {
        warn!(instance_id = instance.id, "failed to append vote log entry: {}", e);
    }

    if matches!(result.outcome, Outcome::GlobalHourlyLimit { .. }) {
        let hourly_entry = crate::votelog::HourlyLimitEntry {
            detected_at: now,
            instance_id: instance.id,
            instance_name: instance.name.clone(),
            vote_count: instance.vote_count.load(Ordering::SeqCst),
            proxy_ip: allocation.observed_ip.clone(),
            session_token: allocation.session_token.clone(),
            cooldown_message: cooldown_message(&result.outcome),
            failure_type: "global_hourly_limit".to_string(),
        };
        if let Err(e) = deps.vote_log.append_hourly_limit(hourly_entry).await {
            warn!(instance_id = instance.id, "failed to append hourly limit entry: {}", e);
        }
    }

    if sleep_duration > Duration::ZERO {
        instance.set_state(InstanceState::Cooldown);
        tokio::time::sleep(sleep_duration).await;
    }
}

fn note_init_failure(instance: &Arc<Instance>, reason: String) {
    *instance.last_failure_type.write() = Some("technical".to_string());
    *instance.last_failure_reason.write() = Some(reason);
    let failures = instance.consecutive_init_failures.fetch_add(1, Ordering::SeqCst) + 1;
    if failures >= MAX_CONSECUTIVE_INIT_FAILURES {
        warn!(
            instance_id = instance.id,
            failures, "auto-pausing after consecutive init failures"
        );
        instance.set_paused(true);
    }
}

fn current_backoff(instance: &Arc<Instance>) -> Duration {
    let n = instance.consecutive_init_failures.load(Ordering::SeqCst).max(1);
    let secs = BACKOFF_BASE_SECS.saturating_mul(1u64 << (n - 1).min(20));
    Duration::from_secs(secs.min(BACKOFF_CAP_SECS))
}

async fn persist_session(
    instance: &Arc<Instance>,
    deps: &Arc<InstanceDeps>,
    allocation: &crate::proxy::Allocation,
    now: DateTime<Utc>,
) {
    let record = SessionRecord {
        instance_id: instance.id,
        proxy_ip: allocation.observed_ip.clone(),
        session_token: allocation.session_token.clone(),
        last_success_at: Some(now),
        vote_count: instance.vote_count.load(Ordering::SeqCst),
        saved_at: now,
    };
    if let Err(e) = deps.session_store.save(instance.id, &record) {
        warn!(instance_id = instance.id, "failed to persist session record: {}", e);
    }
}

async fn record_technical_failure(
    instance: &Arc<Instance>,
    deps: &Arc<InstanceDeps>,
    reason: &str,
    initial: Option<u64>,
    final_: Option<u64>,
) {
    let now = Utc::now();
    *instance.last_attempt_at.write() = Some(now);
    note_init_failure(instance, reason.to_string());
    deps.stats.record_failure();

    let entry = VoteLogEntry {
        timestamp: now,
        instance_id: instance.id,
        instance_name: instance.name.clone(),
        time_of_click: now.to_rfc3339(),
        status: "failed".to_string(),
        voting_url: deps.worker_config.target_url.clone(),
        cooldown_message: String::new(),
        failure_type: "technical".to_string(),
        failure_reason: reason.to_string(),
        initial_vote_count: initial,
        final_vote_count: final_,
        vote_count_change: None,
        proxy_ip: String::new(),
        session_token: String::new(),
        click_attempts: 0,
        error_message: reason.to_string(),
        browser_closed: false,
    };
    if let Err(e) = deps.vote_log.append_attempt(entry).await {
        warn!(instance_id = instance.id, "failed to append vote log entry: {}", e);
    }

    let backoff = current_backoff(instance);
    instance.set_state(InstanceState::Cooldown);
    tokio::time::sleep(backoff).await;
}

fn cooldown_message(outcome: &Outcome) -> String {
    match outcome {
        Outcome::InstanceCooldown { message } | Outcome::GlobalHourlyLimit { message } => message.clone(),
        _ => String::new(),
    }
}

fn failure_reason(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Technical { reason } => reason.clone(),
        Outcome::InstanceCooldown { message } | Outcome::GlobalHourlyLimit { message } => message.clone(),
        Outcome::LoginRequired { button_text } => button_text.clone(),
        _ => String::new(),
    }
}

fn click_attempts(outcome: &Outcome) -> u32 {
    match outcome {
        Outcome::Success { click_attempts } | Outcome::SuccessUnverified { click_attempts } => *click_attempts,
        _ => 0,
    }
}

fn next_top_of_hour(now: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::Timelike;
    let floor = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    floor + chrono::Duration::hours(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let instance = Instance::new(1, "test", None);
        instance.consecutive_init_failures.store(1, Ordering::SeqCst);
        assert_eq!(current_backoff(&Arc::new(instance)), Duration::from_secs(30));
    }

    #[test]
    fn backoff_caps_at_300() {
        let instance = Arc::new(Instance::new(1, "test", None));
        instance.consecutive_init_failures.store(10, Ordering::SeqCst);
        assert_eq!(current_backoff(&instance), Duration::from_secs(300));
    }

    #[test]
    fn pause_is_edge_triggered() {
        let instance = Instance::new(1, "test", None);
        let mut rx = instance.pause_rx.clone();
        instance.set_paused(false);
        assert!(!rx.has_changed().unwrap_or(false));
        instance.set_paused(true);
        assert!(rx.has_changed().unwrap_or(false));
    }

    #[test]
    fn time_until_next_vote_zero_when_no_history() {
        let instance = Instance::new(1, "test", None);
        let signals = FleetSignals::default();
        let timing = instance.time_until_next_vote(
            Utc::now(),
            &signals,
            Duration::from_secs(300),
            Duration::from_secs(1860),
        );
        assert_eq!(timing.wait, Duration::ZERO);
        assert_eq!(timing.retry_type, "none");
    }

    #[test]
    fn time_until_next_vote_global_limit_applies_to_all() {
        let instance = Instance::new(1, "test", None);
        let signals = FleetSignals::default();
        let reactivation = Utc::now() + chrono::Duration::minutes(10);
        signals.trigger_global_limit(reactivation);
        let timing = instance.time_until_next_vote(
            Utc::now(),
            &signals,
            Duration::from_secs(300),
            Duration::from_secs(1860),
        );
        assert!(timing.wait > Duration::from_secs(500));
        assert_eq!(timing.retry_type, "global_hourly_limit");
    }
}
