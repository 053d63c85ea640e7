//! Fleet Scheduler: owns the set of `Instance`s, the shared launch budget,
//! the active-browser registry, and the background tasks that aren't any
//! one instance's responsibility — auto-unpause, hourly-limit expiry, and
//! the browser janitor. No instance ever reaches back into this module;
//! everything it needs is handed down through `InstanceDeps`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::browser::{ActiveBrowsers, WorkerConfig};
use crate::config::FleetConfig;
use crate::instance::{FleetSignals, Instance, InstanceDeps, InstanceSnapshot};
use crate::proxy::ProxyAllocator;
use crate::session_store::SessionStore;
use crate::stats::FleetStats;
use crate::votelog::VoteLog;

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
const JANITOR_GLOBAL_LIMIT_GRACE: Duration = Duration::from_secs(60);

pub struct FleetState {
    pub instances: HashMap<u32, Arc<Instance>>,
    pub deps: Arc<InstanceDeps>,
    pub stats: Arc<FleetStats>,
    background: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    instance_handles: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl FleetState {
    /// §4.9 startup restoration: load every stored session record, build an
    /// `Instance` for each, replay the vote log forward so vote_count/
    /// last_success_at reflect everything on disk before any new attempt
    /// runs.
    pub async fn bootstrap(config: FleetConfig, names: &HashMap<u32, String>) -> Arc<Self> {
        let session_store = Arc::new(SessionStore::new(config.data_dir.join("sessions")));
        let vote_log = Arc::new(VoteLog::new(config.data_dir.join("logs").join("votes.csv")));
        let proxy = Arc::new(ProxyAllocator::new(config.proxy.clone(), session_store.clone()));

        let worker_config = Arc::new(WorkerConfig {
            target_url: config.target_url.clone(),
            vote_button_selectors: config.vote_button_selectors.clone(),
            vote_count_selectors: config.vote_count_selectors.clone(),
            overlay_close_selectors: config.overlay_close_selectors.clone(),
            login_button_selectors: config.login_button_selectors.clone(),
            global_hourly_limit_patterns: config.global_hourly_limit_patterns.clone(),
            instance_cooldown_patterns: config.instance_cooldown_patterns.clone(),
            success_patterns: config.success_patterns.clone(),
            failure_patterns: config.failure_patterns.clone(),
            launch_timeout_secs: config.browser_init_timeout.as_secs(),
            headless: config.headless,
            block_resources: config.enable_resource_blocking,
            chrome_path: config.chrome_path.clone(),
        });

        let stats = Arc::new(FleetStats::new());

        let deps = Arc::new(InstanceDeps {
            vote_log: vote_log.clone(),
            session_store: session_store.clone(),
            proxy,
            launch_budget: Arc::new(Semaphore::new(config.max_concurrent_browser_launches)),
            active_browsers: Arc::new(ActiveBrowsers::new()),
            worker_config,
            fleet_signals: Arc::new(FleetSignals::default()),
            stats: stats.clone(),
            retry_delay_technical: config.retry_delay_technical,
            retry_delay_cooldown: config.retry_delay_cooldown,
            session_scan_interval: config.session_scan_interval,
        });

        let mut stored_ids = session_store.list_ids().unwrap_or_default();
        for id in names.keys() {
            if !stored_ids.contains(id) {
                stored_ids.push(*id);
            }
        }
        stored_ids.sort_unstable();

        let mut instances = HashMap::new();
        for id in stored_ids {
            let record = session_store.load(id).unwrap_or(None);
            let name = names.get(&id).cloned().unwrap_or_else(|| format!("instance-{id}"));
            instances.insert(id, Arc::new(Instance::new(id, name, record.as_ref())));
        }

        // Vote-count is authoritative from the Session Store (already loaded
        // above); last_success_at is authoritative from the Vote Log, since
        // it is written before the session record on every success.
        if let Ok(entries) = vote_log.read_all() {
            for entry in entries {
                if entry.status == "success" {
                    if let Some(instance) = instances.get(&entry.instance_id) {
                        let current = instance.last_success_at();
                        if current.map(|c| entry.timestamp > c).unwrap_or(true) {
                            instance.set_last_success_at(entry.timestamp);
                        }
                    }
                }
            }
        }

        stats.set_active_instances(instances.len() as u64);

        Arc::new(Self {
            instances,
            deps,
            stats,
            background: tokio::sync::Mutex::new(Vec::new()),
            instance_handles: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Spawn the per-instance attempt loops and the fleet-wide background
    /// tasks. Only one eligible instance is ever launched at a time at
    /// startup: each loop independently waits on its own
    /// `time_until_next_vote`, so there is no separate "launch one per scan"
    /// step beyond what the launch-budget semaphore already enforces.
    pub fn spawn(self: &Arc<Self>) {
        let mut instance_handles = Vec::new();
        for instance in self.instances.values() {
            let instance = instance.clone();
            let deps = self.deps.clone();
            let storage_dir = deps.session_store.storage_state_path(instance.id);
            instance_handles.push(tokio::spawn(crate::instance::run(instance, deps, storage_dir)));
        }

        let mut background = Vec::new();
        background.push(tokio::spawn(auto_unpause_task(self.clone())));
        background.push(tokio::spawn(global_limit_expiry_task(self.clone())));
        background.push(tokio::spawn(browser_janitor_task(self.clone())));

        if let Ok(mut guard) = self.instance_handles.try_lock() {
            *guard = instance_handles;
        }
        if let Ok(mut guard) = self.background.try_lock() {
            *guard = background;
        }
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        let mut instances: Vec<InstanceSnapshot> = self.instances.values().map(|i| i.snapshot()).collect();
        instances.sort_by_key(|s| s.id);
        FleetSnapshot {
            instances,
            global_hourly_limit_active: self.deps.fleet_signals.is_active(),
            global_reactivation_at: *self.deps.fleet_signals.global_reactivation_at.read(),
            stats: self.stats.snapshot(),
        }
    }

    pub fn time_until_next_vote(&self, id: u32) -> Option<NextVoteInfo> {
        self.instances.get(&id).map(|instance| {
            let now = Utc::now();
            let timing = instance.time_until_next_vote(
                now,
                &self.deps.fleet_signals,
                self.deps.retry_delay_technical,
                self.deps.retry_delay_cooldown,
            );
            NextVoteInfo {
                seconds_remaining: timing.wait.as_secs(),
                retry_type: timing.retry_type,
                next_vote_at: now + chrono::Duration::from_std(timing.wait).unwrap_or_default(),
            }
        })
    }

    /// §5 restart semantics: request the running browser (if any) close
    /// within a grace period, then rely on the instance loop to relaunch on
    /// its own next iteration.
    pub async fn restart(&self, id: u32) -> bool {
        let Some(_instance) = self.instances.get(&id) else { return false };
        let closed = self.deps.active_browsers.force_close(id);
        if closed {
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        true
    }

    pub fn force_close_browser(&self, id: u32) -> bool {
        self.deps.active_browsers.force_close(id)
    }

    pub fn list_login_required(&self) -> Vec<u32> {
        self.instances
            .values()
            .filter(|i| i.is_excluded())
            .map(|i| i.id)
            .collect()
    }

    pub fn list_open_browsers(&self) -> Vec<(u32, chrono::DateTime<Utc>)> {
        self.deps.active_browsers.list_open()
    }

    pub fn set_paused(&self, id: u32, paused: bool) -> bool {
        match self.instances.get(&id) {
            Some(instance) => {
                instance.set_paused(paused);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FleetSnapshot {
    pub instances: Vec<InstanceSnapshot>,
    pub global_hourly_limit_active: bool,
    pub global_reactivation_at: Option<chrono::DateTime<Utc>>,
    pub stats: crate::stats::FleetStatsSnapshot,
}

/// §6 `time_until_next_vote` response shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct NextVoteInfo {
    pub seconds_remaining: u64,
    pub retry_type: &'static str,
    pub next_vote_at: chrono::DateTime<Utc>,
}

/// Unpauses at most one instance per pass, and only while the global hourly
/// limit is not active (spec §4.7). Eligibility is gated on the instance's
/// own `time_until_next_vote` being zero — a manually paused instance whose
/// cooldown hasn't elapsed yet, or one paused deliberately via the web API,
/// is left alone rather than unpaused on the next tick regardless of state.
async fn auto_unpause_task(fleet: Arc<FleetState>) {
    let interval = fleet.deps.session_scan_interval.max(Duration::from_secs(1));
    loop {
        tokio::time::sleep(interval).await;

        if fleet.deps.fleet_signals.is_active() {
            continue;
        }

        let now = Utc::now();
        let mut ids: Vec<u32> = fleet
            .instances
            .values()
            .filter(|i| {
                i.is_paused()
                    && !i.is_excluded()
                    && i.time_until_next_vote(
                        now,
                        &fleet.deps.fleet_signals,
                        fleet.deps.retry_delay_technical,
                        fleet.deps.retry_delay_cooldown,
                    )
                    .wait
                        == Duration::ZERO
            })
            .map(|i| i.id)
            .collect();
        ids.sort_unstable();

        if let Some(id) = ids.first() {
            if let Some(instance) = fleet.instances.get(id) {
                info!(instance_id = id, "auto-unpausing");
                instance.set_paused(false);
            }
        }
    }
}

/// Clears the global hourly-limit flag once its reactivation time has
/// passed. Deliberately does not resume multiple instances at once: each
/// instance's own loop notices the cleared flag independently.
async fn global_limit_expiry_task(fleet: Arc<FleetState>) {
    let interval = fleet.deps.session_scan_interval.max(Duration::from_secs(1));
    loop {
        tokio::time::sleep(interval).await;

        if !fleet.deps.fleet_signals.is_active() {
            continue;
        }
        let reactivation = *fleet.deps.fleet_signals.global_reactivation_at.read();
        if let Some(reactivation) = reactivation {
            if Utc::now() >= reactivation {
                info!("global hourly limit window elapsed, clearing");
                fleet.deps.fleet_signals.clear_global_limit();
            }
        }
    }
}

/// Force-closes browsers for instances that have been open too long while
/// the global limit is active and they have no real chance of making
/// progress (spec §4.7).
async fn browser_janitor_task(fleet: Arc<FleetState>) {
    loop {
        tokio::time::sleep(JANITOR_INTERVAL).await;

        if !fleet.deps.fleet_signals.is_active() {
            continue;
        }
        let now = Utc::now();
        for (id, opened_at) in fleet.deps.active_browsers.list_open() {
            let age = now.signed_duration_since(opened_at).to_std().unwrap_or_default();
            if age >= JANITOR_GLOBAL_LIMIT_GRACE {
                warn!(instance_id = id, "janitor force-closing long-open browser during global limit");
                fleet.deps.active_browsers.force_close(id);
                fleet.stats.record_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_with_no_stored_sessions_creates_named_instances() {
        let dir = std::env::temp_dir().join(format!("fleet-test-{}", uuid::Uuid::new_v4()));
        let config = FleetConfig {
            target_url: "https://example.com/vote".to_string(),
            proxy: crate::proxy::ProxyConfig::default(),
            retry_delay_technical: Duration::from_secs(5),
            retry_delay_cooldown: Duration::from_secs(10),
            session_scan_interval: Duration::from_secs(1),
            browser_init_timeout: Duration::from_secs(5),
            max_concurrent_browser_launches: 1,
            global_hourly_limit_patterns: vec![],
            instance_cooldown_patterns: vec![],
            success_patterns: vec![],
            failure_patterns: vec![],
            enable_resource_blocking: true,
            vote_button_selectors: vec![],
            vote_count_selectors: vec![],
            overlay_close_selectors: vec![],
            login_button_selectors: vec![],
            chrome_path: None,
            headless: true,
            data_dir: dir,
        };
        let mut names = HashMap::new();
        names.insert(1, "alpha".to_string());
        names.insert(2, "beta".to_string());

        let fleet = FleetState::bootstrap(config, &names).await;
        assert_eq!(fleet.instances.len(), 2);
        assert_eq!(fleet.instances.get(&1).unwrap().name, "alpha");
    }
}
