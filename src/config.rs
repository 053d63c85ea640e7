//! Fleet configuration, read from the environment (§6 of the external
//! interface contract). No config file: unlike the desktop app this
//! replaces, the fleet scheduler runs headless and unattended, so every
//! knob is an env var with a documented default.

use std::time::Duration;

use crate::proxy::ProxyConfig;

fn default_sesstime() -> u16 {
    30
}

/// Top-level fleet configuration.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub target_url: String,
    pub proxy: ProxyConfig,

    pub retry_delay_technical: Duration,
    pub retry_delay_cooldown: Duration,
    pub session_scan_interval: Duration,
    pub browser_init_timeout: Duration,
    pub max_concurrent_browser_launches: usize,

    pub global_hourly_limit_patterns: Vec<String>,
    pub instance_cooldown_patterns: Vec<String>,
    /// Page text confirming a vote went through when the counter itself
    /// can't be read. Empty by default: absence of any failure marker is
    /// itself the safe signal, not a fabricated positive match.
    pub success_patterns: Vec<String>,
    /// Generic failure hints used only to produce a better diagnostic
    /// message on an otherwise-unexplained `Technical` outcome.
    pub failure_patterns: Vec<String>,

    pub enable_resource_blocking: bool,

    pub vote_button_selectors: Vec<String>,
    pub vote_count_selectors: Vec<String>,
    pub overlay_close_selectors: Vec<String>,
    pub login_button_selectors: Vec<String>,

    pub chrome_path: Option<String>,
    pub headless: bool,

    pub data_dir: std::path::PathBuf,
}

impl FleetConfig {
    /// Build from environment variables, falling back to the §6 defaults
    /// anywhere the variable is unset or unparsable.
    pub fn from_env() -> Result<Self, String> {
        let target_url = std::env::var("TARGET_URL")
            .map_err(|_| "TARGET_URL is required".to_string())?;

        let proxy_username = std::env::var("PROXY_USERNAME").unwrap_or_default();
        let proxy_password = std::env::var("PROXY_PASSWORD").unwrap_or_default();
        let proxy_zone = std::env::var("PROXY_ZONE").unwrap_or_else(|_| "sa".to_string());
        let sesstime = std::env::var("PROXY_SESSTIME")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_sesstime);

        let proxy = ProxyConfig {
            customer: proxy_username,
            password: proxy_password,
            country: proxy_zone,
            sesstime,
            ..crate::proxy::ProxyConfig::default()
        };

        Ok(Self {
            target_url,
            proxy,
            retry_delay_technical: env_duration_secs("RETRY_DELAY_TECHNICAL", 5 * 60),
            retry_delay_cooldown: env_duration_secs("RETRY_DELAY_COOLDOWN", 31 * 60),
            session_scan_interval: env_duration_secs("SESSION_SCAN_INTERVAL", 30),
            browser_init_timeout: env_duration_secs("BROWSER_INIT_TIMEOUT", 30),
            max_concurrent_browser_launches: std::env::var("MAX_CONCURRENT_BROWSER_LAUNCHES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            global_hourly_limit_patterns: env_pattern_list(
                "GLOBAL_HOURLY_LIMIT_PATTERNS",
                &["reactivated at", "hourly limit", "try again next hour"],
            ),
            instance_cooldown_patterns: env_pattern_list(
                "INSTANCE_COOLDOWN_PATTERNS",
                &["come back at your next voting time", "you have already voted"],
            ),
            success_patterns: env_pattern_list("SUCCESS_PATTERNS", &[]),
            failure_patterns: env_pattern_list(
                "FAILURE_PATTERNS",
                &["an error occurred", "vote not counted", "please try again later"],
            ),
            enable_resource_blocking: env_bool("ENABLE_RESOURCE_BLOCKING", true),
            vote_button_selectors: env_pattern_list(
                "VOTE_BUTTON_SELECTORS",
                &["button.vote-button", "button[data-action=vote]", ".btn-vote"],
            ),
            vote_count_selectors: env_pattern_list(
                "VOTE_COUNT_SELECTORS",
                &[".vote-count", "[data-vote-count]", "#voteCount"],
            ),
            overlay_close_selectors: env_pattern_list(
                "OVERLAY_CLOSE_SELECTORS",
                &[".modal-close", ".overlay-close", "button[aria-label=Close]"],
            ),
            login_button_selectors: env_pattern_list(
                "LOGIN_BUTTON_SELECTORS",
                &["a[href*=login]", ".login-button", "#loginBtn"],
            ),
            chrome_path: std::env::var("CHROME_PATH").ok(),
            headless: env_bool("HEADLESS", true),
            data_dir: std::env::var("DATA_DIR")
                .map(std::path::PathBuf::from)
                .unwrap_or_else(|_| std::path::PathBuf::from("./data")),
        })
    }
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn env_pattern_list(key: &str, default: &[&str]) -> Vec<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_else(|| default.iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_pattern_list_falls_back_to_default() {
        std::env::remove_var("SOME_UNSET_PATTERN_LIST");
        let patterns = env_pattern_list("SOME_UNSET_PATTERN_LIST", &["a", "b"]);
        assert_eq!(patterns, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn env_bool_parses_common_truthy_values() {
        std::env::set_var("FLEET_CONFIG_TEST_BOOL", "true");
        assert!(env_bool("FLEET_CONFIG_TEST_BOOL", false));
        std::env::set_var("FLEET_CONFIG_TEST_BOOL", "0");
        assert!(!env_bool("FLEET_CONFIG_TEST_BOOL", true));
        std::env::remove_var("FLEET_CONFIG_TEST_BOOL");
    }
}
