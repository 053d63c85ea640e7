//! Browser Worker: runs exactly one vote attempt end to end and returns an
//! `Outcome`. Never propagates a `BrowserError` past its own boundary —
//! every failure path is translated into an `Outcome` variant instead.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::classifier::{classify, login_marker_is_transient, ClassifyInput, Outcome};

use super::registry::ActiveBrowsers;
use super::session::{BrowserSession, BrowserSessionConfig};
use super::BrowserError;

const STABILIZE_PAUSE: Duration = Duration::from_secs(3);
const NAVIGATION_TIMEOUT_SECS: u64 = 15;
const POST_CLICK_PAUSE: Duration = Duration::from_secs(3);
const OVERLAY_GENERIC_CLOSE_CAP: u32 = 2;
const MAX_VOTE_ATTEMPTS: u32 = 3;

/// Selector priority lists and content patterns the Worker needs; supplied
/// by configuration, never hard-coded to one target site.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub target_url: String,
    pub vote_button_selectors: Vec<String>,
    pub vote_count_selectors: Vec<String>,
    pub overlay_close_selectors: Vec<String>,
    pub login_button_selectors: Vec<String>,
    pub global_hourly_limit_patterns: Vec<String>,
    pub instance_cooldown_patterns: Vec<String>,
    pub success_patterns: Vec<String>,
    pub failure_patterns: Vec<String>,
    pub launch_timeout_secs: u64,
    pub headless: bool,
    pub block_resources: bool,
    pub chrome_path: Option<String>,
}

/// Everything specific to one instance's attempt.
pub struct WorkerAttempt {
    pub instance_id: u32,
    pub storage_dir: PathBuf,
    pub proxy_url: Option<String>,
    /// The instance's vote count going into this attempt — needed by the
    /// Login-Required Detection safeguard.
    pub vote_count_before: u64,
}

pub struct WorkerResult {
    pub outcome: Outcome,
    pub initial_count: Option<u64>,
    pub final_count: Option<u64>,
    pub browser_opened_at: Option<DateTime<Utc>>,
}

/// Run one full vote attempt. Acquires a launch-budget permit up front and
/// holds it for the lifetime of the browser; never waits longer than
/// `config.launch_timeout_secs` for that permit.
pub async fn run(
    launch_budget: &Arc<Semaphore>,
    active_browsers: &Arc<ActiveBrowsers>,
    config: &WorkerConfig,
    attempt: WorkerAttempt,
) -> WorkerResult {
    let permit = match tokio::time::timeout(
        Duration::from_secs(config.launch_timeout_secs),
        launch_budget.clone().acquire_owned(),
    )
    .await
    {
        Ok(Ok(permit)) => permit,
        _ => {
            return WorkerResult {
                outcome: Outcome::LaunchLockTimeout,
                initial_count: None,
                final_count: None,
                browser_opened_at: None,
            };
        }
    };

    let result = run_with_permit(active_browsers, config, attempt).await;
    drop(permit);
    result
}

async fn run_with_permit(
    active_browsers: &Arc<ActiveBrowsers>,
    config: &WorkerConfig,
    attempt: WorkerAttempt,
) -> WorkerResult {
    let session_config = BrowserSessionConfig::for_instance(attempt.storage_dir.to_string_lossy().to_string())
        .headless(config.headless)
        .proxy(attempt.proxy_url.clone())
        .chrome_path(config.chrome_path.clone())
        .block_resources(config.block_resources);

    let session = match BrowserSession::new(session_config).await {
        Ok(s) => s,
        Err(e) => {
            warn!("instance {} browser launch failed: {}", attempt.instance_id, e);
            return WorkerResult {
                outcome: Outcome::Technical { reason: format!("launch failed: {e}") },
                initial_count: None,
                final_count: None,
                browser_opened_at: None,
            };
        }
    };
    let browser_opened_at = Utc::now();
    let cancel = active_browsers.register(attempt.instance_id);

    let result = run_attempt(&session, config, &attempt, browser_opened_at, &cancel).await;
    active_browsers.unregister(attempt.instance_id);
    let _ = session.close().await;

    WorkerResult {
        outcome: result.0,
        initial_count: result.1,
        final_count: result.2,
        browser_opened_at: Some(browser_opened_at),
    }
}

async fn run_attempt(
    session: &BrowserSession,
    config: &WorkerConfig,
    attempt: &WorkerAttempt,
    browser_opened_at: DateTime<Utc>,
    cancel: &Arc<AtomicBool>,
) -> (Outcome, Option<u64>, Option<u64>) {
    macro_rules! bail_if_cancelled {
        () => {
            if cancel.load(Ordering::SeqCst) {
                return (Outcome::Technical { reason: "force-closed by janitor".to_string() }, None, None);
            }
        };
    }

    tokio::time::sleep(STABILIZE_PAUSE).await;
    bail_if_cancelled!();

    let navigated = tokio::time::timeout(
        Duration::from_secs(NAVIGATION_TIMEOUT_SECS),
        session.navigate(&config.target_url),
    )
    .await;
    match navigated {
        Ok(Ok(())) => {}
        _ => return (Outcome::NavigationError, None, None),
    }

    let landing_content = match session.read_content(NAVIGATION_TIMEOUT_SECS).await {
        Ok(c) => c,
        Err(_) => return (Outcome::NavigationError, None, None),
    };

    if let Some(message) = find_pattern(&landing_content, &config.global_hourly_limit_patterns) {
        return (Outcome::GlobalHourlyLimit { message }, None, None);
    }
    if let Some(message) = find_pattern(&landing_content, &config.instance_cooldown_patterns) {
        return (Outcome::InstanceCooldown { message }, None, None);
    }

    clear_overlays(session, &config.overlay_close_selectors).await;
    bail_if_cancelled!();

    let initial_count = read_vote_count(session, &config.vote_count_selectors).await;

    let mut click_attempts = 0u32;
    let mut final_count = None;
    let mut button_still_visible = false;

    for attempt_no in 1..=MAX_VOTE_ATTEMPTS {
        bail_if_cancelled!();
        let clicked = click_first_match(session, &config.vote_button_selectors).await;
        if !clicked {
            if attempt_no == 1 {
                return (
                    Outcome::Technical { reason: "vote button not found".to_string() },
                    initial_count,
                    None,
                );
            }
            break;
        }
        click_attempts += 1;

        tokio::time::sleep(POST_CLICK_PAUSE).await;

        final_count = read_vote_count(session, &config.vote_count_selectors).await;

        let delta = match (initial_count, final_count) {
            (Some(i), Some(f)) => Some(f as i64 - i as i64),
            _ => None,
        };
        if matches!(delta, Some(d) if d >= 1) {
            button_still_visible = false;
            break;
        }

        button_still_visible = button_is_visible(session, &config.vote_button_selectors).await;
        if !button_still_visible {
            break;
        }
        clear_overlays(session, &config.overlay_close_selectors).await;
    }

    let content_after = session.read_content(NAVIGATION_TIMEOUT_SECS).await.unwrap_or_default();

    // §4.5: login detection fires after a failed attempt with an unchanged
    // counter, not before the vote is even attempted — otherwise a login
    // prompt that's only ever shown transiently on page load would wrongly
    // pre-empt every other outcome.
    let login_button_text = match find_visible_login_button(session, &config.login_button_selectors).await {
        Some(text) => {
            let now = Utc::now();
            if login_marker_is_transient(browser_opened_at, now, attempt.vote_count_before) {
                debug!(
                    "instance {} saw a transient login marker, not escalating",
                    attempt.instance_id
                );
                None
            } else {
                Some(text)
            }
        }
        None => None,
    };

    let input = ClassifyInput {
        initial_count,
        final_count,
        page_content: &content_after,
        button_still_visible_after_retries: button_still_visible,
        click_attempts,
        transport_error: None,
        login_button_text: login_button_text.as_deref(),
        global_patterns: &config.global_hourly_limit_patterns,
        instance_cooldown_patterns: &config.instance_cooldown_patterns,
        success_patterns: &config.success_patterns,
        failure_patterns: &config.failure_patterns,
    };

    (classify(&input), initial_count, final_count)
}

/// Four Escapes, then site-specific close buttons, then generic close
/// buttons capped at two attempts per selector, then two more Escapes.
async fn clear_overlays(session: &BrowserSession, overlay_close_selectors: &[String]) {
    for _ in 0..4 {
        let _ = session.press_key("Escape").await;
    }
    for selector in overlay_close_selectors {
        let mut remaining = OVERLAY_GENERIC_CLOSE_CAP;
        while remaining > 0 {
            match session.try_click(selector).await {
                Ok(true) => remaining -= 1,
                _ => break,
            }
        }
    }
    for _ in 0..2 {
        let _ = session.press_key("Escape").await;
    }
}

async fn click_first_match(session: &BrowserSession, selectors: &[String]) -> bool {
    for selector in selectors {
        if let Ok(true) = session.try_click(selector).await {
            return true;
        }
    }
    false
}

async fn button_is_visible(session: &BrowserSession, selectors: &[String]) -> bool {
    for selector in selectors {
        let script = format!(
            r#"(() => {{ const el = document.querySelector({sel}); return !!el && el.offsetParent !== null; }})()"#,
            sel = serde_json::to_string(selector).unwrap_or_default()
        );
        if let Ok(value) = session.execute_js(&script).await {
            if value.as_bool().unwrap_or(false) {
                return true;
            }
        }
    }
    false
}

async fn find_visible_login_button(session: &BrowserSession, selectors: &[String]) -> Option<String> {
    for selector in selectors {
        let script = format!(
            r#"(() => {{ const el = document.querySelector({sel}); return (el && el.offsetParent !== null) ? el.innerText : null; }})()"#,
            sel = serde_json::to_string(selector).unwrap_or_default()
        );
        if let Ok(value) = session.execute_js(&script).await {
            if let Some(text) = value.as_str() {
                return Some(text.to_string());
            }
        }
    }
    None
}

/// Read the first integer found via the selector priority list, stripping
/// thousand-separator commas/periods/spaces. `None` when no selector
/// resolves to a parseable number.
async fn read_vote_count(session: &BrowserSession, selectors: &[String]) -> Option<u64> {
    for selector in selectors {
        let script = format!(
            r#"(() => {{ const el = document.querySelector({sel}); return el ? el.innerText : null; }})()"#,
            sel = serde_json::to_string(selector).unwrap_or_default()
        );
        if let Ok(value) = session.execute_js(&script).await {
            if let Some(text) = value.as_str() {
                if let Some(n) = parse_leading_integer(text) {
                    return Some(n);
                }
            }
        }
    }
    None
}

fn parse_leading_integer(text: &str) -> Option<u64> {
    let digits: String = text
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn find_pattern(content: &str, patterns: &[String]) -> Option<String> {
    let lower = content.to_lowercase();
    patterns.iter().find(|p| lower.contains(&p.to_lowercase())).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_leading_integer_strips_separators() {
        assert_eq!(parse_leading_integer("1,234 votes"), Some(1234));
        assert_eq!(parse_leading_integer("12.345"), Some(12345));
        assert_eq!(parse_leading_integer("no digits here"), None);
        assert_eq!(parse_leading_integer(""), None);
    }

    #[test]
    fn find_pattern_is_case_insensitive() {
        let patterns = vec!["Come Back Later".to_string()];
        assert_eq!(
            find_pattern("please come back later, thanks", &patterns),
            Some("Come Back Later".to_string())
        );
        assert_eq!(find_pattern("nothing matches", &patterns), None);
    }
}
