//! Pure classifier: maps a Browser Worker attempt's raw observations to a
//! closed `Outcome` taxonomy. No I/O, no clock, no randomness — same inputs
//! always produce the same outcome.

use serde::Serialize;

/// Closed taxonomy of attempt outcomes (spec §4.4, §4.8, §7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    LaunchLockTimeout,
    NavigationError,
    GlobalHourlyLimit { message: String },
    InstanceCooldown { message: String },
    Success { click_attempts: u32 },
    SuccessUnverified { click_attempts: u32 },
    Technical { reason: String },
    LoginRequired { button_text: String },
}

impl Outcome {
    /// The `failure_type` column recorded in the Vote Log for this outcome.
    /// Empty string for both success variants, matching the persisted
    /// format's "missing value is empty, not a literal" rule.
    pub fn failure_type(&self) -> &'static str {
        match self {
            Outcome::Success { .. } | Outcome::SuccessUnverified { .. } => "",
            Outcome::InstanceCooldown { .. } => "ip_cooldown",
            Outcome::GlobalHourlyLimit { .. } => "global_hourly_limit",
            Outcome::LoginRequired { .. } => "login_required",
            Outcome::Technical { .. }
            | Outcome::NavigationError
            | Outcome::LaunchLockTimeout => "technical",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. } | Outcome::SuccessUnverified { .. })
    }
}

/// Everything the classifier needs to decide; gathered by the Worker, never
/// fetched by the classifier itself.
pub struct ClassifyInput<'a> {
    pub initial_count: Option<u64>,
    pub final_count: Option<u64>,
    pub page_content: &'a str,
    pub button_still_visible_after_retries: bool,
    pub click_attempts: u32,
    /// Set when the Worker's browser driver itself reported a transport-level
    /// failure (closed target, invalid page state) rather than a page-level
    /// condition.
    pub transport_error: Option<&'a str>,
    pub login_button_text: Option<&'a str>,
    pub global_patterns: &'a [String],
    pub instance_cooldown_patterns: &'a [String],
    pub success_patterns: &'a [String],
    /// Generic failure hints used only to produce a more useful diagnostic
    /// message for an otherwise-unexplained `Technical` outcome — never
    /// consulted by the success path.
    pub failure_patterns: &'a [String],
}

/// First-match-wins decision table (spec §4.8).
pub fn classify(input: &ClassifyInput) -> Outcome {
    if input.transport_error.is_some() {
        return Outcome::Technical { reason: "browser transport closed".to_string() };
    }

    let delta = match (input.initial_count, input.final_count) {
        (Some(i), Some(f)) => Some(f as i64 - i as i64),
        _ => None,
    };

    if let Some(d) = delta {
        if d == 1 {
            return Outcome::Success { click_attempts: input.click_attempts };
        }
        if d > 1 {
            return Outcome::Success { click_attempts: input.click_attempts };
        }
        if d < 0 {
            return Outcome::Technical { reason: "counter went backwards".to_string() };
        }
    }

    let global_match = find_match(input.page_content, input.global_patterns);
    let cooldown_match = find_match(input.page_content, input.instance_cooldown_patterns);

    if input.initial_count.is_none() && input.final_count.is_none() {
        if let Some(m) = global_match {
            return Outcome::GlobalHourlyLimit { message: m };
        }
        if let Some(m) = cooldown_match {
            return Outcome::InstanceCooldown { message: m };
        }
    }

    // delta == 0 from here on (or unreadable counters that fell through above).
    if let Some(m) = global_match {
        return Outcome::GlobalHourlyLimit { message: m };
    }
    if let Some(m) = cooldown_match {
        return Outcome::InstanceCooldown { message: m };
    }
    if let Some(button_text) = input.login_button_text {
        return Outcome::LoginRequired { button_text: button_text.to_string() };
    }
    if input.button_still_visible_after_retries {
        return Outcome::Technical { reason: "click failed — overlay".to_string() };
    }
    if input.initial_count.is_none() && input.final_count.is_none() {
        return if find_match(input.page_content, input.success_patterns).is_some() {
            Outcome::SuccessUnverified { click_attempts: input.click_attempts }
        } else {
            Outcome::Technical { reason: "unverified, no message".to_string() }
        };
    }

    Outcome::Technical { reason: extract_diagnostic(input.page_content, input.failure_patterns) }
}

fn find_match(content: &str, patterns: &[String]) -> Option<String> {
    let lower = content.to_lowercase();
    patterns.iter().find(|p| lower.contains(&p.to_lowercase())).cloned()
}

/// Prefer a matched failure hint as the diagnostic reason — it's more useful
/// to an operator than a raw content dump — falling back to a trimmed
/// excerpt of the page when nothing configured matches.
fn extract_diagnostic(content: &str, failure_patterns: &[String]) -> String {
    if let Some(m) = find_match(content, failure_patterns) {
        return m;
    }
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return "no diagnostic text available".to_string();
    }
    trimmed.chars().take(200).collect()
}

/// The Login-Required Detection safeguard (spec §4.5). Not part of the pure
/// decision table above — it decides *whether* `login_button_text` is even
/// passed to `classify`, since it depends on wall-clock time.
pub fn login_marker_is_transient(
    browser_opened_at: chrono::DateTime<chrono::Utc>,
    now: chrono::DateTime<chrono::Utc>,
    vote_count: u64,
) -> bool {
    let elapsed = now.signed_duration_since(browser_opened_at);
    elapsed < chrono::Duration::seconds(30) && vote_count > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(initial: Option<u64>, final_: Option<u64>) -> ClassifyInput<'static> {
        ClassifyInput {
            initial_count: initial,
            final_count: final_,
            page_content: "",
            button_still_visible_after_retries: false,
            click_attempts: 1,
            transport_error: None,
            login_button_text: None,
            global_patterns: &[],
            instance_cooldown_patterns: &[],
            success_patterns: &[],
            failure_patterns: &[],
        }
    }

    #[test]
    fn delta_one_is_success() {
        let i = input(Some(100), Some(101));
        assert_eq!(classify(&i), Outcome::Success { click_attempts: 1 });
    }

    #[test]
    fn delta_negative_is_technical() {
        let i = input(Some(100), Some(99));
        assert_eq!(classify(&i), Outcome::Technical { reason: "counter went backwards".to_string() });
    }

    #[test]
    fn transport_error_wins_over_everything() {
        let mut i = input(Some(100), Some(101));
        i.transport_error = Some("target closed");
        assert_eq!(classify(&i), Outcome::Technical { reason: "browser transport closed".to_string() });
    }

    #[test]
    fn unreadable_counters_with_global_pattern_escalates() {
        let patterns = vec!["reactivated at".to_string()];
        let mut i = input(None, None);
        i.page_content = "The voting button will be reactivated at 04:00 AM.";
        i.global_patterns = &patterns;
        assert_eq!(
            classify(&i),
            Outcome::GlobalHourlyLimit { message: "reactivated at".to_string() }
        );
    }

    #[test]
    fn unreadable_counters_never_escalate_ambiguous_marker_to_global() {
        // No pattern matches at all: falls through to unverified/technical,
        // never GlobalHourlyLimit, per spec step 5's "never escalate" rule.
        let i = input(None, None);
        assert_eq!(classify(&i), Outcome::Technical { reason: "unverified, no message".to_string() });
    }

    #[test]
    fn delta_zero_with_cooldown_pattern() {
        let patterns = vec!["come back at your next voting time".to_string()];
        let mut i = input(Some(10), Some(10));
        i.page_content = "You have already voted! Please come back at your next voting time of 30 minutes.";
        i.instance_cooldown_patterns = &patterns;
        assert_eq!(
            classify(&i),
            Outcome::InstanceCooldown { message: "come back at your next voting time".to_string() }
        );
    }

    #[test]
    fn delta_zero_login_button_present() {
        let mut i = input(Some(10), Some(10));
        i.login_button_text = Some("Login with Google");
        assert_eq!(
            classify(&i),
            Outcome::LoginRequired { button_text: "Login with Google".to_string() }
        );
    }

    #[test]
    fn delta_zero_button_still_visible_is_technical_overlay() {
        let mut i = input(Some(10), Some(10));
        i.button_still_visible_after_retries = true;
        assert_eq!(classify(&i), Outcome::Technical { reason: "click failed — overlay".to_string() });
    }

    #[test]
    fn success_unverified_requires_success_marker() {
        let patterns = vec!["thank you for voting".to_string()];
        let mut i = input(None, None);
        i.page_content = "Thank you for voting!";
        i.success_patterns = &patterns;
        assert_eq!(classify(&i), Outcome::SuccessUnverified { click_attempts: 1 });
    }

    #[test]
    fn login_marker_transient_safeguard() {
        let opened = chrono::Utc::now();
        let now = opened + chrono::Duration::seconds(5);
        assert!(login_marker_is_transient(opened, now, 7));
        assert!(!login_marker_is_transient(opened, now, 0));

        let later = opened + chrono::Duration::seconds(45);
        assert!(!login_marker_is_transient(opened, later, 7));
    }

    #[test]
    fn unexplained_delta_zero_prefers_failure_pattern_diagnostic() {
        let patterns = vec!["an error occurred".to_string()];
        let mut i = input(Some(10), Some(10));
        i.page_content = "Oops, an error occurred while processing your vote.";
        i.failure_patterns = &patterns;
        assert_eq!(classify(&i), Outcome::Technical { reason: "an error occurred".to_string() });
    }

    #[test]
    fn failure_type_empty_for_success_variants() {
        assert_eq!(Outcome::Success { click_attempts: 1 }.failure_type(), "");
        assert_eq!(Outcome::SuccessUnverified { click_attempts: 1 }.failure_type(), "");
        assert_eq!(Outcome::InstanceCooldown { message: String::new() }.failure_type(), "ip_cooldown");
    }
}
