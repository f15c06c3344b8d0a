//! Magic-link access policy.
//!
//! The identity provider sends the e-mail and owns the session; this module
//! only decides whether a link may be requested, and tracks per-address
//! throttling and lockout.

use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::models::SecuritySettings;

pub const REGISTRATION_CODE_LENGTH: usize = 4;
pub const MIN_SETTINGS_CODE_LENGTH: usize = 4;
pub const LINK_INTERVAL_SECONDS: i64 = 60;
pub const MAX_FAILED_ATTEMPTS: i32 = 3;
pub const LOCKOUT_MINUTES: i64 = 5;

const LOCALHOST_FALLBACK: &str = "http://localhost:3000";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AccessError {
    #[error("an e-mail address is required")]
    EmailRequired,

    #[error("a registration code is required to sign up")]
    CodeRequired,

    #[error("the registration code is not correct")]
    InvalidCode,

    #[error("e-mail domain {0:?} is not allowed")]
    DomainNotAllowed(String),

    #[error("the registration code must be exactly 4 characters")]
    MalformedCode,

    #[error("too many failed attempts, try again in {0} seconds")]
    Locked(i64),

    #[error("a link was sent recently, try again in {0} seconds")]
    Throttled(i64),
}

impl AccessError {
    /// Whether this rejection counts toward the lockout.
    pub fn is_failed_attempt(&self) -> bool {
        matches!(
            self,
            AccessError::CodeRequired | AccessError::InvalidCode | AccessError::DomainNotAllowed(_)
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("invalid domain format: {0}")]
    InvalidDomain(String),

    #[error("registration code must be at least 4 characters")]
    CodeTooShort,

    #[error("nothing to update")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    Login,
    Registration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessGrant {
    pub kind: LinkKind,
    pub create_user: bool,
    pub redirect_to: String,
}

pub fn email_domain(email: &str) -> Option<&str> {
    email.split('@').nth(1)
}

/// Existing users always get a login link; new users need the registration
/// code and an allow-listed domain.
pub fn decide_access(
    email: &str,
    code: Option<&str>,
    settings: &SecuritySettings,
    existing_user: bool,
    site_url: &str,
) -> Result<AccessGrant, AccessError> {
    if email.trim().is_empty() {
        return Err(AccessError::EmailRequired);
    }

    let redirect_to = format!("{}/auth/callback", site_url.trim_end_matches('/'));

    if existing_user {
        return Ok(AccessGrant {
            kind: LinkKind::Login,
            create_user: false,
            redirect_to,
        });
    }

    let code = code.filter(|code| !code.is_empty()).ok_or(AccessError::CodeRequired)?;
    if code != settings.registration_code {
        return Err(AccessError::InvalidCode);
    }

    let domain = email_domain(email).unwrap_or_default();
    if !settings.allowed_domains.iter().any(|allowed| allowed == domain) {
        return Err(AccessError::DomainNotAllowed(domain.to_string()));
    }

    Ok(AccessGrant {
        kind: LinkKind::Registration,
        create_user: true,
        redirect_to,
    })
}

pub fn verify_registration_code(candidate: &str, expected: &str) -> Result<bool, AccessError> {
    if candidate.chars().count() != REGISTRATION_CODE_LENGTH {
        return Err(AccessError::MalformedCode);
    }
    Ok(candidate == expected)
}

/// Picks the public base URL the callback link points at.
pub fn resolve_site_url(
    site_url: Option<&str>,
    vercel_env: Option<&str>,
    vercel_url: Option<&str>,
) -> String {
    let vercel_url = vercel_url.filter(|url| !url.is_empty());
    let site_url = site_url.filter(|url| !url.is_empty());

    match (vercel_env, vercel_url, site_url) {
        (Some("preview"), Some(host), _) => format!("https://{host}"),
        (_, _, Some(url)) => url.to_string(),
        (_, Some(host), None) => format!("https://{host}"),
        _ => LOCALHOST_FALLBACK.to_string(),
    }
}

fn domain_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z]{2,})+$")
            .expect("domain pattern compiles")
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsUpdate {
    pub allowed_domains: Option<Vec<String>>,
    pub registration_code: Option<String>,
}

impl SettingsUpdate {
    /// Validates the payload and returns it with the code trimmed.
    pub fn validated(self) -> Result<SettingsUpdate, SettingsError> {
        if self.allowed_domains.is_none() && self.registration_code.is_none() {
            return Err(SettingsError::Empty);
        }

        if let Some(domains) = &self.allowed_domains {
            if let Some(bad) = domains.iter().find(|domain| !domain_pattern().is_match(domain)) {
                return Err(SettingsError::InvalidDomain(bad.clone()));
            }
        }

        let registration_code = match self.registration_code {
            Some(code) => {
                let trimmed = code.trim();
                if trimmed.chars().count() < MIN_SETTINGS_CODE_LENGTH {
                    return Err(SettingsError::CodeTooShort);
                }
                Some(trimmed.to_string())
            }
            None => None,
        };

        Ok(SettingsUpdate {
            allowed_domains: self.allowed_domains,
            registration_code,
        })
    }
}

/// Per-address throttle and lockout state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptState {
    pub attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_link_sent_at: Option<DateTime<Utc>>,
}

fn ceil_seconds(duration: Duration) -> i64 {
    let millis = duration.num_milliseconds();
    (millis + 999).div_euclid(1000)
}

impl AttemptState {
    /// Drops an expired lock together with its attempt counter.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        if matches!(self.locked_until, Some(until) if until <= now) {
            self.attempts = 0;
            self.locked_until = None;
        }
    }

    pub fn lock_remaining(&self, now: DateTime<Utc>) -> i64 {
        match self.locked_until {
            Some(until) if until > now => ceil_seconds(until - now),
            _ => 0,
        }
    }

    pub fn link_cooldown(&self, now: DateTime<Utc>) -> i64 {
        match self.last_link_sent_at {
            Some(sent) => (LINK_INTERVAL_SECONDS - (now - sent).num_seconds()).max(0),
            None => 0,
        }
    }

    /// Fails with the first gate that is closed: lockout, then send interval.
    pub fn check(&self, now: DateTime<Utc>) -> Result<(), AccessError> {
        match self.lock_remaining(now) {
            0 => {}
            remaining => return Err(AccessError::Locked(remaining)),
        }
        match self.link_cooldown(now) {
            0 => Ok(()),
            remaining => Err(AccessError::Throttled(remaining)),
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        if self.attempts >= MAX_FAILED_ATTEMPTS {
            self.locked_until = Some(now + Duration::minutes(LOCKOUT_MINUTES));
        }
    }

    pub fn record_sent(&mut self, now: DateTime<Utc>) {
        self.attempts = 0;
        self.locked_until = None;
        self.last_link_sent_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings() -> SecuritySettings {
        SecuritySettings {
            allowed_domains: vec!["fieldcrew.jp".to_string(), "example.com".to_string()],
            registration_code: "4821".to_string(),
            updated_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn existing_user_needs_no_code() {
        let grant = decide_access("old@anywhere.net", None, &settings(), true, "https://app.test/").unwrap();
        assert_eq!(grant.kind, LinkKind::Login);
        assert!(!grant.create_user);
        assert_eq!(grant.redirect_to, "https://app.test/auth/callback");
    }

    #[test]
    fn new_user_rules_apply_in_order() {
        let s = settings();
        let site = "http://localhost:3000";
        assert_eq!(decide_access("", None, &s, false, site), Err(AccessError::EmailRequired));
        assert_eq!(
            decide_access("new@example.com", None, &s, false, site),
            Err(AccessError::CodeRequired)
        );
        assert_eq!(
            decide_access("new@example.com", Some("0000"), &s, false, site),
            Err(AccessError::InvalidCode)
        );
        assert_eq!(
            decide_access("new@gmail.com", Some("4821"), &s, false, site),
            Err(AccessError::DomainNotAllowed("gmail.com".to_string()))
        );
        let grant = decide_access("new@fieldcrew.jp", Some("4821"), &s, false, site).unwrap();
        assert_eq!(grant.kind, LinkKind::Registration);
        assert!(grant.create_user);
    }

    #[test]
    fn verify_code_checks_length_first() {
        assert_eq!(verify_registration_code("123", "4821"), Err(AccessError::MalformedCode));
        assert_eq!(verify_registration_code("12345", "4821"), Err(AccessError::MalformedCode));
        assert_eq!(verify_registration_code("1234", "4821"), Ok(false));
        assert_eq!(verify_registration_code("4821", "4821"), Ok(true));
    }

    #[test]
    fn site_url_precedence() {
        assert_eq!(
            resolve_site_url(Some("https://orderlog.app"), Some("preview"), Some("pr-1.vercel.app")),
            "https://pr-1.vercel.app"
        );
        assert_eq!(
            resolve_site_url(Some("https://orderlog.app"), Some("production"), Some("x.vercel.app")),
            "https://orderlog.app"
        );
        assert_eq!(resolve_site_url(None, None, Some("x.vercel.app")), "https://x.vercel.app");
        assert_eq!(resolve_site_url(None, None, None), LOCALHOST_FALLBACK);
    }

    #[test]
    fn settings_validation() {
        let ok = SettingsUpdate {
            allowed_domains: Some(vec!["sub.example.co.jp".to_string()]),
            registration_code: Some("  9917 ".to_string()),
        }
        .validated()
        .unwrap();
        assert_eq!(ok.registration_code.as_deref(), Some("9917"));

        assert_eq!(SettingsUpdate::default().validated(), Err(SettingsError::Empty));
        assert_eq!(
            SettingsUpdate {
                allowed_domains: Some(vec!["not a domain".to_string()]),
                registration_code: None,
            }
            .validated(),
            Err(SettingsError::InvalidDomain("not a domain".to_string()))
        );
        assert_eq!(
            SettingsUpdate {
                allowed_domains: None,
                registration_code: Some(" 12 ".to_string()),
            }
            .validated(),
            Err(SettingsError::CodeTooShort)
        );
    }

    #[test]
    fn third_failure_locks_for_five_minutes() {
        let mut state = AttemptState::default();
        state.record_failure(now());
        state.record_failure(now());
        assert_eq!(state.check(now()), Ok(()));

        state.record_failure(now());
        assert_eq!(state.check(now()), Err(AccessError::Locked(300)));
        assert_eq!(
            state.lock_remaining(now() + Duration::milliseconds(1500)),
            299
        );

        let later = now() + Duration::minutes(5);
        state.refresh(later);
        assert_eq!(state.attempts, 0);
        assert_eq!(state.check(later), Ok(()));
    }

    #[test]
    fn links_are_spaced_sixty_seconds_apart() {
        let mut state = AttemptState::default();
        state.record_failure(now());
        state.record_sent(now());
        assert_eq!(state.attempts, 0);
        assert_eq!(state.check(now() + Duration::seconds(10)), Err(AccessError::Throttled(50)));
        assert_eq!(state.check(now() + Duration::seconds(60)), Ok(()));
    }

    #[test]
    fn only_policy_rejections_count_as_failures() {
        assert!(AccessError::InvalidCode.is_failed_attempt());
        assert!(AccessError::DomainNotAllowed("x".to_string()).is_failed_attempt());
        assert!(!AccessError::Throttled(5).is_failed_attempt());
        assert!(!AccessError::EmailRequired.is_failed_attempt());
    }
}
