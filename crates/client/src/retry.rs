use std::str::FromStr;
use std::time::Duration;

use aggsync_core::config::RetryConfig;
use tracing::warn;

/// Longest single wait between attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Statuses that carry a definite answer; retrying them cannot help.
const NEVER_RETRY: &[u16] = &[404, 409, 412];

/// A three-digit status pattern where `x` matches any digit, e.g. `5xx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPattern([Option<u8>; 3]);

impl StatusPattern {
    pub fn matches(&self, status: u16) -> bool {
        if !(100..=999).contains(&status) {
            return false;
        }
        let digits = [
            (status / 100) as u8,
            ((status / 10) % 10) as u8,
            (status % 10) as u8,
        ];
        self.0
            .iter()
            .zip(digits)
            .all(|(want, got)| want.map_or(true, |w| w == got))
    }
}

impl FromStr for StatusPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 3 {
            return Err(format!("status pattern must have three characters: {s:?}"));
        }
        let mut digits = [None; 3];
        for (slot, c) in digits.iter_mut().zip(s.chars()) {
            *slot = match c {
                'x' | 'X' => None,
                d if d.is_ascii_digit() => Some(d as u8 - b'0'),
                _ => return Err(format!("invalid status pattern: {s:?}")),
            };
        }
        Ok(Self(digits))
    }
}

/// When and how long the HTTP transport waits before trying a request again.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    wait: Duration,
    patterns: Vec<StatusPattern>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, wait: Duration, patterns: Vec<StatusPattern>) -> Self {
        Self {
            max_retries,
            wait,
            patterns,
        }
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Vec::new())
    }

    /// Invalid patterns are logged and skipped.
    pub fn from_config(config: &RetryConfig) -> Self {
        let patterns = config
            .status_codes
            .iter()
            .filter_map(|raw| match raw.parse::<StatusPattern>() {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(pattern = %raw, error = %e, "ignoring retry status pattern");
                    None
                }
            })
            .collect();
        Self::new(config.retries, config.wait, patterns)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        if NEVER_RETRY.contains(&status) {
            return false;
        }
        self.patterns.iter().any(|p| p.matches(status))
    }

    /// Wait before retry number `attempt` (0-based): doubles from the base
    /// wait, capped at 30s.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.wait
            .saturating_mul(2u32.pow(attempt.min(5)))
            .min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(s: &str) -> StatusPattern {
        s.parse().unwrap()
    }

    #[test]
    fn wildcard_patterns_match_digit_classes() {
        assert!(pattern("5xx").matches(500));
        assert!(pattern("5xx").matches(503));
        assert!(!pattern("5xx").matches(429));
        assert!(pattern("429").matches(429));
        assert!(!pattern("429").matches(428));
        assert!(pattern("4x9").matches(409));
        assert!(pattern("XXX").matches(200));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        assert!("5x".parse::<StatusPattern>().is_err());
        assert!("5y0".parse::<StatusPattern>().is_err());
        assert!("5000".parse::<StatusPattern>().is_err());
    }

    #[test]
    fn default_policy_retries_rate_limits_and_server_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 3);
        assert!(policy.should_retry_status(429));
        assert!(policy.should_retry_status(502));
        assert!(policy.should_retry_status(401));
        assert!(!policy.should_retry_status(400));
    }

    #[test]
    fn definite_answers_are_never_retried() {
        let policy = RetryPolicy::new(3, Duration::ZERO, vec![pattern("4xx")]);
        assert!(policy.should_retry_status(400));
        assert!(!policy.should_retry_status(404));
        assert!(!policy.should_retry_status(409));
        assert!(!policy.should_retry_status(412));
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1), Vec::new());
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(9), Duration::from_secs(30));
        assert_eq!(RetryPolicy::none().delay(4), Duration::ZERO);
    }

    #[test]
    fn invalid_config_patterns_are_skipped() {
        let config = RetryConfig {
            retries: 1,
            wait: Duration::ZERO,
            status_codes: vec!["5xx".into(), "oops".into()],
        };
        let policy = RetryPolicy::from_config(&config);
        assert!(policy.should_retry_status(500));
        assert!(!policy.should_retry_status(429));
    }
}
