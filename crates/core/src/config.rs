use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Pull a `.env` file from the working directory into the process
/// environment. A missing file is not an error.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// Non-empty value of `key`.
fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// `{PROFILE}_{KEY}` wins over plain `{KEY}` when a profile is active.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if profile.is_empty() {
        return env_value(key);
    }
    env_value(&format!("{profile}_{key}")).or_else(|| env_value(key))
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_owned())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> Result<u32, CoreError> {
    match profiled_env_opt(profile, key) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| CoreError::Config(format!("{key} must be an integer, got {v:?}"))),
        None => Ok(default),
    }
}

fn profiled_env_bool(profile: &str, key: &str) -> bool {
    matches!(
        profiled_env_or(profile, key, "false").to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

/// Status codes retried by default: rate limiting, server errors, and the
/// sporadic 401s the API returns under load.
pub const DEFAULT_RETRY_STATUS_CODES: &[&str] = &["429", "5xx", "401"];

pub const DEFAULT_USER_AGENT: &str = concat!("aggsync/", env!("CARGO_PKG_VERSION"));

/// Upper bound on a single HTTP attempt, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u32 = 30;

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub api: ApiConfig,
    pub retry: RetryConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `AGGSYNC_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, CoreError> {
        let profile = env_value("AGGSYNC_PROFILE").unwrap_or_default();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, CoreError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Ok(Self {
            profile: p.to_string(),
            api: ApiConfig::from_env_profiled(p)?,
            retry: RetryConfig::from_env_profiled(p)?,
        })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    pub fn is_configured(&self) -> bool {
        self.api.is_configured()
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  api:    url={}, key={}, headers={}, timeout={:?}",
            self.api.url.as_deref().unwrap_or("(none)"),
            if self.api.api_key.is_some() { "set" } else { "(none)" },
            self.api.http_headers.len(),
            self.api.timeout
        );
        tracing::info!(
            "  retry:  retries={}, wait={:?}, status_codes={}",
            self.retry.retries,
            self.retry.wait,
            self.retry.status_codes.join(",")
        );
    }

    /// Return a redacted view safe for logs and diagnostics (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "api": {
                "url": self.api.url,
                "api_key_set": self.api.api_key.is_some(),
                "header_names": self.api.http_headers.keys().collect::<Vec<_>>(),
                "user_agent": self.api.user_agent,
                "debug": self.api.debug,
                "timeout_secs": self.api.timeout.as_secs(),
                "configured": self.api.is_configured(),
            },
            "retry": {
                "retries": self.retry.retries,
                "wait_secs": self.retry.wait.as_secs(),
                "status_codes": self.retry.status_codes,
            },
        })
    }
}

// ── Remote API ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    /// Extra headers added to every request.
    pub http_headers: BTreeMap<String, String>,
    pub user_agent: String,
    /// Log request and response bodies at debug level.
    pub debug: bool,
    /// Per-attempt request timeout. Retries each get a fresh one.
    pub timeout: Duration,
}

impl ApiConfig {
    fn from_env_profiled(p: &str) -> Result<Self, CoreError> {
        let http_headers = match profiled_env_opt(p, "AGGSYNC_HTTP_HEADERS") {
            Some(raw) => parse_http_headers(&raw)?,
            None => BTreeMap::new(),
        };
        Ok(Self {
            url: profiled_env_opt(p, "AGGSYNC_API_URL"),
            api_key: profiled_env_opt(p, "AGGSYNC_API_KEY"),
            http_headers,
            user_agent: profiled_env_or(p, "AGGSYNC_USER_AGENT", DEFAULT_USER_AGENT),
            debug: profiled_env_bool(p, "AGGSYNC_DEBUG"),
            timeout: Duration::from_secs(
                profiled_env_u32(p, "AGGSYNC_TIMEOUT", DEFAULT_TIMEOUT_SECS)? as u64,
            ),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            http_headers: BTreeMap::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            debug: false,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64),
        }
    }
}

// ── Transport retries ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub retries: u32,
    /// Base wait between attempts.
    pub wait: Duration,
    /// Status code patterns; `x` matches any digit (`5xx`).
    pub status_codes: Vec<String>,
}

impl RetryConfig {
    fn from_env_profiled(p: &str) -> Result<Self, CoreError> {
        let status_codes = match profiled_env_opt(p, "AGGSYNC_RETRY_STATUS_CODES") {
            Some(raw) => parse_status_codes(&raw),
            None => DEFAULT_RETRY_STATUS_CODES.iter().map(|s| s.to_string()).collect(),
        };
        Ok(Self {
            retries: profiled_env_u32(p, "AGGSYNC_RETRIES", 3)?,
            wait: Duration::from_secs(profiled_env_u32(p, "AGGSYNC_RETRY_WAIT", 0)? as u64),
            status_codes,
        })
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            wait: Duration::ZERO,
            status_codes: DEFAULT_RETRY_STATUS_CODES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Parse a JSON object of header name to value.
pub fn parse_http_headers(raw: &str) -> Result<BTreeMap<String, String>, CoreError> {
    serde_json::from_str(raw)
        .map_err(|e| CoreError::Config(format!("AGGSYNC_HTTP_HEADERS is not a JSON object of strings: {e}")))
}

/// Split a comma-separated list of status code patterns.
pub fn parse_status_codes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_parse_from_json_object() {
        let headers = parse_http_headers(r#"{"X-Scope-OrgID": "42", "X-Team": "obs"}"#).unwrap();
        assert_eq!(headers.get("X-Scope-OrgID").map(String::as_str), Some("42"));
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn headers_reject_non_string_values() {
        let err = parse_http_headers(r#"{"X-Count": 3}"#).unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        assert!(parse_http_headers("not json").is_err());
    }

    #[test]
    fn status_codes_split_and_trim() {
        assert_eq!(parse_status_codes("429, 5xx ,,401"), vec!["429", "5xx", "401"]);
        assert!(parse_status_codes("").is_empty());
    }

    #[test]
    fn defaults_retry_on_rate_limit_and_server_errors() {
        let retry = RetryConfig::default();
        assert_eq!(retry.retries, 3);
        assert_eq!(retry.wait, Duration::ZERO);
        assert_eq!(retry.status_codes, vec!["429", "5xx", "401"]);
    }

    #[test]
    fn redacted_summary_hides_api_key() {
        let config = Config {
            profile: String::new(),
            api: ApiConfig {
                url: Some("https://example.test".into()),
                api_key: Some("secret-token".into()),
                ..ApiConfig::default()
            },
            retry: RetryConfig::default(),
        };
        let summary = config.redacted_summary().to_string();
        assert!(!summary.contains("secret-token"));
        assert!(summary.contains("\"api_key_set\":true"));
        assert!(summary.contains("\"timeout_secs\":30"));
        assert_eq!(config.profile_label(), "default");
        assert!(config.is_configured());
    }
}
