use std::env;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Env key overriding the maximum number of computation tokens.
pub const COMPUTATION_TOKEN_COUNT_KEY: &str = "KILN_COMPUTATION_TOKEN_COUNT";

/// Env key selecting the active profile.
pub const PROFILE_KEY: &str = "KILN_PROFILE";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// `max(available_parallelism * 3 / 2, 2)`.
pub fn default_computation_token_count() -> usize {
    let processors = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (processors * 3 / 2).max(2)
}

/// Parse a token count override. Only strictly positive integers are accepted.
pub fn parse_token_count(raw: &str) -> Result<usize, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidValue {
        key: COMPUTATION_TOKEN_COUNT_KEY.to_string(),
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| invalid("not an integer"))?;
    if value <= 0 {
        return Err(invalid("must be positive"));
    }
    usize::try_from(value).map_err(|_| invalid("out of range"))
}

// ── Execution config ──────────────────────────────────────────

/// Settings of the execution core, resolved once per process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Active profile name (empty = default).
    pub profile: String,
    /// Upper bound on concurrently checked-out computation tokens.
    pub computation_token_count: usize,
    /// Whether the token count came from the environment.
    pub token_count_overridden: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            profile: String::new(),
            computation_token_count: default_computation_token_count(),
            token_count_overridden: false,
        }
    }
}

impl ExecutionConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `KILN_PROFILE`; when set, keys are first looked up
    /// as `{PROFILE}_{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_opt(PROFILE_KEY).unwrap_or_default().to_uppercase();
        Self::for_profile(&profile)
    }

    pub fn for_profile(profile: &str) -> Self {
        let profile = profile.to_uppercase();
        let raw = profiled_env_opt(&profile, COMPUTATION_TOKEN_COUNT_KEY);
        Self::resolve(profile, raw.as_deref())
    }

    /// Resolve from an optional raw override. Invalid overrides are logged and ignored.
    pub fn resolve(profile: String, raw_token_count: Option<&str>) -> Self {
        let (computation_token_count, token_count_overridden) = match raw_token_count {
            None => (default_computation_token_count(), false),
            Some(raw) => match parse_token_count(raw) {
                Ok(count) => (count, true),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring computation token override");
                    (default_computation_token_count(), false)
                }
            },
        };
        Self {
            profile,
            computation_token_count,
            token_count_overridden,
        }
    }

    pub fn with_token_count(count: usize) -> Self {
        Self {
            computation_token_count: count.max(1),
            token_count_overridden: true,
            ..Self::default()
        }
    }

    /// Thread count of the fixed pool used for duplicates that take no tokens.
    pub fn fixed_pool_size(&self) -> usize {
        fixed_pool_size(self.computation_token_count)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() {
            "default"
        } else {
            &self.profile
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("Execution config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  tokens:      max={}{}",
            self.computation_token_count,
            if self.token_count_overridden { " (override)" } else { "" }
        );
        tracing::info!("  fixed pool:  threads={}", self.fixed_pool_size());
    }
}

/// `max_tokens * 3 / 2`, at least one thread.
pub fn fixed_pool_size(max_tokens: usize) -> usize {
    (max_tokens * 3 / 2).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_at_least_two() {
        assert!(default_computation_token_count() >= 2);
    }

    #[test]
    fn parse_accepts_positive_integers() {
        assert_eq!(parse_token_count("8").unwrap(), 8);
        assert_eq!(parse_token_count(" 3 ").unwrap(), 3);
    }

    #[test]
    fn parse_rejects_garbage_and_non_positive() {
        assert!(parse_token_count("abc").is_err());
        assert!(parse_token_count("0").is_err());
        assert!(parse_token_count("-4").is_err());
        assert!(parse_token_count("").is_err());
    }

    #[test]
    fn invalid_override_falls_back_to_default() {
        let cfg = ExecutionConfig::resolve(String::new(), Some("lots"));
        assert_eq!(cfg.computation_token_count, default_computation_token_count());
        assert!(!cfg.token_count_overridden);

        let cfg = ExecutionConfig::resolve("CI".into(), Some("5"));
        assert_eq!(cfg.computation_token_count, 5);
        assert!(cfg.token_count_overridden);
        assert_eq!(cfg.profile_label(), "CI");
    }

    #[test]
    fn fixed_pool_is_one_and_a_half_times_the_maximum() {
        assert_eq!(ExecutionConfig::with_token_count(4).fixed_pool_size(), 6);
        assert_eq!(fixed_pool_size(1), 1);
        assert_eq!(fixed_pool_size(0), 1);
    }

    #[test]
    fn config_serializes() {
        let cfg = ExecutionConfig::with_token_count(3);
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["computation_token_count"], 3);
    }
}
