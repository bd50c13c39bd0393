//! Configuration management for Turnstile.
//!
//! Settings come from an optional file and from environment variables, the
//! latter taking precedence. Keys are flat and match the environment variable
//! names in lowercase, e.g. `IP_QT_REQS_SECOND` or `ip_qt_reqs_second:` in a
//! YAML file.
//!
//! Values are kept raw until resolved into runtime types. Resolution never
//! fails: a missing or malformed value is logged and replaced by its default,
//! so a typo in a budget degrades to a conservative limit instead of
//! preventing the gateway from starting.

use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::Result;
use crate::http::IdentityPolicy;
use crate::ratelimit::{ConsistencyMode, LimiterOptions, TierLimit, TierPolicy, MAX_TIER};

const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 8080);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// Longest duration accepted for any setting.
const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Raw configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// HTTP bind address
    pub listen_addr: Option<String>,
    /// Redis URL; the in-process store is used when unset
    pub redis_url: Option<String>,
    /// Retention of every record write
    pub record_ttl: Option<String>,
    /// Upper bound on a single store call
    pub store_timeout: Option<String>,
    /// `atomic` or `relaxed`
    pub consistency: Option<String>,
    /// Compare-and-set attempts per decision
    pub max_retries: Option<String>,
    /// How often the in-process store drops expired records
    pub sweep_interval: Option<String>,
    /// Length of a rate limit window
    pub window_duration: Option<String>,

    /// Budget for address-based identities
    pub ip_qt_reqs_second: Option<String>,
    pub token_1_qt_reqs_second: Option<String>,
    pub token_2_qt_reqs_second: Option<String>,
    pub token_3_qt_reqs_second: Option<String>,
    pub token_4_qt_reqs_second: Option<String>,

    /// Block duration for address-based identities
    pub token_0_block_duration: Option<String>,
    pub token_1_block_duration: Option<String>,
    pub token_2_block_duration: Option<String>,
    pub token_3_block_duration: Option<String>,
    pub token_4_block_duration: Option<String>,

    /// Limit by client address only
    pub use_only_ip_limiter: Option<String>,
    /// Require a token and limit by it
    pub use_only_token_limiter: Option<String>,
}

impl TurnstileConfig {
    /// Load configuration from an optional file overlaid with the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!(path, "Loading configuration file");
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder.add_source(Environment::default()).build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Name and raw value of the budget setting for `tier`.
    fn budget_setting(&self, tier: u8) -> (&'static str, Option<&str>) {
        let (key, raw) = match tier {
            0 => ("IP_QT_REQS_SECOND", &self.ip_qt_reqs_second),
            1 => ("TOKEN_1_QT_REQS_SECOND", &self.token_1_qt_reqs_second),
            2 => ("TOKEN_2_QT_REQS_SECOND", &self.token_2_qt_reqs_second),
            3 => ("TOKEN_3_QT_REQS_SECOND", &self.token_3_qt_reqs_second),
            _ => ("TOKEN_4_QT_REQS_SECOND", &self.token_4_qt_reqs_second),
        };
        (key, raw.as_deref())
    }

    /// Name and raw value of the block duration setting for `tier`.
    fn block_setting(&self, tier: u8) -> (&'static str, Option<&str>) {
        let (key, raw) = match tier {
            0 => ("TOKEN_0_BLOCK_DURATION", &self.token_0_block_duration),
            1 => ("TOKEN_1_BLOCK_DURATION", &self.token_1_block_duration),
            2 => ("TOKEN_2_BLOCK_DURATION", &self.token_2_block_duration),
            3 => ("TOKEN_3_BLOCK_DURATION", &self.token_3_block_duration),
            _ => ("TOKEN_4_BLOCK_DURATION", &self.token_4_block_duration),
        };
        (key, raw.as_deref())
    }

    /// Resolve the budget and block duration of every tier.
    pub fn tier_policy(&self) -> TierPolicy {
        let window = optional_duration(
            "WINDOW_DURATION",
            self.window_duration.as_deref(),
            TierPolicy::default().window(),
        );

        (0..=MAX_TIER).fold(TierPolicy::new(window), |policy, tier| {
            let fallback = TierLimit::default_for(tier);
            let (budget_key, budget_raw) = self.budget_setting(tier);
            let (block_key, block_raw) = self.block_setting(tier);

            let limit = TierLimit::new(
                required_count(budget_key, budget_raw, fallback.budget),
                required_duration(block_key, block_raw, fallback.block_duration),
            );
            policy.with_tier(tier, limit)
        })
    }

    /// Resolve the identification mode.
    pub fn identity_policy(&self) -> IdentityPolicy {
        IdentityPolicy {
            address_only: flag("USE_ONLY_IP_LIMITER", self.use_only_ip_limiter.as_deref()),
            token_only: flag("USE_ONLY_TOKEN_LIMITER", self.use_only_token_limiter.as_deref()),
        }
    }

    /// Resolve the limiter storage options.
    pub fn limiter_options(&self) -> LimiterOptions {
        let defaults = LimiterOptions::default();

        let consistency = match self.consistency.as_deref() {
            None => defaults.consistency,
            Some(raw) => raw.parse::<ConsistencyMode>().unwrap_or_else(|e| {
                error!(
                    key = "CONSISTENCY",
                    value = raw,
                    error = %e,
                    "Invalid setting, using default"
                );
                defaults.consistency
            }),
        };

        let max_retries = optional_count(
            "MAX_RETRIES",
            self.max_retries.as_deref(),
            u64::from(defaults.max_retries),
        );

        LimiterOptions {
            record_ttl: optional_duration(
                "RECORD_TTL",
                self.record_ttl.as_deref(),
                defaults.record_ttl,
            ),
            store_timeout: optional_duration(
                "STORE_TIMEOUT",
                self.store_timeout.as_deref(),
                defaults.store_timeout,
            ),
            consistency,
            max_retries: u32::try_from(max_retries).unwrap_or(u32::MAX),
        }
    }

    /// Resolve the HTTP bind address.
    pub fn listen_addr(&self) -> SocketAddr {
        match self.listen_addr.as_deref() {
            None => DEFAULT_LISTEN_ADDR,
            Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
                error!(
                    key = "LISTEN_ADDR",
                    value = raw,
                    error = %e,
                    "Invalid setting, using default"
                );
                DEFAULT_LISTEN_ADDR
            }),
        }
    }

    /// Resolve the sweep interval of the in-process store.
    pub fn sweep_interval(&self) -> Duration {
        optional_duration(
            "SWEEP_INTERVAL",
            self.sweep_interval.as_deref(),
            DEFAULT_SWEEP_INTERVAL,
        )
    }
}

/// A count that operators are expected to set; absence is worth a warning.
fn required_count(key: &str, raw: Option<&str>, default: u64) -> u64 {
    match raw {
        None => {
            warn!(key, default, "Setting not found, using default");
            default
        }
        Some(raw) => parse_count(key, raw, default),
    }
}

fn optional_count(key: &str, raw: Option<&str>, default: u64) -> u64 {
    raw.map_or(default, |raw| parse_count(key, raw, default))
}

fn parse_count(key: &str, raw: &str, default: u64) -> u64 {
    raw.trim().parse().unwrap_or_else(|e| {
        error!(key, value = raw, error = %e, default, "Invalid count, using default");
        default
    })
}

/// A duration that operators are expected to set; absence is worth a warning.
fn required_duration(key: &str, raw: Option<&str>, default: Duration) -> Duration {
    match raw {
        None => {
            warn!(key, default = ?default, "Setting not found, using default");
            default
        }
        Some(raw) => parse_duration(key, raw, default),
    }
}

fn optional_duration(key: &str, raw: Option<&str>, default: Duration) -> Duration {
    raw.map_or(default, |raw| parse_duration(key, raw, default))
}

fn parse_duration(key: &str, raw: &str, default: Duration) -> Duration {
    match humantime::parse_duration(raw.trim()) {
        Ok(duration) if duration <= MAX_DURATION => duration,
        Ok(_) => {
            error!(
                key,
                value = raw,
                max = ?MAX_DURATION,
                default = ?default,
                "Duration out of range, using default"
            );
            default
        }
        Err(e) => {
            error!(
                key,
                value = raw,
                error = %e,
                default = ?default,
                "Invalid duration, using default"
            );
            default
        }
    }
}

/// Parse a boolean switch. Unset means off; anything unrecognised is logged
/// and treated as off.
fn flag(key: &str, raw: Option<&str>) -> bool {
    let Some(raw) = raw else {
        return false;
    };
    match raw.trim() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => true,
        "0" | "f" | "F" | "FALSE" | "false" | "False" => false,
        other => {
            warn!(key, value = other, "Invalid boolean, treating as false");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = TurnstileConfig::default();
        let policy = config.tier_policy();

        let expected = (0..=MAX_TIER).fold(TierPolicy::default(), |policy, tier| {
            policy.with_tier(tier, TierLimit::default_for(tier))
        });
        assert_eq!(policy, expected);
        assert_eq!(config.identity_policy(), IdentityPolicy::default());
        assert_eq!(config.limiter_options(), LimiterOptions::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
listen_addr: "127.0.0.1:9000"
redis_url: "redis://redis:6379/"
window_duration: 2s
ip_qt_reqs_second: 5
token_1_qt_reqs_second: 10
token_2_qt_reqs_second: 20
token_3_qt_reqs_second: 50
token_4_qt_reqs_second: 100
token_0_block_duration: 1s
token_2_block_duration: 500ms
token_4_block_duration: 2m
use_only_ip_limiter: "false"
use_only_token_limiter: true
consistency: relaxed
record_ttl: 30s
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        let policy = config.tier_policy();

        assert_eq!(config.redis_url.as_deref(), Some("redis://redis:6379/"));
        assert_eq!(config.listen_addr(), "127.0.0.1:9000".parse().unwrap());
        assert_eq!(policy.window(), Duration::from_secs(2));
        assert_eq!(policy.budget(0), 5);
        assert_eq!(policy.budget(2), 20);
        assert_eq!(policy.budget(4), 100);
        assert_eq!(policy.block_duration(2), Duration::from_millis(500));
        assert_eq!(policy.block_duration(4), Duration::from_secs(120));

        let identity = config.identity_policy();
        assert!(!identity.address_only);
        assert!(identity.token_only);

        let options = config.limiter_options();
        assert_eq!(options.consistency, ConsistencyMode::Relaxed);
        assert_eq!(options.record_ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_malformed_values_fall_back() {
        let config = TurnstileConfig {
            ip_qt_reqs_second: Some("five".to_string()),
            token_3_qt_reqs_second: Some("-3".to_string()),
            token_1_block_duration: Some("forever".to_string()),
            consistency: Some("eventual".to_string()),
            listen_addr: Some("nowhere".to_string()),
            ..TurnstileConfig::default()
        };
        let policy = config.tier_policy();

        assert_eq!(policy.budget(0), 5);
        assert_eq!(policy.budget(3), 10);
        assert_eq!(policy.block_duration(1), Duration::from_secs(1));
        assert_eq!(config.limiter_options().consistency, ConsistencyMode::Atomic);
        assert_eq!(config.listen_addr(), "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn test_out_of_range_durations_fall_back() {
        let config = TurnstileConfig {
            window_duration: Some("300000000000years".to_string()),
            token_0_block_duration: Some("300000000000years".to_string()),
            token_2_block_duration: Some("100years 1s".to_string()),
            record_ttl: Some("100000000000years".to_string()),
            sweep_interval: Some("584942417355years".to_string()),
            ..TurnstileConfig::default()
        };
        let policy = config.tier_policy();

        assert_eq!(policy.window(), Duration::from_secs(1));
        assert_eq!(policy.block_duration(0), Duration::from_secs(1));
        assert_eq!(policy.block_duration(2), Duration::from_secs(1));
        assert_eq!(config.limiter_options().record_ttl, Duration::from_secs(10));
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_durations_up_to_the_limit_are_kept() {
        let config = TurnstileConfig {
            token_3_block_duration: Some("36500days".to_string()),
            ..TurnstileConfig::default()
        };
        assert_eq!(config.tier_policy().block_duration(3), MAX_DURATION);
    }

    #[test]
    fn test_flags_follow_boolean_spellings() {
        for truthy in ["1", "t", "T", "TRUE", "true", "True"] {
            assert!(flag("K", Some(truthy)), "{}", truthy);
        }
        for falsy in ["0", "f", "F", "FALSE", "false", "False", "yes", ""] {
            assert!(!flag("K", Some(falsy)), "{}", falsy);
        }
        assert!(!flag("K", None));
    }

    #[test]
    fn test_conflicting_modes_are_detected() {
        let config = TurnstileConfig {
            use_only_ip_limiter: Some("true".to_string()),
            use_only_token_limiter: Some("1".to_string()),
            ..TurnstileConfig::default()
        };
        assert!(config.identity_policy().is_conflicting());
    }

    #[test]
    fn test_load_without_file_reads_environment() {
        // Whatever the environment holds, loading must not fail.
        assert!(TurnstileConfig::load(None).is_ok());
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(TurnstileConfig::load(Some("/definitely/not/here/turnstile")).is_err());
    }
}
