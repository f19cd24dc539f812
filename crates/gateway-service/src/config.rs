//! Gateway configuration.
//!
//! Configuration is loaded from environment variables. Every timing value the
//! gateway enforces is a field here so test suites can shrink windows without
//! touching production defaults. Sensitive fields are redacted in Debug output.

use crate::protocol::FrameLimits;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default websocket/API bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default key ID placed in the `kid` header of access credentials.
pub const DEFAULT_SIGNING_KEY_ID: &str = "gw-01";

/// Default time a fresh connection has to send IDENTIFY.
pub const DEFAULT_IDENTIFY_TIMEOUT_MS: u64 = 10_000;

/// Default heartbeat interval advertised in HELLO.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Default liveness window; a ready connection silent this long is closed.
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 45_000;

/// Default negotiation deadline.
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 15_000;

/// Default minimum interval between join/leave actions.
pub const DEFAULT_JOIN_LEAVE_COOLDOWN_MS: u64 = 2_000;

/// Default minimum interval between mute/deafen changes.
pub const DEFAULT_MUTE_DEAFEN_COOLDOWN_MS: u64 = 250;

/// Default signaling frames allowed per window.
pub const DEFAULT_SIGNALING_RATE_LIMIT_MAX: u32 = 50;

/// Default signaling rate-limit window.
pub const DEFAULT_SIGNALING_RATE_LIMIT_WINDOW_MS: u64 = 1_000;

/// Default server-enforced typing indicator expiry.
pub const DEFAULT_TYPING_EXPIRY_MS: u64 = 8_000;

/// Default access credential lifetime (15 minutes).
pub const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: u64 = 900;

/// Default rotation credential lifetime (30 days).
pub const DEFAULT_ROTATION_TOKEN_TTL_SECONDS: u64 = 30 * 24 * 3600;

/// Default magic login code lifetime (10 minutes).
pub const DEFAULT_MAGIC_CODE_TTL_SECONDS: u64 = 600;

/// Default magic-code requests allowed per email per window.
pub const DEFAULT_MAGIC_CODE_RATE_LIMIT_MAX: u32 = 5;

/// Default magic-code rate-limit window (15 minutes).
pub const DEFAULT_MAGIC_CODE_RATE_LIMIT_WINDOW_SECONDS: u64 = 900;

/// Default registration token lifetime (7 days).
pub const DEFAULT_REGISTRATION_TOKEN_TTL_SECONDS: u64 = 7 * 24 * 3600;

/// Default read-through identity cache lifetime.
pub const DEFAULT_IDENTITY_CACHE_TTL_MS: u64 = 5_000;

/// Default per-connection event queue capacity.
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default per-subscriber media queue capacity.
pub const DEFAULT_MEDIA_QUEUE_CAPACITY: usize = 64;

/// Default consecutive media drops before a subscriber is detached.
pub const DEFAULT_MEDIA_STALL_THRESHOLD: u32 = 32;

/// Default maximum chat message length in characters.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 4_000;

/// Largest configurable chat message length in characters.
pub const MAX_MESSAGE_LENGTH_CEILING: usize = 100_000;

/// Default (and maximum) message history page size.
pub const DEFAULT_HISTORY_PAGE_LIMIT: usize = 100;

/// Gateway configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Ed25519 signing key for access credentials (base64 PKCS#8 DER).
    /// Protected by `SecretString` to prevent accidental logging.
    pub signing_key: SecretString,

    /// Key ID for the `kid` header (default: "gw-01").
    pub signing_key_id: String,

    /// Websocket endpoint bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    pub identify_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub liveness_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub join_leave_cooldown: Duration,
    pub mute_deafen_cooldown: Duration,
    pub signaling_rate_limit_max: u32,
    pub signaling_rate_limit_window: Duration,
    pub typing_expiry: Duration,

    pub access_token_ttl: Duration,
    pub rotation_token_ttl: Duration,
    pub magic_code_ttl: Duration,
    pub magic_code_rate_limit_max: u32,
    pub magic_code_rate_limit_window: Duration,
    pub registration_token_ttl: Duration,
    pub identity_cache_ttl: Duration,

    pub outbound_queue_capacity: usize,
    pub media_queue_capacity: usize,
    pub media_stall_threshold: u32,

    pub max_message_length: usize,
    pub history_page_limit: usize,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signing_key", &"[REDACTED]")
            .field("signing_key_id", &self.signing_key_id)
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("identify_timeout", &self.identify_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("liveness_timeout", &self.liveness_timeout)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("join_leave_cooldown", &self.join_leave_cooldown)
            .field("mute_deafen_cooldown", &self.mute_deafen_cooldown)
            .field("signaling_rate_limit_max", &self.signaling_rate_limit_max)
            .field(
                "signaling_rate_limit_window",
                &self.signaling_rate_limit_window,
            )
            .field("typing_expiry", &self.typing_expiry)
            .field("access_token_ttl", &self.access_token_ttl)
            .field("rotation_token_ttl", &self.rotation_token_ttl)
            .field("magic_code_ttl", &self.magic_code_ttl)
            .field("magic_code_rate_limit_max", &self.magic_code_rate_limit_max)
            .field(
                "magic_code_rate_limit_window",
                &self.magic_code_rate_limit_window,
            )
            .field("registration_token_ttl", &self.registration_token_ttl)
            .field("identity_cache_ttl", &self.identity_cache_ttl)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .field("media_queue_capacity", &self.media_queue_capacity)
            .field("media_stall_threshold", &self.media_stall_threshold)
            .field("max_message_length", &self.max_message_length)
            .field("history_page_limit", &self.history_page_limit)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signing_key = SecretString::from(
            vars.get("GATEWAY_SIGNING_KEY")
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar("GATEWAY_SIGNING_KEY".to_string()))?
                .clone(),
        );

        let signing_key_id = vars
            .get("GATEWAY_SIGNING_KEY_ID")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNING_KEY_ID.to_string());

        let bind_address = vars
            .get("GATEWAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("GATEWAY_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let config = Config {
            signing_key,
            signing_key_id,
            bind_address,
            health_bind_address,
            identify_timeout: millis(vars, "GATEWAY_IDENTIFY_TIMEOUT_MS", DEFAULT_IDENTIFY_TIMEOUT_MS)?,
            heartbeat_interval: millis(
                vars,
                "GATEWAY_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )?,
            liveness_timeout: millis(vars, "GATEWAY_LIVENESS_TIMEOUT_MS", DEFAULT_LIVENESS_TIMEOUT_MS)?,
            negotiation_timeout: millis(
                vars,
                "GATEWAY_NEGOTIATION_TIMEOUT_MS",
                DEFAULT_NEGOTIATION_TIMEOUT_MS,
            )?,
            join_leave_cooldown: millis(
                vars,
                "GATEWAY_JOIN_LEAVE_COOLDOWN_MS",
                DEFAULT_JOIN_LEAVE_COOLDOWN_MS,
            )?,
            mute_deafen_cooldown: millis(
                vars,
                "GATEWAY_MUTE_DEAFEN_COOLDOWN_MS",
                DEFAULT_MUTE_DEAFEN_COOLDOWN_MS,
            )?,
            signaling_rate_limit_max: parse(
                vars,
                "GATEWAY_SIGNALING_RATE_LIMIT_MAX",
                DEFAULT_SIGNALING_RATE_LIMIT_MAX,
            )?,
            signaling_rate_limit_window: millis(
                vars,
                "GATEWAY_SIGNALING_RATE_LIMIT_WINDOW_MS",
                DEFAULT_SIGNALING_RATE_LIMIT_WINDOW_MS,
            )?,
            typing_expiry: millis(vars, "GATEWAY_TYPING_EXPIRY_MS", DEFAULT_TYPING_EXPIRY_MS)?,
            access_token_ttl: seconds(
                vars,
                "GATEWAY_ACCESS_TOKEN_TTL_SECONDS",
                DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            )?,
            rotation_token_ttl: seconds(
                vars,
                "GATEWAY_ROTATION_TOKEN_TTL_SECONDS",
                DEFAULT_ROTATION_TOKEN_TTL_SECONDS,
            )?,
            magic_code_ttl: seconds(
                vars,
                "GATEWAY_MAGIC_CODE_TTL_SECONDS",
                DEFAULT_MAGIC_CODE_TTL_SECONDS,
            )?,
            magic_code_rate_limit_max: parse(
                vars,
                "GATEWAY_MAGIC_CODE_RATE_LIMIT_MAX",
                DEFAULT_MAGIC_CODE_RATE_LIMIT_MAX,
            )?,
            magic_code_rate_limit_window: seconds(
                vars,
                "GATEWAY_MAGIC_CODE_RATE_LIMIT_WINDOW_SECONDS",
                DEFAULT_MAGIC_CODE_RATE_LIMIT_WINDOW_SECONDS,
            )?,
            registration_token_ttl: seconds(
                vars,
                "GATEWAY_REGISTRATION_TOKEN_TTL_SECONDS",
                DEFAULT_REGISTRATION_TOKEN_TTL_SECONDS,
            )?,
            identity_cache_ttl: millis(
                vars,
                "GATEWAY_IDENTITY_CACHE_TTL_MS",
                DEFAULT_IDENTITY_CACHE_TTL_MS,
            )?,
            outbound_queue_capacity: parse(
                vars,
                "GATEWAY_OUTBOUND_QUEUE_CAPACITY",
                DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            )?,
            media_queue_capacity: parse(
                vars,
                "GATEWAY_MEDIA_QUEUE_CAPACITY",
                DEFAULT_MEDIA_QUEUE_CAPACITY,
            )?,
            media_stall_threshold: parse(
                vars,
                "GATEWAY_MEDIA_STALL_THRESHOLD",
                DEFAULT_MEDIA_STALL_THRESHOLD,
            )?,
            max_message_length: parse(
                vars,
                "GATEWAY_MAX_MESSAGE_LENGTH",
                DEFAULT_MAX_MESSAGE_LENGTH,
            )?,
            history_page_limit: parse(
                vars,
                "GATEWAY_HISTORY_PAGE_LIMIT",
                DEFAULT_HISTORY_PAGE_LIMIT,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Build a configuration with production defaults and the given key.
    ///
    /// Test suites start here and shrink the windows they exercise.
    pub fn for_tests(signing_key: SecretString) -> Self {
        Config {
            signing_key,
            signing_key_id: DEFAULT_SIGNING_KEY_ID.to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            health_bind_address: "127.0.0.1:0".to_string(),
            identify_timeout: Duration::from_millis(DEFAULT_IDENTIFY_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            liveness_timeout: Duration::from_millis(DEFAULT_LIVENESS_TIMEOUT_MS),
            negotiation_timeout: Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS),
            join_leave_cooldown: Duration::from_millis(DEFAULT_JOIN_LEAVE_COOLDOWN_MS),
            mute_deafen_cooldown: Duration::from_millis(DEFAULT_MUTE_DEAFEN_COOLDOWN_MS),
            signaling_rate_limit_max: DEFAULT_SIGNALING_RATE_LIMIT_MAX,
            signaling_rate_limit_window: Duration::from_millis(
                DEFAULT_SIGNALING_RATE_LIMIT_WINDOW_MS,
            ),
            typing_expiry: Duration::from_millis(DEFAULT_TYPING_EXPIRY_MS),
            access_token_ttl: Duration::from_secs(DEFAULT_ACCESS_TOKEN_TTL_SECONDS),
            rotation_token_ttl: Duration::from_secs(DEFAULT_ROTATION_TOKEN_TTL_SECONDS),
            magic_code_ttl: Duration::from_secs(DEFAULT_MAGIC_CODE_TTL_SECONDS),
            magic_code_rate_limit_max: DEFAULT_MAGIC_CODE_RATE_LIMIT_MAX,
            magic_code_rate_limit_window: Duration::from_secs(
                DEFAULT_MAGIC_CODE_RATE_LIMIT_WINDOW_SECONDS,
            ),
            registration_token_ttl: Duration::from_secs(DEFAULT_REGISTRATION_TOKEN_TTL_SECONDS),
            identity_cache_ttl: Duration::from_millis(DEFAULT_IDENTITY_CACHE_TTL_MS),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            media_queue_capacity: DEFAULT_MEDIA_QUEUE_CAPACITY,
            media_stall_threshold: DEFAULT_MEDIA_STALL_THRESHOLD,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            history_page_limit: DEFAULT_HISTORY_PAGE_LIMIT,
        }
    }

    /// Inbound text frame limits derived from `max_message_length`.
    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits::for_message_length(self.max_message_length)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue_capacity == 0 || self.media_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "queue capacities must be non-zero".to_string(),
            ));
        }
        if self.liveness_timeout <= self.heartbeat_interval {
            return Err(ConfigError::InvalidValue(format!(
                "liveness timeout ({:?}) must exceed heartbeat interval ({:?})",
                self.liveness_timeout, self.heartbeat_interval
            )));
        }
        if self.max_message_length == 0 || self.max_message_length > MAX_MESSAGE_LENGTH_CEILING {
            return Err(ConfigError::InvalidValue(format!(
                "max message length must be between 1 and {MAX_MESSAGE_LENGTH_CEILING}"
            )));
        }
        if self.signaling_rate_limit_max == 0 || self.history_page_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "rate limit and history page limit must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

fn millis(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<Duration, ConfigError> {
    parse(vars, key, default).map(Duration::from_millis)
}

fn seconds(
    vars: &HashMap<String, String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse(vars, key, default).map(Duration::from_secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "GATEWAY_SIGNING_KEY".to_string(),
            "MC4CAQAwBQYDK2VwBCIEIHRlc3Qtc2lnbmluZy1rZXktZm9yLWNvbmZpZw==".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert!(config.signing_key.expose_secret().starts_with("MC4C"));
        assert_eq!(config.signing_key_id, DEFAULT_SIGNING_KEY_ID);
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert_eq!(
            config.identify_timeout,
            Duration::from_millis(DEFAULT_IDENTIFY_TIMEOUT_MS)
        );
        assert_eq!(
            config.join_leave_cooldown,
            Duration::from_millis(DEFAULT_JOIN_LEAVE_COOLDOWN_MS)
        );
        assert_eq!(
            config.access_token_ttl,
            Duration::from_secs(DEFAULT_ACCESS_TOKEN_TTL_SECONDS)
        );
        assert_eq!(config.max_message_length, DEFAULT_MAX_MESSAGE_LENGTH);
        assert_eq!(config.history_page_limit, DEFAULT_HISTORY_PAGE_LIMIT);
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("GATEWAY_BIND_ADDRESS".to_string(), "127.0.0.1:9000".to_string());
        vars.insert("GATEWAY_NEGOTIATION_TIMEOUT_MS".to_string(), "500".to_string());
        vars.insert("GATEWAY_JOIN_LEAVE_COOLDOWN_MS".to_string(), "50".to_string());
        vars.insert("GATEWAY_SIGNALING_RATE_LIMIT_MAX".to_string(), "3".to_string());
        vars.insert("GATEWAY_MAX_MESSAGE_LENGTH".to_string(), "10".to_string());
        vars.insert("GATEWAY_ACCESS_TOKEN_TTL_SECONDS".to_string(), "60".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.bind_address, "127.0.0.1:9000");
        assert_eq!(config.negotiation_timeout, Duration::from_millis(500));
        assert_eq!(config.join_leave_cooldown, Duration::from_millis(50));
        assert_eq!(config.signaling_rate_limit_max, 3);
        assert_eq!(config.max_message_length, 10);
        assert_eq!(config.access_token_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_from_vars_missing_signing_key() {
        let result = Config::from_vars(&HashMap::new());
        assert!(
            matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "GATEWAY_SIGNING_KEY")
        );
    }

    #[test]
    fn test_from_vars_malformed_number() {
        let mut vars = base_vars();
        vars.insert("GATEWAY_TYPING_EXPIRY_MS".to_string(), "soon".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(v)) if v.contains("GATEWAY_TYPING_EXPIRY_MS"))
        );
    }

    #[test]
    fn test_from_vars_rejects_liveness_shorter_than_heartbeat() {
        let mut vars = base_vars();
        vars.insert("GATEWAY_HEARTBEAT_INTERVAL_MS".to_string(), "5000".to_string());
        vars.insert("GATEWAY_LIVENESS_TIMEOUT_MS".to_string(), "4000".to_string());

        assert!(matches!(
            Config::from_vars(&vars),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_message_length_bounds_and_frame_limits() {
        for bad in ["0", "100001"] {
            let mut vars = base_vars();
            vars.insert("GATEWAY_MAX_MESSAGE_LENGTH".to_string(), bad.to_string());
            assert!(
                matches!(Config::from_vars(&vars), Err(ConfigError::InvalidValue(_))),
                "{bad} should be rejected"
            );
        }

        let mut vars = base_vars();
        vars.insert(
            "GATEWAY_MAX_MESSAGE_LENGTH".to_string(),
            MAX_MESSAGE_LENGTH_CEILING.to_string(),
        );
        let limits = Config::from_vars(&vars).unwrap().frame_limits();
        assert_eq!(limits.max_message_length, MAX_MESSAGE_LENGTH_CEILING);
        assert!(limits.max_frame_bytes >= MAX_MESSAGE_LENGTH_CEILING * 12);
    }

    #[test]
    fn test_debug_redacts_sensitive_fields() {
        let config = Config::from_vars(&base_vars()).unwrap();
        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("MC4C"));
    }

    #[test]
    fn test_for_tests_uses_production_defaults() {
        let config = Config::for_tests(SecretString::from("key"));
        assert_eq!(
            config.liveness_timeout,
            Duration::from_millis(DEFAULT_LIVENESS_TIMEOUT_MS)
        );
        assert_eq!(config.outbound_queue_capacity, DEFAULT_OUTBOUND_QUEUE_CAPACITY);
    }
}
