//! Configuration types.
//!
//! Everything is read from the environment with parse-or-default semantics:
//! an unparsable value logs a warning and falls back to the default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default public Bot API endpoint.
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Provider HTTP client configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Base URL of the Bot API (overridable for self-hosted Bot API servers and tests).
    pub api_base: String,
    /// Connect timeout applied to every provider call.
    pub connect_timeout: Duration,
    /// Total timeout for the identity check (`getMe`).
    pub identity_timeout: Duration,
    /// Total timeout for `sendMessage`.
    pub send_timeout: Duration,
    /// Total timeout for media uploads.
    pub upload_timeout: Duration,
    /// Total timeout for `getFile`.
    pub file_meta_timeout: Duration,
    /// Total timeout for raw file downloads.
    pub download_timeout: Duration,
    /// Attempts per call for transport-level failures (1 = no retry).
    pub retry_attempts: u32,
    /// Pause between transport retries.
    pub retry_delay: Duration,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            connect_timeout: Duration::from_secs(20),
            identity_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(35),
            upload_timeout: Duration::from_secs(180),
            file_meta_timeout: Duration::from_secs(15),
            download_timeout: Duration::from_secs(60),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(700),
        }
    }
}

impl TelegramConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_base: std::env::var("TELEGRAM_API_BASE")
                .map(|s| s.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            retry_attempts: env_or("TELEGRAM_RETRY_ATTEMPTS", defaults.retry_attempts).max(1),
            ..defaults
        }
    }
}

/// Inbound poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Pause between sweeps.
    pub interval: Duration,
    /// `limit` sent to `getUpdates`.
    pub limit: u32,
    /// Long-poll `timeout` in seconds sent to `getUpdates` (0 = short poll).
    pub long_poll_timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            limit: 50,
            long_poll_timeout_secs: 0,
        }
    }
}

impl PollerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: Duration::from_secs(env_or("BRIDGE_POLL_INTERVAL_SECS", 5u64).max(1)),
            limit: env_or("TELEGRAM_POLL_LIMIT", defaults.limit).clamp(1, 100),
            long_poll_timeout_secs: env_or("TELEGRAM_POLL_TIMEOUT", defaults.long_poll_timeout_secs),
        }
    }

    /// HTTP timeout for a `getUpdates` call: the long-poll window plus slack,
    /// never below 20 seconds.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs((self.long_poll_timeout_secs + 10).max(20))
    }
}

/// Delivery queue configuration.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Number of concurrent queue consumers.
    pub workers: usize,
    /// Queue-level attempts per task.
    pub max_attempts: u32,
    /// Upper bound for one delivery attempt.
    pub job_timeout: Duration,
    /// How often idle consumers re-check the queue without a wake-up.
    pub idle_poll: Duration,
    /// Delay before a failed task becomes claimable again.
    pub retry_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 2,
            job_timeout: Duration::from_secs(180),
            idle_poll: Duration::from_secs(2),
            retry_backoff: Duration::from_secs(10),
        }
    }
}

impl DeliveryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_or("BRIDGE_DELIVERY_WORKERS", defaults.workers).max(1),
            max_attempts: env_or("BRIDGE_DELIVERY_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            job_timeout: Duration::from_secs(env_or("BRIDGE_DELIVERY_TIMEOUT_SECS", 180u64)),
            ..defaults
        }
    }

    /// Lease granted to a consumer claiming a task. A task whose lease runs
    /// out is considered abandoned and may be claimed again.
    pub fn lease(&self) -> Duration {
        self.job_timeout + Duration::from_secs(60)
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// Root for staged uploads (`<root>/telegram_uploads`) and proxy
    /// temporaries (`<root>/tmp`).
    pub storage_dir: PathBuf,
    /// Maximum accepted upload size in bytes.
    pub max_upload_bytes: usize,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub telegram: TelegramConfig,
    pub poller: PollerConfig,
    pub delivery: DeliveryConfig,
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let storage_dir = std::env::var("BRIDGE_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/storage"));

        Self {
            db_path: std::env::var("BRIDGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/channel-bridge.db")),
            http_port: env_or("BRIDGE_HTTP_PORT", 8080u16),
            storage_dir,
            max_upload_bytes: env_or("BRIDGE_MAX_UPLOAD_MB", 20usize) * 1024 * 1024,
            log_dir: std::env::var("BRIDGE_LOG_DIR").ok().map(PathBuf::from),
            telegram: TelegramConfig::from_env(),
            poller: PollerConfig::from_env(),
            delivery: DeliveryConfig::from_env(),
        }
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.storage_dir.join("telegram_uploads")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.storage_dir.join("tmp")
    }
}

/// Read and parse an environment variable, falling back to `default` when it
/// is unset or unparsable.
fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, fallback = %default, "Unparsable config value");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_request_timeout_has_floor() {
        let cfg = PollerConfig {
            long_poll_timeout_secs: 0,
            ..PollerConfig::default()
        };
        assert_eq!(cfg.request_timeout(), Duration::from_secs(20));

        let cfg = PollerConfig {
            long_poll_timeout_secs: 30,
            ..PollerConfig::default()
        };
        assert_eq!(cfg.request_timeout(), Duration::from_secs(40));
    }

    #[test]
    fn lease_outlives_job_timeout() {
        let cfg = DeliveryConfig::default();
        assert!(cfg.lease() > cfg.job_timeout);
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        // SAFETY: the key is unique to this test; nothing else reads it.
        unsafe { std::env::set_var("BRIDGE_TEST_GARBAGE_U16", "not-a-number") };
        assert_eq!(env_or("BRIDGE_TEST_GARBAGE_U16", 7u16), 7);
        assert_eq!(env_or("BRIDGE_TEST_UNSET_KEY", 9u32), 9);
    }

    #[test]
    fn storage_subdirectories() {
        let mut cfg = BridgeConfig::from_env();
        cfg.storage_dir = PathBuf::from("/srv/bridge");
        assert_eq!(cfg.upload_dir(), PathBuf::from("/srv/bridge/telegram_uploads"));
        assert_eq!(cfg.temp_dir(), PathBuf::from("/srv/bridge/tmp"));
    }
}
