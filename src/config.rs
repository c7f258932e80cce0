// ============================================================================
// CONFIG - environment-driven configuration for the controller process
// ============================================================================

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// How presence refresh sweeps get triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRefreshMode {
    /// Sweeps run only when an operator asks for one
    Manual,
    /// A background loop additionally attempts periodic normal-mode sweeps
    Timed,
}

/// Invalid or inconsistent configuration, reported at load time.
#[derive(Debug)]
pub struct ConfigError {
    message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// All knobs the presence core recognizes. Loaded once in `main` and handed
/// to constructors; nothing reads the environment after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// A CPE counts as online while `now - lastSeen` stays within this window
    pub online_timeout_ms: i64,
    /// A CPE that informed within this window is still booting
    pub boot_threshold_ms: i64,
    /// Devices processed per sweep batch
    pub refresh_batch_size: usize,
    pub status_refresh_mode: StatusRefreshMode,
    /// Interval between timed-mode sweep attempts
    pub timed_refresh_interval_ms: u64,
    /// UDP port the wake listener binds
    pub wake_listen_port: u16,
    /// Controller endpoint CPEs report to
    pub acs_ip: IpAddr,
    pub acs_port: u16,
    /// Controller address advertised inside wakeup messages
    pub acs_url: String,
    /// How long a sweep batch waits for probe replies to land
    pub probe_wait_ms: u64,
    /// Normal-mode sweeps are rejected this soon after the previous one
    pub normal_mode_cooldown_ms: i64,
    /// Task store write retries before a sweep gives up
    pub store_retry_limit: u32,
    pub store_retry_backoff_ms: u64,
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            online_timeout_ms: 300_000,
            boot_threshold_ms: 60_000,
            refresh_batch_size: 50,
            status_refresh_mode: StatusRefreshMode::Manual,
            timed_refresh_interval_ms: 300_000,
            wake_listen_port: 7548,
            acs_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            acs_port: 7548,
            acs_url: "ws://localhost:7547".to_string(),
            probe_wait_ms: 1_000,
            normal_mode_cooldown_ms: 300_000,
            store_retry_limit: 3,
            store_retry_backoff_ms: 100,
            database_url: "sqlite:data/presence.db?mode=rwc".to_string(),
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, fallback: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError {
            message: format!("invalid value for {}: {}", key, raw),
        }),
        Err(_) => Ok(fallback),
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let status_refresh_mode = match std::env::var("STATUS_REFRESH_MODE") {
            Ok(raw) => match raw.as_str() {
                "manual" => StatusRefreshMode::Manual,
                "timed" => StatusRefreshMode::Timed,
                other => {
                    return Err(ConfigError {
                        message: format!(
                            "invalid STATUS_REFRESH_MODE: {} (expected manual or timed)",
                            other
                        ),
                    })
                }
            },
            Err(_) => defaults.status_refresh_mode,
        };

        let config = Config {
            online_timeout_ms: env_parsed("ONLINE_TIMEOUT_MS", defaults.online_timeout_ms)?,
            boot_threshold_ms: env_parsed("BOOT_THRESHOLD_MS", defaults.boot_threshold_ms)?,
            refresh_batch_size: env_parsed("REFRESH_BATCH_SIZE", defaults.refresh_batch_size)?,
            status_refresh_mode,
            timed_refresh_interval_ms: env_parsed(
                "TIMED_REFRESH_INTERVAL_MS",
                defaults.timed_refresh_interval_ms,
            )?,
            wake_listen_port: env_parsed("WAKE_LISTEN_PORT", defaults.wake_listen_port)?,
            acs_ip: env_parsed("ACS_IP", defaults.acs_ip)?,
            acs_port: env_parsed("ACS_PORT", defaults.acs_port)?,
            acs_url: std::env::var("ACS_URL").unwrap_or(defaults.acs_url),
            probe_wait_ms: env_parsed("PROBE_WAIT_MS", defaults.probe_wait_ms)?,
            normal_mode_cooldown_ms: env_parsed(
                "NORMAL_MODE_COOLDOWN_MS",
                defaults.normal_mode_cooldown_ms,
            )?,
            store_retry_limit: env_parsed("STORE_RETRY_LIMIT", defaults.store_retry_limit)?,
            store_retry_backoff_ms: env_parsed(
                "STORE_RETRY_BACKOFF_MS",
                defaults.store_retry_backoff_ms,
            )?,
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
        };

        config.validate()?;
        Ok(config)
    }

    /// The status calculator assumes booting is a sub-window of online.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.boot_threshold_ms >= self.online_timeout_ms {
            return Err(ConfigError {
                message: format!(
                    "BOOT_THRESHOLD_MS ({}) must be smaller than ONLINE_TIMEOUT_MS ({})",
                    self.boot_threshold_ms, self.online_timeout_ms
                ),
            });
        }
        if self.refresh_batch_size == 0 {
            return Err(ConfigError {
                message: "REFRESH_BATCH_SIZE must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
