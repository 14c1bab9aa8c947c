use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Duration;
use proctor_core::{ComparatorKind, IdentityCheck, MonitorConfig, SessionPolicy, VerifyConfig};

/// Largest millisecond count a `chrono::Duration` holds.
const MAX_DURATION_MS: u64 = i64::MAX as u64;
/// Largest second count a `chrono::Duration` holds.
const MAX_DURATION_SECS: u64 = MAX_DURATION_MS / 1000;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database file (`:memory:` for an ephemeral store).
    pub db_path: PathBuf,
    /// Statistical comparison strategy for verification and movement.
    pub comparator: ComparatorKind,
    /// Best-candidate similarity needed for a verification match.
    pub verify_threshold: f64,
    /// Fingerprint similarity needed for an identity-monitoring match.
    pub monitor_threshold: f64,
    /// Whether targeted verification scans every record or only the target.
    pub identity_check: IdentityCheck,
    /// Whether registration synthesizes pose/lighting variations.
    pub generate_variations: bool,
    pub movement_threshold: f64,
    pub movement_max_consecutive: f64,
    pub movement_history: usize,
    pub movement_alpha: f64,
    pub movement_debounce_ms: u64,
    /// Session-table size that triggers idle-session eviction.
    pub session_cap: usize,
    /// Idle seconds after which a monitoring session may be evicted.
    pub session_retention_secs: u64,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `PROCTOR_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("proctor");

        let db_path = std::env::var("PROCTOR_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces.db"));

        let verify = VerifyConfig::default();
        let monitor = MonitorConfig::default();
        let sessions = SessionPolicy::default();

        Self {
            db_path,
            comparator: env_parse("PROCTOR_COMPARATOR", ComparatorKind::default()),
            verify_threshold: env_parse("PROCTOR_VERIFY_THRESHOLD", verify.threshold),
            monitor_threshold: env_parse("PROCTOR_MONITOR_THRESHOLD", verify.monitor_threshold),
            identity_check: env_parse("PROCTOR_IDENTITY_CHECK", verify.identity_check),
            generate_variations: std::env::var("PROCTOR_GENERATE_VARIATIONS")
                .map(|v| v != "0")
                .unwrap_or(verify.generate_variations),
            movement_threshold: env_parse("PROCTOR_MOVEMENT_THRESHOLD", monitor.threshold),
            movement_max_consecutive: env_parse(
                "PROCTOR_MOVEMENT_MAX_CONSECUTIVE",
                monitor.max_consecutive,
            ),
            movement_history: env_parse("PROCTOR_MOVEMENT_HISTORY", monitor.history),
            movement_alpha: env_parse("PROCTOR_MOVEMENT_ALPHA", monitor.alpha),
            movement_debounce_ms: env_parse(
                "PROCTOR_MOVEMENT_DEBOUNCE_MS",
                monitor.debounce.num_milliseconds().max(0) as u64,
            ),
            session_cap: env_parse("PROCTOR_SESSION_CAP", sessions.capacity),
            session_retention_secs: env_parse(
                "PROCTOR_SESSION_RETENTION_SECS",
                sessions.retention.num_seconds().max(0) as u64,
            ),
            session_bus: std::env::var("PROCTOR_SESSION_BUS").is_ok(),
        }
    }

    pub fn verify_config(&self) -> VerifyConfig {
        VerifyConfig {
            threshold: self.verify_threshold,
            monitor_threshold: self.monitor_threshold,
            identity_check: self.identity_check,
            generate_variations: self.generate_variations,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            threshold: self.movement_threshold,
            max_consecutive: self.movement_max_consecutive,
            history: self.movement_history.max(1),
            alpha: self.movement_alpha.clamp(0.0, 1.0),
            debounce: millis(self.movement_debounce_ms),
        }
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            capacity: self.session_cap.max(1),
            retention: seconds(self.session_retention_secs),
        }
    }
}

/// Read and parse a setting, warning and falling back on bad input.
fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    parse_setting(key, std::env::var(key).ok().as_deref(), default)
}

fn parse_setting<T>(key: &str, raw: Option<&str>, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = raw else {
        return default;
    };
    raw.trim().parse().unwrap_or_else(|e: T::Err| {
        tracing::warn!(key, value = %raw, error = %e, "ignoring invalid setting");
        default
    })
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_DURATION_MS) as i64)
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}
