use anyhow::{Context, Result};
use chrono::NaiveTime;

use crate::backend::BackendSpec;
use crate::power::mode::{EfficiencyMode, QuietHours};

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP bind address (REST + WebSocket)
    pub listen_addr: String,

    /// gRPC bind address
    pub grpc_listen_addr: String,

    /// Path to the JSON file describing the backend pool
    pub backends_path: Option<String>,

    /// Mode selected at startup (env: DEFAULT_MODE, default: auto)
    pub default_mode: EfficiencyMode,

    /// Quiet-hours window, e.g. "22:00-07:00" (env: QUIET_HOURS)
    pub quiet_hours: Option<QuietHours>,

    /// Health probe cadence in seconds (env: HEALTH_PROBE_SECS)
    pub health_probe_secs: u64,

    /// System-state poll cadence in seconds (env: POLL_INTERVAL_SECS)
    pub poll_interval_secs: u64,

    /// Root of the sysfs tree; overridable for testing (env: SENSOR_ROOT)
    pub sensor_root: String,

    /// Extra CORS origin allowed to call the REST surface
    pub cors_allow_origin: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let quiet_hours = match std::env::var("QUIET_HOURS") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                parse_quiet_hours(&raw)
                    .with_context(|| format!("invalid QUIET_HOURS value '{raw}'"))?,
            ),
            _ => None,
        };

        let default_mode = match std::env::var("DEFAULT_MODE") {
            Ok(raw) => EfficiencyMode::parse(&raw)
                .with_context(|| format!("invalid DEFAULT_MODE value '{raw}'"))?,
            Err(_) => EfficiencyMode::Auto,
        };

        Ok(Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:8085".into()),
            grpc_listen_addr: std::env::var("GRPC_LISTEN_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:50061".into()),
            backends_path: std::env::var("BACKENDS_PATH").ok().filter(|s| !s.is_empty()),
            default_mode,
            quiet_hours,
            health_probe_secs: std::env::var("HEALTH_PROBE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            poll_interval_secs: std::env::var("POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            sensor_root: std::env::var("SENSOR_ROOT").unwrap_or_else(|_| "/sys".into()),
            cors_allow_origin: std::env::var("CORS_ALLOW_ORIGIN").ok(),
        })
    }
}

/// Parse a `HH:MM-HH:MM` window. The window may wrap midnight.
pub fn parse_quiet_hours(raw: &str) -> Result<QuietHours> {
    let (start, end) = raw
        .trim()
        .split_once('-')
        .context("expected 'HH:MM-HH:MM'")?;
    let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").context("bad start time")?;
    let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").context("bad end time")?;
    Ok(QuietHours { start, end })
}

/// Load the backend pool description from a JSON array of specs.
pub fn load_backend_specs(path: &str) -> Result<Vec<BackendSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read backends file '{path}'"))?;
    let specs: Vec<BackendSpec> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse backends file '{path}'"))?;
    Ok(specs)
}
