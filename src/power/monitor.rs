//! System-state monitor: battery, AC, CPU/GPU temperature and fan RPM read
//! from sysfs. Sensors are auto-detected once at startup; a missing sensor
//! leaves its field unset and is never an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

/// Thermal zone names that count as the CPU package sensor.
const CPU_ZONE_NAMES: &[&str] = &[
    "x86_pkg_temp",
    "cpu_thermal",
    "k10temp",
    "soc_thermal",
    "acpitz",
];

/// hwmon names that count as the GPU sensor.
const GPU_HWMON_NAMES: &[&str] = &["amdgpu", "nouveau", "i915", "xe", "nvidia"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    Normal,
    Elevated,
    High,
    Critical,
}

/// Snapshot of the machine's power and thermal situation. Every sensor
/// field is optional; consumers gate decisions on presence.
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub battery_level: Option<f64>,
    pub on_battery: Option<bool>,
    pub cpu_temp_c: Option<f64>,
    pub gpu_temp_c: Option<f64>,
    pub fan_rpm: Option<u32>,
    pub thermal_state: ThermalState,
    pub time_of_day: NaiveTime,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            battery_level: None,
            on_battery: None,
            cpu_temp_c: None,
            gpu_temp_c: None,
            fan_rpm: None,
            thermal_state: ThermalState::Normal,
            time_of_day: chrono::Local::now().time(),
        }
    }
}

impl SystemState {
    /// Hottest known temperature, if any sensor reported one.
    pub fn max_temp(&self) -> Option<f64> {
        match (self.cpu_temp_c, self.gpu_temp_c) {
            (Some(c), Some(g)) => Some(c.max(g)),
            (Some(c), None) => Some(c),
            (None, Some(g)) => Some(g),
            (None, None) => None,
        }
    }

    fn derive_thermal(max_temp: Option<f64>) -> ThermalState {
        match max_temp {
            Some(t) if t >= 90.0 => ThermalState::Critical,
            Some(t) if t >= 80.0 => ThermalState::High,
            Some(t) if t >= 70.0 => ThermalState::Elevated,
            _ => ThermalState::Normal,
        }
    }
}

/// Resolved sysfs file paths, detected once at startup.
#[derive(Debug, Default, Clone)]
struct SensorPaths {
    battery_capacity: Option<PathBuf>,
    battery_status: Option<PathBuf>,
    cpu_temp: Option<PathBuf>,
    gpu_temp: Option<PathBuf>,
    fan: Option<PathBuf>,
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn read_f64(path: &Path) -> Option<f64> {
    read_trimmed(path)?.parse().ok()
}

impl SensorPaths {
    /// Probe the sysfs tree under `root` (normally `/sys`).
    fn detect(root: &Path) -> Self {
        let mut paths = SensorPaths::default();

        // Battery: first power_supply of type "Battery".
        if let Ok(entries) = std::fs::read_dir(root.join("class/power_supply")) {
            for entry in entries.flatten() {
                let dir = entry.path();
                if read_trimmed(&dir.join("type")).as_deref() == Some("Battery") {
                    paths.battery_capacity = Some(dir.join("capacity"));
                    paths.battery_status = Some(dir.join("status"));
                    break;
                }
            }
        }

        // CPU: first thermal zone with a recognized type.
        if let Ok(entries) = std::fs::read_dir(root.join("class/thermal")) {
            for entry in entries.flatten() {
                let dir = entry.path();
                if let Some(zone_type) = read_trimmed(&dir.join("type")) {
                    if CPU_ZONE_NAMES.iter().any(|n| zone_type.starts_with(n)) {
                        paths.cpu_temp = Some(dir.join("temp"));
                        break;
                    }
                }
            }
        }

        // GPU temp + fan RPM via hwmon, vendor-specific channel names.
        if let Ok(entries) = std::fs::read_dir(root.join("class/hwmon")) {
            for entry in entries.flatten() {
                let dir = entry.path();
                let name = read_trimmed(&dir.join("name")).unwrap_or_default();
                if paths.gpu_temp.is_none() && GPU_HWMON_NAMES.contains(&name.as_str()) {
                    let temp = dir.join("temp1_input");
                    if temp.exists() {
                        paths.gpu_temp = Some(temp);
                    }
                }
                if paths.fan.is_none() {
                    let fan = dir.join("fan1_input");
                    if fan.exists() {
                        paths.fan = Some(fan);
                    }
                }
            }
        }

        info!(
            battery = paths.battery_capacity.is_some(),
            cpu_temp = paths.cpu_temp.is_some(),
            gpu_temp = paths.gpu_temp.is_some(),
            fan = paths.fan.is_some(),
            "Sensor detection complete"
        );
        paths
    }
}

/// Polls the detected sensors and publishes snapshots on a watch channel.
#[derive(Debug, Clone)]
pub struct SystemMonitor {
    paths: SensorPaths,
    tx: watch::Sender<SystemState>,
}

impl SystemMonitor {
    /// Detect sensors under `root` (tests point this at a fake tree).
    pub fn new(root: &Path) -> Self {
        let paths = SensorPaths::detect(root);
        let (tx, _) = watch::channel(SystemState::default());
        Self { paths, tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SystemState> {
        self.tx.subscribe()
    }

    /// Read every detected sensor once. Missing or unreadable sensors
    /// yield `None` fields.
    pub fn sample(&self) -> SystemState {
        let battery_level = self
            .paths
            .battery_capacity
            .as_deref()
            .and_then(read_f64)
            .filter(|v| (0.0..=100.0).contains(v));

        let on_battery = self
            .paths
            .battery_status
            .as_deref()
            .and_then(read_trimmed)
            .and_then(|s| match s.as_str() {
                "Discharging" => Some(true),
                "Charging" | "Full" | "Not charging" => Some(false),
                _ => None,
            });

        // Thermal zone and hwmon values are in millidegrees.
        let cpu_temp_c = self.paths.cpu_temp.as_deref().and_then(read_f64).map(|v| v / 1000.0);
        let gpu_temp_c = self.paths.gpu_temp.as_deref().and_then(read_f64).map(|v| v / 1000.0);

        let fan_rpm = self
            .paths
            .fan
            .as_deref()
            .and_then(read_trimmed)
            .and_then(|s| s.parse().ok());

        let mut state = SystemState {
            battery_level,
            on_battery,
            cpu_temp_c,
            gpu_temp_c,
            fan_rpm,
            thermal_state: ThermalState::Normal,
            time_of_day: chrono::Local::now().time(),
        };
        state.thermal_state = SystemState::derive_thermal(state.max_temp());
        state
    }

    /// Publish one snapshot now, then one per poll interval.
    pub fn spawn_poller(&self, poll_interval: Duration) {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                interval.tick().await;
                let state = monitor.sample();
                debug!(
                    battery = ?state.battery_level,
                    on_battery = ?state.on_battery,
                    cpu_temp = ?state.cpu_temp_c,
                    gpu_temp = ?state.gpu_temp_c,
                    "System state sampled"
                );
                let _ = monitor.tx.send(state);
            }
        });
    }

    /// Inject a snapshot directly (tests and external signal sources).
    pub fn publish(&self, state: SystemState) {
        let _ = self.tx.send(state);
    }
}
