//! Efficiency modes and their routing profiles.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::backend::Hardware;
use crate::power::monitor::SystemState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EfficiencyMode {
    Performance,
    Balanced,
    Efficiency,
    Quiet,
    Auto,
    UltraEfficiency,
}

impl EfficiencyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            EfficiencyMode::Performance => "performance",
            EfficiencyMode::Balanced => "balanced",
            EfficiencyMode::Efficiency => "efficiency",
            EfficiencyMode::Quiet => "quiet",
            EfficiencyMode::Auto => "auto",
            EfficiencyMode::UltraEfficiency => "ultra_efficiency",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "performance" => Some(EfficiencyMode::Performance),
            "balanced" => Some(EfficiencyMode::Balanced),
            "efficiency" => Some(EfficiencyMode::Efficiency),
            "quiet" => Some(EfficiencyMode::Quiet),
            "auto" => Some(EfficiencyMode::Auto),
            "ultra_efficiency" | "ultraefficiency" | "ultra" => {
                Some(EfficiencyMode::UltraEfficiency)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for EfficiencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scoring weight triple `(latency, power, queue)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub latency: f64,
    pub power: f64,
    pub queue: f64,
}

/// Everything the router needs to know about the active mode. Always a
/// concrete mode; Auto resolves to one of the other five before a profile
/// is published.
#[derive(Debug, Clone, Serialize)]
pub struct ModeProfile {
    pub mode: EfficiencyMode,
    pub power_budget_watts: Option<f64>,
    pub weights: ScoreWeights,
    /// Per-backend throttling kicks in above this temperature.
    pub thermal_limit_c: f64,
    /// Hardware classes in preference order, used where scoring does not
    /// apply (pipeline stage resolution, status reporting).
    pub hardware_preference: &'static [Hardware],
    /// Admission cap on total in-flight requests, when the mode has one.
    pub concurrency_cap: Option<u32>,
}

impl ModeProfile {
    /// Profile table. `Auto` has no profile of its own; callers resolve it
    /// first.
    pub fn for_mode(mode: EfficiencyMode) -> ModeProfile {
        match mode {
            EfficiencyMode::Performance => ModeProfile {
                mode,
                power_budget_watts: None,
                weights: ScoreWeights {
                    latency: 3.0,
                    power: 0.0,
                    queue: 1.0,
                },
                thermal_limit_c: 90.0,
                hardware_preference: &[
                    Hardware::Nvidia,
                    Hardware::Igpu,
                    Hardware::Npu,
                    Hardware::Cpu,
                ],
                concurrency_cap: None,
            },
            EfficiencyMode::Balanced | EfficiencyMode::Auto => ModeProfile {
                mode: EfficiencyMode::Balanced,
                power_budget_watts: Some(20.0),
                weights: ScoreWeights {
                    latency: 1.5,
                    power: 1.0,
                    queue: 1.5,
                },
                thermal_limit_c: 85.0,
                hardware_preference: &[
                    Hardware::Igpu,
                    Hardware::Npu,
                    Hardware::Nvidia,
                    Hardware::Cpu,
                ],
                concurrency_cap: None,
            },
            EfficiencyMode::Efficiency => ModeProfile {
                mode,
                power_budget_watts: Some(15.0),
                weights: ScoreWeights {
                    latency: 0.5,
                    power: 2.5,
                    queue: 1.0,
                },
                thermal_limit_c: 85.0,
                hardware_preference: &[
                    Hardware::Npu,
                    Hardware::Igpu,
                    Hardware::Cpu,
                    Hardware::Nvidia,
                ],
                concurrency_cap: None,
            },
            EfficiencyMode::Quiet => ModeProfile {
                mode,
                power_budget_watts: Some(15.0),
                weights: ScoreWeights {
                    latency: 0.5,
                    power: 2.0,
                    queue: 1.0,
                },
                thermal_limit_c: 75.0,
                hardware_preference: &[
                    Hardware::Npu,
                    Hardware::Igpu,
                    Hardware::Cpu,
                    Hardware::Nvidia,
                ],
                concurrency_cap: None,
            },
            EfficiencyMode::UltraEfficiency => ModeProfile {
                mode,
                power_budget_watts: Some(10.0),
                weights: ScoreWeights {
                    latency: 0.0,
                    power: 3.0,
                    queue: 1.0,
                },
                thermal_limit_c: 85.0,
                hardware_preference: &[
                    Hardware::Npu,
                    Hardware::Cpu,
                    Hardware::Igpu,
                    Hardware::Nvidia,
                ],
                concurrency_cap: Some(2),
            },
        }
    }
}

/// Local-time window during which Quiet is forced (wraps midnight).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t < self.end
        } else {
            // Window wraps midnight, e.g. 22:00-07:00.
            t >= self.start || t < self.end
        }
    }
}

/// Auto's base decision, before hysteresis and quiet hours. Returns the
/// target mode and a reason tag. Rules gated on unknown sensor fields are
/// skipped rather than guessed.
pub fn auto_target(state: &SystemState) -> (EfficiencyMode, &'static str) {
    let on_battery = state.on_battery;
    let battery = state.battery_level;

    if on_battery == Some(true) {
        if let Some(level) = battery {
            if level < 20.0 {
                return (EfficiencyMode::UltraEfficiency, "battery-critical");
            }
        }
    }

    if let Some(temp) = state.max_temp() {
        if temp > 85.0 {
            return (EfficiencyMode::Quiet, "thermal-high");
        }
    }

    if on_battery == Some(false) {
        if let Some(level) = battery {
            if level >= 80.0 {
                return (EfficiencyMode::Performance, "ac-battery-full");
            }
        }
        return (EfficiencyMode::Balanced, "ac-power");
    }

    match battery {
        Some(level) if level >= 50.0 => (EfficiencyMode::Balanced, "battery-ok"),
        Some(_) => (EfficiencyMode::Efficiency, "battery-low"),
        None => (EfficiencyMode::Balanced, "sensors-unknown"),
    }
}
