//! Efficiency-mode controller: drives the six-mode state machine from
//! system-state events and manual requests, publishes the active routing
//! profile, and owns every `thermal_throttled` write.
//!
//! Mode state is process-wide but mediated entirely by this controller's
//! event loop; the rest of the system observes it through a `watch` channel
//! (profile) and a `broadcast` channel (transitions). Slow transition
//! subscribers lose stale events, never blocking the controller.

pub mod mode;
pub mod monitor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::backend::registry::{HealthEvent, ThrottleCommand};
use crate::backend::Hardware;
use mode::{auto_target, EfficiencyMode, ModeProfile, QuietHours};
use monitor::SystemState;

/// Consecutive cool ticks required before Quiet may be left.
const THERMAL_RECOVERY_TICKS: u32 = 1;

/// Thermal recovery threshold for leaving Quiet.
const THERMAL_RECOVERY_C: f64 = 75.0;

/// Battery level required before UltraEfficiency may be left.
const BATTERY_RECOVERY_LEVEL: f64 = 30.0;

/// Margin below the mode's thermal limit at which per-backend throttles
/// clear.
const THROTTLE_CLEAR_MARGIN_C: f64 = 5.0;

const TRANSITION_BUFFER: usize = 16;
const THROTTLE_BUFFER: usize = 32;

/// Emitted on every effective-mode change.
#[derive(Debug, Clone, Serialize)]
pub struct ModeTransition {
    pub from: EfficiencyMode,
    pub to: EfficiencyMode,
    pub reason: String,
}

struct ControllerState {
    /// What was requested: a concrete mode, or Auto.
    selected: EfficiencyMode,
    /// The concrete mode currently in force (never Auto).
    effective: EfficiencyMode,
    /// Consecutive evaluations with all known temps below the recovery
    /// threshold.
    cool_ticks: u32,
    /// Desired throttle flag per backend id, mirroring what was sent.
    throttled: HashMap<String, bool>,
    last_state: SystemState,
}

/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Clone)]
pub struct EfficiencyController {
    state: Arc<Mutex<ControllerState>>,
    /// Static backend inventory (id, hardware) captured at startup; the
    /// controller never calls back into the registry.
    inventory: Arc<Vec<(String, Hardware)>>,
    profile_tx: Arc<watch::Sender<ModeProfile>>,
    transition_tx: broadcast::Sender<ModeTransition>,
    throttle_tx: mpsc::Sender<ThrottleCommand>,
    quiet_hours: Option<QuietHours>,
}

impl EfficiencyController {
    /// Build the controller. The returned receiver carries throttle
    /// commands and belongs to the registry's listener task.
    pub fn new(
        initial: EfficiencyMode,
        quiet_hours: Option<QuietHours>,
        inventory: Vec<(String, Hardware)>,
    ) -> (Self, mpsc::Receiver<ThrottleCommand>) {
        let effective = match initial {
            EfficiencyMode::Auto => EfficiencyMode::Balanced,
            concrete => concrete,
        };
        let (profile_tx, _) = watch::channel(ModeProfile::for_mode(effective));
        let (transition_tx, _) = broadcast::channel(TRANSITION_BUFFER);
        let (throttle_tx, throttle_rx) = mpsc::channel(THROTTLE_BUFFER);

        let controller = Self {
            state: Arc::new(Mutex::new(ControllerState {
                selected: initial,
                effective,
                cool_ticks: 0,
                throttled: HashMap::new(),
                last_state: SystemState::default(),
            })),
            inventory: Arc::new(inventory),
            profile_tx: Arc::new(profile_tx),
            transition_tx,
            throttle_tx,
            quiet_hours,
        };
        (controller, throttle_rx)
    }

    /// The router's view of the active profile.
    pub fn profile(&self) -> watch::Receiver<ModeProfile> {
        self.profile_tx.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ModeTransition> {
        self.transition_tx.subscribe()
    }

    /// Current `(selected, effective)` pair.
    pub fn current(&self) -> (EfficiencyMode, EfficiencyMode) {
        let state = self.state.lock().expect("controller lock poisoned");
        (state.selected, state.effective)
    }

    /// Manual mode request. Selecting the already-selected mode is a no-op
    /// and emits nothing. Any concrete selection disables Auto until the
    /// next explicit `set_mode(Auto)`.
    pub fn set_mode(&self, requested: EfficiencyMode, reason: &str) {
        {
            let mut state = self.state.lock().expect("controller lock poisoned");
            if state.selected == requested {
                return;
            }
            state.selected = requested;
        }
        info!(mode = %requested, reason, "Mode selected");
        // Re-evaluate against the last known system state so a concrete
        // selection takes effect immediately and Auto resolves at once.
        let last = {
            let state = self.state.lock().expect("controller lock poisoned");
            state.last_state.clone()
        };
        self.observe(last);
    }

    /// Evaluate one system-state snapshot: resolve the target mode, apply
    /// hysteresis and quiet hours, publish transitions and re-derive
    /// per-backend throttle flags. This is the only mutation path.
    pub fn observe(&self, snapshot: SystemState) {
        let transition = {
            let mut state = self.state.lock().expect("controller lock poisoned");

            let (mut target, mut reason): (EfficiencyMode, &str) =
                if state.selected == EfficiencyMode::Auto {
                    let (t, r) = auto_target(&snapshot);
                    (t, r)
                } else {
                    (state.selected, "manual")
                };

            // Quiet-hours override (Auto only): forces Quiet unless the
            // battery rule already demanded UltraEfficiency.
            if state.selected == EfficiencyMode::Auto
                && target != EfficiencyMode::UltraEfficiency
            {
                if let Some(window) = &self.quiet_hours {
                    if window.contains(snapshot.time_of_day) {
                        target = EfficiencyMode::Quiet;
                        reason = "quiet-hours";
                    }
                }
            }

            // Recovery gated on an unknown sensor is a no-op: a missing
            // reading neither blocks nor triggers a transition.
            let cool = snapshot
                .max_temp()
                .map(|t| t < THERMAL_RECOVERY_C)
                .unwrap_or(true);

            if state.selected == EfficiencyMode::Auto {
                // Thermal recovery: leaving Quiet for a less conservative
                // mode requires sustained cool readings for a full tick.
                // A battery emergency is never held back.
                if state.effective == EfficiencyMode::Quiet
                    && target != EfficiencyMode::Quiet
                    && target != EfficiencyMode::UltraEfficiency
                    && (!cool || state.cool_ticks < THERMAL_RECOVERY_TICKS)
                {
                    target = EfficiencyMode::Quiet;
                    reason = "thermal-recovery-pending";
                }

                // Battery recovery: leaving UltraEfficiency requires the
                // level back at 30 (or mains power with the level gone
                // unreadable), unless a thermal emergency demands Quiet.
                let battery_recovered = match snapshot.battery_level {
                    Some(level) => level >= BATTERY_RECOVERY_LEVEL,
                    None => snapshot.on_battery == Some(false),
                };
                if state.effective == EfficiencyMode::UltraEfficiency
                    && target != EfficiencyMode::UltraEfficiency
                    && target != EfficiencyMode::Quiet
                    && !battery_recovered
                {
                    target = EfficiencyMode::UltraEfficiency;
                    reason = "battery-recovery-pending";
                }
            }

            state.cool_ticks = if cool { state.cool_ticks + 1 } else { 0 };
            state.last_state = snapshot.clone();

            if target != state.effective {
                let from = state.effective;
                state.effective = target;
                Some((from, target, reason.to_string()))
            } else {
                None
            }
        };

        if let Some((from, to, reason)) = transition {
            info!(old = %from, new = %to, reason = %reason, "Mode transition");
            self.profile_tx.send_replace(ModeProfile::for_mode(to));
            let _ = self.transition_tx.send(ModeTransition { from, to, reason });
        }

        self.apply_thermal_throttles(&snapshot);
    }

    /// Derive per-backend throttle flags from the snapshot and the active
    /// mode's thermal limit, and send commands for the deltas. Unknown
    /// temperatures change nothing.
    fn apply_thermal_throttles(&self, snapshot: &SystemState) {
        let limit = self.profile_tx.borrow().thermal_limit_c;
        let clear_below = limit - THROTTLE_CLEAR_MARGIN_C;

        let decide = |temp: Option<f64>| -> Option<bool> {
            match temp {
                Some(t) if t > limit => Some(true),
                Some(t) if t < clear_below => Some(false),
                _ => None,
            }
        };

        let cpu_decision = decide(snapshot.cpu_temp_c);
        let gpu_decision = decide(snapshot.gpu_temp_c);

        let mut commands = Vec::new();
        {
            let mut state = self.state.lock().expect("controller lock poisoned");
            for (id, hardware) in self.inventory.iter() {
                let decision = match hardware {
                    Hardware::Cpu | Hardware::Npu => cpu_decision,
                    Hardware::Igpu | Hardware::Nvidia => gpu_decision,
                };
                if let Some(throttle) = decision {
                    let current = state.throttled.get(id).copied().unwrap_or(false);
                    if current != throttle {
                        state.throttled.insert(id.clone(), throttle);
                        commands.push(ThrottleCommand {
                            backend_id: id.clone(),
                            throttled: throttle,
                        });
                    }
                }
            }
        }

        for cmd in commands {
            if self.throttle_tx.try_send(cmd.clone()).is_err() {
                warn!(backend = %cmd.backend_id, "Throttle channel full, command dropped");
            }
        }
    }

    /// Run the controller loop: re-evaluates on every monitor snapshot, at
    /// least once per tick, and drains registry health events.
    pub fn spawn(
        &self,
        mut state_rx: watch::Receiver<SystemState>,
        mut health_rx: broadcast::Receiver<HealthEvent>,
        tick: Duration,
    ) {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            let mut health_open = true;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let snapshot = state_rx.borrow().clone();
                        controller.observe(snapshot);
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = state_rx.borrow_and_update().clone();
                        controller.observe(snapshot);
                    }
                    event = health_rx.recv(), if health_open => {
                        match event {
                            Ok(e) => {
                                debug!(
                                    backend = %e.backend_id,
                                    healthy = e.healthy,
                                    reason = %e.reason,
                                    "Health change observed"
                                );
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "Health events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                health_open = false;
                            }
                        }
                    }
                }
            }
            debug!("Efficiency controller loop stopped");
        });
    }
}
