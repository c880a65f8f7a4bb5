//! Backend registry: health state and static capabilities for every
//! registered backend, plus the background health prober.
//!
//! All reads return snapshots; no mutable entry crosses a call boundary.
//! `thermal_throttled` has exactly one writer — the efficiency controller —
//! which reaches the registry through [`ThrottleCommand`] messages, never a
//! direct call. The registry reports health transitions on a broadcast
//! channel that the controller consumes through its own event loop.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::Backend;

/// Consecutive probe failures before a backend is marked unhealthy.
const UNHEALTHY_AFTER: u32 = 3;

/// Hard deadline on a single probe, above whatever the adapter enforces.
const PROBE_DEADLINE: Duration = Duration::from_secs(5);

/// Broadcast buffer for health transitions; slow subscribers lose stale
/// events rather than blocking the prober.
const HEALTH_EVENT_BUFFER: usize = 16;

/// Emitted whenever a backend's health flag flips.
#[derive(Debug, Clone)]
pub struct HealthEvent {
    pub backend_id: String,
    pub healthy: bool,
    pub reason: String,
}

/// Throttle instruction from the efficiency controller.
#[derive(Debug, Clone)]
pub struct ThrottleCommand {
    pub backend_id: String,
    pub throttled: bool,
}

struct Entry {
    backend: Arc<dyn Backend>,
    healthy: bool,
    thermal_throttled: bool,
    consecutive_failures: u32,
}

/// Read-only snapshot of one backend, safe to hold across awaits.
#[derive(Clone)]
pub struct BackendHandle {
    pub backend: Arc<dyn Backend>,
    pub healthy: bool,
    pub thermal_throttled: bool,
}

impl BackendHandle {
    pub fn id(&self) -> &str {
        &self.backend.spec().id
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendHandle")
            .field("id", &self.id())
            .field("healthy", &self.healthy)
            .field("thermal_throttled", &self.thermal_throttled)
            .finish()
    }
}

/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
    health_tx: broadcast::Sender<HealthEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (health_tx, _) = broadcast::channel(HEALTH_EVENT_BUFFER);
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            health_tx,
        }
    }

    /// Register a backend. Backends start healthy; the prober corrects that
    /// within one cadence if the daemon is down.
    pub fn register(&self, backend: Arc<dyn Backend>) {
        let id = backend.spec().id.clone();
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.contains_key(&id) {
            warn!(backend = %id, "Replacing already-registered backend");
        }
        info!(
            backend = %id,
            hardware = %backend.spec().hardware,
            power_watts = backend.spec().power_watts,
            "Backend registered"
        );
        inner.insert(
            id,
            Entry {
                backend,
                healthy: true,
                thermal_throttled: false,
                consecutive_failures: 0,
            },
        );
    }

    /// Snapshot of all backends, sorted by id for deterministic iteration.
    pub fn list(&self) -> Vec<BackendHandle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        let mut handles: Vec<BackendHandle> = inner
            .values()
            .map(|e| BackendHandle {
                backend: Arc::clone(&e.backend),
                healthy: e.healthy,
                thermal_throttled: e.thermal_throttled,
            })
            .collect();
        handles.sort_by(|a, b| a.id().cmp(b.id()));
        handles
    }

    pub fn get(&self, id: &str) -> Option<BackendHandle> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.get(id).map(|e| BackendHandle {
            backend: Arc::clone(&e.backend),
            healthy: e.healthy,
            thermal_throttled: e.thermal_throttled,
        })
    }

    /// Flip a backend's health flag. No-op (and no event) when the flag
    /// already has the requested value.
    pub fn set_healthy(&self, id: &str, healthy: bool, reason: &str) {
        let changed = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            match inner.get_mut(id) {
                Some(entry) if entry.healthy != healthy => {
                    entry.healthy = healthy;
                    if healthy {
                        entry.consecutive_failures = 0;
                    }
                    true
                }
                _ => false,
            }
        };

        if changed {
            if healthy {
                info!(backend = %id, reason, "Backend healthy");
            } else {
                warn!(backend = %id, reason, "Backend unhealthy");
            }
            let _ = self.health_tx.send(HealthEvent {
                backend_id: id.to_string(),
                healthy,
                reason: reason.to_string(),
            });
        }
    }

    /// Production writes arrive only through the throttle command channel;
    /// the efficiency controller is the single writer.
    pub(crate) fn set_thermal_throttled(&self, id: &str, throttled: bool) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if let Some(entry) = inner.get_mut(id) {
            if entry.thermal_throttled != throttled {
                entry.thermal_throttled = throttled;
                if throttled {
                    warn!(backend = %id, "Backend thermally throttled");
                } else {
                    info!(backend = %id, "Backend thermal throttle cleared");
                }
            }
        }
    }

    /// Subscribe to health transitions.
    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.health_tx.subscribe()
    }

    /// Record one probe outcome. Three consecutive failures flip the flag
    /// down; a single success restores it.
    fn record_probe(&self, id: &str, ok: bool, reason: &str) {
        let flip = {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            match inner.get_mut(id) {
                Some(entry) => {
                    if ok {
                        entry.consecutive_failures = 0;
                        !entry.healthy
                    } else {
                        entry.consecutive_failures += 1;
                        debug!(
                            backend = %id,
                            failures = entry.consecutive_failures,
                            "Health probe failed"
                        );
                        entry.healthy && entry.consecutive_failures >= UNHEALTHY_AFTER
                    }
                }
                None => false,
            }
        };

        if flip {
            if ok {
                self.set_healthy(id, true, "probe succeeded");
            } else {
                self.set_healthy(id, false, reason);
            }
        }
    }

    /// Spawn the health probe loop. One pass per cadence, with a small
    /// random jitter so several proxies on one box do not probe in phase.
    pub fn spawn_prober(&self, cadence: Duration) {
        let registry = self.clone();
        tokio::spawn(async move {
            let jitter = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(0..=cadence.as_millis().max(1) as u64 / 10))
            };
            tokio::time::sleep(jitter).await;

            let mut interval = tokio::time::interval(cadence);
            loop {
                interval.tick().await;
                registry.probe_all().await;
            }
        });
    }

    async fn probe_all(&self) {
        let backends: Vec<Arc<dyn Backend>> = {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner.values().map(|e| Arc::clone(&e.backend)).collect()
        };

        for backend in backends {
            let id = backend.spec().id.clone();
            match tokio::time::timeout(PROBE_DEADLINE, backend.health_check()).await {
                Ok(Ok(())) => self.record_probe(&id, true, ""),
                Ok(Err(e)) => self.record_probe(&id, false, &e.to_string()),
                Err(_) => self.record_probe(&id, false, "probe deadline exceeded"),
            }
        }
    }

    /// Spawn the task that applies throttle commands from the efficiency
    /// controller. Exits when the controller drops its sender.
    pub fn spawn_throttle_listener(&self, mut rx: mpsc::Receiver<ThrottleCommand>) {
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                registry.set_thermal_throttled(&cmd.backend_id, cmd.throttled);
            }
            debug!("Throttle command channel closed");
        });
    }
}
