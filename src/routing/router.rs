//! Backend selection: filter the registry down to viable candidates, score
//! the survivors, pick the best, record the decision.
//!
//! The engine is stateless across calls; everything it consults lives in
//! the registry, the queue manager and the active mode profile. Callers own
//! the `mark_start`/`mark_end` lifecycle around the backend invocation.

use std::cmp::Ordering;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use super::annotations::{Annotations, Priority};
use super::history::{DecisionRing, RecordedDecision};
use super::queue::QueueManager;
use crate::backend::registry::{BackendHandle, Registry};
use crate::backend::Operation;
use crate::error::ProxyError;
use crate::power::mode::ModeProfile;

/// Queue penalty per unit of weighted depth.
const QUEUE_PENALTY_PER_DEPTH: f64 = 50.0;

/// Base score per point of operator priority.
const BASE_PER_PRIORITY: f64 = 10.0;

/// Max alternatives echoed back to the client.
const MAX_ALTERNATIVES: usize = 3;

/// The filter that removed a candidate; `NoAvailableBackends` names the one
/// that eliminated the last candidate standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    NoneRegistered,
    Unhealthy,
    TargetMismatch,
    LatencyBudget,
    PowerBudget,
    ModePowerBudget,
    ModelUnsupported,
    CapabilityMissing,
    ThermalThrottled,
    Excluded,
}

impl std::fmt::Display for FilterStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            FilterStage::NoneRegistered => "none_registered",
            FilterStage::Unhealthy => "unhealthy",
            FilterStage::TargetMismatch => "target_mismatch",
            FilterStage::LatencyBudget => "latency_budget",
            FilterStage::PowerBudget => "power_budget",
            FilterStage::ModePowerBudget => "mode_power_budget",
            FilterStage::ModelUnsupported => "model_unsupported",
            FilterStage::CapabilityMissing => "capability_missing",
            FilterStage::ThermalThrottled => "thermal_throttled",
            FilterStage::Excluded => "excluded",
        };
        f.write_str(tag)
    }
}

/// The outcome of one routing call, echoed to the client.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub backend: BackendHandle,
    pub reason: &'static str,
    pub estimated_latency_ms: f64,
    pub estimated_power_w: f64,
    pub alternatives: Vec<String>,
    pub queue_depth: u32,
    pub score: f64,
}

struct Candidate {
    handle: BackendHandle,
    score: f64,
    weighted_depth: u32,
    pending: u32,
    priority: i32,
}

/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Clone)]
pub struct RoutingEngine {
    registry: Registry,
    queues: QueueManager,
    profile: watch::Receiver<ModeProfile>,
    history: DecisionRing,
}

impl RoutingEngine {
    pub fn new(
        registry: Registry,
        queues: QueueManager,
        profile: watch::Receiver<ModeProfile>,
        history: DecisionRing,
    ) -> Self {
        Self {
            registry,
            queues,
            profile,
            history,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub fn history(&self) -> &DecisionRing {
        &self.history
    }

    /// The profile requests are currently routed under.
    pub fn active_profile(&self) -> ModeProfile {
        self.profile.borrow().clone()
    }

    /// Select a backend for one request.
    pub fn route(
        &self,
        model: &str,
        op: Operation,
        annotations: &Annotations,
    ) -> Result<RoutingDecision, ProxyError> {
        self.route_excluding(model, op, annotations, &[])
    }

    /// One-shot re-route that excludes already-failed backends and otherwise
    /// reuses the original annotations.
    pub fn fallback(
        &self,
        model: &str,
        op: Operation,
        annotations: &Annotations,
        failed: &[String],
    ) -> Result<RoutingDecision, ProxyError> {
        info!(model, excluded = ?failed, "Fallback routing");
        self.route_excluding(model, op, annotations, failed)
    }

    fn route_excluding(
        &self,
        model: &str,
        op: Operation,
        annotations: &Annotations,
        excluded: &[String],
    ) -> Result<RoutingDecision, ProxyError> {
        let profile = self.profile.borrow().clone();

        if let Some(target) = &annotations.target {
            if self.registry.get(target).is_none() {
                return Err(ProxyError::TargetNotFound(target.clone()));
            }
        }

        let handles = self.registry.list();
        if handles.is_empty() {
            return Err(ProxyError::NoAvailableBackends {
                filter: FilterStage::NoneRegistered,
            });
        }

        let priority = annotations.effective_priority();
        let mut candidates: Vec<Candidate> = Vec::with_capacity(handles.len());
        let mut last_drop = FilterStage::NoneRegistered;
        let mut drops: Vec<FilterStage> = Vec::new();
        let mut thermal_dropped = false;

        for handle in handles {
            if let Some(stage) = self.filter(&handle, model, op, annotations, &profile, excluded) {
                if stage == FilterStage::ThermalThrottled {
                    thermal_dropped = true;
                }
                last_drop = stage;
                drops.push(stage);
                continue;
            }

            let spec = handle.backend.spec();
            let avg_latency = handle.backend.get_metrics().avg_latency_ms;
            let weighted_depth = self.queues.weighted_depth(&spec.id, priority);

            let mut score = spec.priority as f64 * BASE_PER_PRIORITY;
            if annotations.latency_critical || profile.weights.latency > 0.0 {
                score += (1000.0 - avg_latency.clamp(0.0, 1000.0)) * profile.weights.latency;
            }
            if annotations.prefer_power_efficiency || profile.weights.power > 0.0 {
                score += (1000.0 - (spec.power_watts * 10.0).min(1000.0)) * profile.weights.power;
            }
            score -= weighted_depth as f64 * QUEUE_PENALTY_PER_DEPTH * profile.weights.queue;
            score += priority.boost();

            candidates.push(Candidate {
                pending: self.queues.depth(&spec.id),
                priority: spec.priority,
                handle,
                score,
                weighted_depth,
            });
        }

        if candidates.is_empty() {
            if !drops.is_empty() && drops.iter().all(|s| *s == FilterStage::ModelUnsupported) {
                return Err(ProxyError::ModelNotFound(model.to_string()));
            }
            return Err(ProxyError::NoAvailableBackends { filter: last_drop });
        }

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.pending.cmp(&b.pending))
                .then_with(|| a.handle.id().cmp(b.handle.id()))
        });

        let reason = self.reason(annotations, &profile, &candidates, thermal_dropped);
        let alternatives: Vec<String> = candidates[1..]
            .iter()
            .take(MAX_ALTERNATIVES)
            .map(|c| c.handle.id().to_string())
            .collect();

        let chosen = &candidates[0];
        let spec = chosen.handle.backend.spec();
        let decision = RoutingDecision {
            backend: chosen.handle.clone(),
            reason,
            estimated_latency_ms: chosen.handle.backend.get_metrics().avg_latency_ms,
            estimated_power_w: spec.power_watts,
            alternatives,
            queue_depth: chosen.pending,
            score: chosen.score,
        };

        debug!(
            model,
            backend = %spec.id,
            reason,
            score = decision.score,
            queue_depth = decision.queue_depth,
            "Routing decision"
        );

        self.history.push(RecordedDecision {
            timestamp: chrono::Utc::now(),
            request_id: annotations.request_id.clone(),
            model: model.to_string(),
            backend_id: spec.id.clone(),
            reason: reason.to_string(),
            score: decision.score,
            queue_depth: decision.queue_depth,
            alternatives: decision.alternatives.clone(),
            mode: profile.mode.as_str().to_string(),
        });

        Ok(decision)
    }

    /// Apply the filter chain; `Some(stage)` names the filter that dropped
    /// this backend.
    fn filter(
        &self,
        handle: &BackendHandle,
        model: &str,
        op: Operation,
        annotations: &Annotations,
        profile: &ModeProfile,
        excluded: &[String],
    ) -> Option<FilterStage> {
        let spec = handle.backend.spec();

        if excluded.iter().any(|id| id == &spec.id) {
            return Some(FilterStage::Excluded);
        }
        if !handle.healthy {
            return Some(FilterStage::Unhealthy);
        }
        if let Some(target) = &annotations.target {
            if target != &spec.id {
                return Some(FilterStage::TargetMismatch);
            }
        }
        if let Some(max_latency) = annotations.max_latency_ms {
            if handle.backend.get_metrics().avg_latency_ms > max_latency {
                return Some(FilterStage::LatencyBudget);
            }
        }
        if let Some(max_power) = annotations.max_power_watts {
            if spec.power_watts > max_power {
                return Some(FilterStage::PowerBudget);
            }
        }
        if let Some(budget) = profile.power_budget_watts {
            if spec.power_watts > budget {
                return Some(FilterStage::ModePowerBudget);
            }
        }
        if !handle.backend.supports_model(model) {
            return Some(FilterStage::ModelUnsupported);
        }
        if !spec.capabilities.supports(op) {
            return Some(FilterStage::CapabilityMissing);
        }
        if handle.thermal_throttled {
            return Some(FilterStage::ThermalThrottled);
        }
        None
    }

    /// Tag naming the dominant selection factor.
    fn reason(
        &self,
        annotations: &Annotations,
        profile: &ModeProfile,
        candidates: &[Candidate],
        thermal_dropped: bool,
    ) -> &'static str {
        if annotations.target.is_some() {
            "target-backend"
        } else if annotations.effective_priority() == Priority::Critical
            && candidates.iter().any(|c| c.weighted_depth > 0)
        {
            "critical-priority-low-queue"
        } else if annotations.latency_critical {
            "latency-critical"
        } else if annotations.prefer_power_efficiency
            || profile.weights.power > profile.weights.latency
        {
            "power-efficient"
        } else if thermal_dropped {
            "thermal-fallback"
        } else {
            "balanced"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::scripted::ScriptedBackend;
    use crate::backend::CapabilitySet;
    use crate::power::mode::EfficiencyMode;
    use std::sync::Arc;

    struct Harness {
        engine: RoutingEngine,
        registry: Registry,
        queues: QueueManager,
        profile_tx: watch::Sender<ModeProfile>,
    }

    fn harness(mode: EfficiencyMode) -> Harness {
        let registry = Registry::new();
        let queues = QueueManager::new();
        let (profile_tx, profile_rx) = watch::channel(ModeProfile::for_mode(mode));
        let engine = RoutingEngine::new(
            registry.clone(),
            queues.clone(),
            profile_rx,
            DecisionRing::default(),
        );
        Harness {
            engine,
            registry,
            queues,
            profile_tx,
        }
    }

    fn default_annotations() -> Annotations {
        Annotations::default()
    }

    #[test]
    fn empty_registry_reports_none_registered() {
        let h = harness(EfficiencyMode::Balanced);
        let err = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap_err();
        match err {
            ProxyError::NoAvailableBackends { filter } => {
                assert_eq!(filter, FilterStage::NoneRegistered)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unhealthy_backends_never_selected() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry.register(Arc::new(ScriptedBackend::named("a")));
        h.registry.register(Arc::new(ScriptedBackend::named("b")));
        h.registry.set_healthy("a", false, "down");

        let decision = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(decision.backend.id(), "b");
        assert!(decision.alternatives.is_empty());
    }

    #[test]
    fn all_unhealthy_reports_last_filter() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry.register(Arc::new(ScriptedBackend::named("a")));
        h.registry.set_healthy("a", false, "down");

        let err = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap_err();
        match err {
            ProxyError::NoAvailableBackends { filter } => {
                assert_eq!(filter, FilterStage::Unhealthy)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_target_is_target_not_found() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry.register(Arc::new(ScriptedBackend::named("a")));
        let ann = Annotations {
            target: Some("ghost".into()),
            ..default_annotations()
        };
        assert!(matches!(
            h.engine.route("m", Operation::Generate, &ann),
            Err(ProxyError::TargetNotFound(_))
        ));
    }

    #[test]
    fn explicit_target_wins_with_reason() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry
            .register(Arc::new(ScriptedBackend::named("slow").with_latency(900.0)));
        h.registry
            .register(Arc::new(ScriptedBackend::named("fast").with_latency(50.0)));

        let ann = Annotations {
            target: Some("slow".into()),
            ..default_annotations()
        };
        let decision = h.engine.route("m", Operation::Generate, &ann).unwrap();
        assert_eq!(decision.backend.id(), "slow");
        assert_eq!(decision.reason, "target-backend");
    }

    #[test]
    fn latency_budget_filters_slow_backends() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry
            .register(Arc::new(ScriptedBackend::named("slow").with_latency(800.0)));
        h.registry
            .register(Arc::new(ScriptedBackend::named("fast").with_latency(90.0)));

        let ann = Annotations {
            max_latency_ms: Some(100.0),
            ..default_annotations()
        };
        let decision = h.engine.route("m", Operation::Generate, &ann).unwrap();
        assert_eq!(decision.backend.id(), "fast");
    }

    #[test]
    fn mode_power_budget_excludes_hungry_backends() {
        let h = harness(EfficiencyMode::Efficiency); // 15 W budget
        h.registry
            .register(Arc::new(ScriptedBackend::named("nvidia").with_power(55.0)));
        h.registry
            .register(Arc::new(ScriptedBackend::named("npu").with_power(3.0)));

        let decision = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(decision.backend.id(), "npu");
        assert_eq!(decision.reason, "power-efficient");
    }

    #[test]
    fn capability_filter_drops_non_embedding_backends() {
        let h = harness(EfficiencyMode::Balanced);
        let no_embed = CapabilitySet {
            embed: false,
            ..CapabilitySet::default()
        };
        h.registry.register(Arc::new(
            ScriptedBackend::named("text-only").with_capabilities(no_embed),
        ));
        h.registry.register(Arc::new(ScriptedBackend::named("full")));

        let decision = h
            .engine
            .route("m", Operation::Embed, &default_annotations())
            .unwrap();
        assert_eq!(decision.backend.id(), "full");
    }

    #[tokio::test]
    async fn thermal_throttled_is_filtered_and_tagged() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry
            .register(Arc::new(ScriptedBackend::named("hot").with_latency(10.0)));
        h.registry
            .register(Arc::new(ScriptedBackend::named("cool").with_latency(500.0)));
        // Single-writer in production is the efficiency controller; tests
        // reach through the same command channel.
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        h.registry.spawn_throttle_listener(rx);
        tx.send(crate::backend::registry::ThrottleCommand {
            backend_id: "hot".into(),
            throttled: true,
        })
        .await
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let decision = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(decision.backend.id(), "cool");
        assert_eq!(decision.reason, "thermal-fallback");
    }

    #[test]
    fn model_unsupported_everywhere_is_model_not_found() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry.register(Arc::new(
            ScriptedBackend::named("a").with_patterns(&["llama*"]),
        ));
        let err = h
            .engine
            .route("qwen2:7b", Operation::Generate, &default_annotations())
            .unwrap_err();
        assert!(matches!(err, ProxyError::ModelNotFound(_)));
    }

    #[test]
    fn queue_penalty_steers_away_from_loaded_backend() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry.register(Arc::new(ScriptedBackend::named("a")));
        h.registry.register(Arc::new(ScriptedBackend::named("b")));

        let _guards: Vec<_> = (0..4)
            .map(|_| h.queues.mark_start("a", Priority::Normal))
            .collect();

        let decision = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(decision.backend.id(), "b");
    }

    #[test]
    fn operator_priority_breaks_ties() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry
            .register(Arc::new(ScriptedBackend::named("low").with_priority(1)));
        h.registry
            .register(Arc::new(ScriptedBackend::named("high").with_priority(5)));

        let decision = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(decision.backend.id(), "high");
    }

    #[test]
    fn identical_backends_tie_break_on_id() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry.register(Arc::new(ScriptedBackend::named("zeta")));
        h.registry
            .register(Arc::new(ScriptedBackend::named("alpha")));

        let decision = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(decision.backend.id(), "alpha");
    }

    #[test]
    fn alternatives_cap_at_three() {
        let h = harness(EfficiencyMode::Balanced);
        for id in ["a", "b", "c", "d", "e"] {
            h.registry.register(Arc::new(ScriptedBackend::named(id)));
        }
        let decision = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(decision.alternatives.len(), 3);
    }

    #[test]
    fn fallback_excludes_failed_backend() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry
            .register(Arc::new(ScriptedBackend::named("primary").with_priority(9)));
        h.registry.register(Arc::new(ScriptedBackend::named("spare")));

        let first = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(first.backend.id(), "primary");

        let second = h
            .engine
            .fallback(
                "m",
                Operation::Generate,
                &default_annotations(),
                &["primary".into()],
            )
            .unwrap();
        assert_eq!(second.backend.id(), "spare");
    }

    #[test]
    fn decisions_are_recorded_in_the_ring() {
        let h = harness(EfficiencyMode::Balanced);
        h.registry.register(Arc::new(ScriptedBackend::named("a")));
        h.engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();

        let recent = h.engine.history().recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].backend_id, "a");
        assert_eq!(recent[0].mode, "balanced");
    }

    #[test]
    fn mode_change_applies_to_subsequent_routes_only() {
        let h = harness(EfficiencyMode::Performance);
        h.registry
            .register(Arc::new(ScriptedBackend::named("big").with_power(55.0).with_latency(30.0)));
        h.registry
            .register(Arc::new(ScriptedBackend::named("small").with_power(3.0).with_latency(600.0)));

        let before = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(before.backend.id(), "big");

        h.profile_tx
            .send_replace(ModeProfile::for_mode(EfficiencyMode::UltraEfficiency));

        let after = h
            .engine
            .route("m", Operation::Generate, &default_annotations())
            .unwrap();
        assert_eq!(after.backend.id(), "small");
    }
}
