//! Cross-module routing scenarios: registry + queues + modes + scorer
//! working together the way real traffic exercises them.

use std::sync::Arc;

use tokio::sync::watch;

use crate::backend::registry::Registry;
use crate::backend::scripted::ScriptedBackend;
use crate::backend::{CapabilitySet, Hardware, Operation};
use crate::error::ProxyError;
use crate::power::mode::{EfficiencyMode, ModeProfile};
use crate::power::monitor::SystemState;
use crate::power::EfficiencyController;
use crate::routing::annotations::{Annotations, Priority};
use crate::routing::history::DecisionRing;
use crate::routing::queue::QueueManager;
use crate::routing::router::{FilterStage, RoutingEngine};

struct Pool {
    engine: RoutingEngine,
    queues: QueueManager,
    _profile_tx: watch::Sender<ModeProfile>,
}

fn pool(mode: EfficiencyMode, backends: Vec<ScriptedBackend>) -> Pool {
    let registry = Registry::new();
    for b in backends {
        registry.register(Arc::new(b));
    }
    let queues = QueueManager::new();
    let (profile_tx, profile_rx) = watch::channel(ModeProfile::for_mode(mode));
    let engine = RoutingEngine::new(
        registry,
        queues.clone(),
        profile_rx,
        DecisionRing::default(),
    );
    Pool {
        engine,
        queues,
        _profile_tx: profile_tx,
    }
}

/// The three-tier hardware pool used across the scenarios.
fn heterogeneous_backends() -> Vec<ScriptedBackend> {
    vec![
        ScriptedBackend::named("nvidia")
            .with_hardware(Hardware::Nvidia)
            .with_latency(150.0)
            .with_power(55.0),
        ScriptedBackend::named("igpu")
            .with_hardware(Hardware::Igpu)
            .with_latency(400.0)
            .with_power(12.0),
        ScriptedBackend::named("npu")
            .with_hardware(Hardware::Npu)
            .with_latency(800.0)
            .with_power(3.0),
    ]
}

#[test]
fn impossible_latency_budget_rejects_every_backend() {
    let p = pool(EfficiencyMode::Performance, heterogeneous_backends());
    let ann = Annotations {
        latency_critical: true,
        priority: Some(Priority::Critical),
        max_latency_ms: Some(50.0),
        ..Annotations::default()
    };

    let err = p.engine.route("llama3:8b", Operation::Generate, &ann).unwrap_err();
    match err {
        ProxyError::NoAvailableBackends { filter } => {
            assert_eq!(filter, FilterStage::LatencyBudget);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn latency_critical_request_lands_on_fastest_backend() {
    let p = pool(EfficiencyMode::Performance, heterogeneous_backends());
    let ann = Annotations {
        latency_critical: true,
        max_latency_ms: Some(500.0),
        ..Annotations::default()
    };

    let decision = p.engine.route("llama3:8b", Operation::Generate, &ann).unwrap();
    assert_eq!(decision.backend.id(), "nvidia");
    assert_eq!(decision.reason, "latency-critical");
    // npu (800 ms) was budget-filtered, leaving igpu as the only spare.
    assert_eq!(decision.alternatives, vec!["igpu".to_string()]);
}

#[test]
fn efficiency_mode_prefers_the_npu_within_budget() {
    let p = pool(EfficiencyMode::Efficiency, heterogeneous_backends());
    let decision = p
        .engine
        .route("llama3:8b", Operation::Generate, &Annotations::default())
        .unwrap();

    // 15 W budget drops nvidia; the 2.5 power weight then outweighs the
    // npu's latency disadvantage against the igpu.
    assert_eq!(decision.backend.id(), "npu");
    assert_eq!(decision.reason, "power-efficient");
    assert_eq!(decision.alternatives, vec!["igpu".to_string()]);
}

#[test]
fn congested_backend_loses_critical_traffic() {
    let p = pool(EfficiencyMode::Balanced, heterogeneous_backends());

    // Five critical requests in flight on the nvidia.
    let _guards: Vec<_> = (0..5)
        .map(|_| p.queues.mark_start("nvidia", Priority::Critical))
        .collect();
    assert_eq!(p.queues.weighted_depth("nvidia", Priority::Critical), 20);

    let ann = Annotations {
        priority: Some(Priority::Critical),
        ..Annotations::default()
    };
    let decision = p.engine.route("llama3:8b", Operation::Generate, &ann).unwrap();

    assert_ne!(decision.backend.id(), "nvidia");
    assert_eq!(decision.reason, "critical-priority-low-queue");
}

#[test]
fn critical_priority_dominates_congestion_at_any_depth() {
    let p = pool(
        EfficiencyMode::Balanced,
        vec![
            ScriptedBackend::named("a").with_latency(100.0).with_power(10.0),
            ScriptedBackend::named("b").with_latency(100.0).with_power(10.0),
        ],
    );
    let ann = Annotations {
        priority: Some(Priority::Critical),
        ..Annotations::default()
    };

    for n in 1..=100 {
        let guards: Vec<_> = (0..n)
            .map(|_| p.queues.mark_start("a", Priority::BestEffort))
            .collect();

        let decision = p.engine.route("m", Operation::Generate, &ann).unwrap();
        assert_eq!(
            decision.backend.id(),
            "b",
            "critical request should avoid the backend loaded with {n} best-effort requests"
        );
        drop(guards);
    }
}

#[test]
fn auto_mode_trace_follows_battery_and_thermal_events() {
    let (controller, _throttle_rx) = EfficiencyController::new(EfficiencyMode::Auto, None, vec![]);
    let mut transitions = controller.subscribe_transitions();

    let snapshot = |on_battery: Option<bool>, level: Option<f64>, cpu: Option<f64>| SystemState {
        battery_level: level,
        on_battery,
        cpu_temp_c: cpu,
        ..SystemState::default()
    };

    // Deep discharge on battery.
    controller.observe(snapshot(Some(true), Some(15.0), None));
    // Package overheats (battery sensor momentarily unreadable).
    controller.observe(snapshot(Some(true), None, Some(90.0)));
    // Battery recovers but the package is still hot.
    controller.observe(snapshot(Some(true), Some(35.0), Some(90.0)));
    // Plugged in, cooled down: first cool reading arms recovery...
    controller.observe(snapshot(Some(false), Some(85.0), Some(70.0)));
    // ...the next one completes it.
    controller.observe(snapshot(Some(false), Some(85.0), Some(70.0)));

    let mut seen = Vec::new();
    while let Ok(t) = transitions.try_recv() {
        seen.push((t.from, t.to));
    }
    assert_eq!(
        seen,
        vec![
            (EfficiencyMode::Balanced, EfficiencyMode::UltraEfficiency),
            (EfficiencyMode::UltraEfficiency, EfficiencyMode::Quiet),
            (EfficiencyMode::Quiet, EfficiencyMode::Performance),
        ]
    );
}

#[test]
fn oscillating_trace_produces_one_quiet_transition_per_excursion() {
    let (controller, _throttle_rx) = EfficiencyController::new(EfficiencyMode::Auto, None, vec![]);
    let mut transitions = controller.subscribe_transitions();

    // 10 minutes of a 10-second-period square wave between 82 and 88 °C.
    for i in 0..60 {
        let temp = if i % 2 == 0 { 88.0 } else { 82.0 };
        controller.observe(SystemState {
            battery_level: Some(60.0),
            on_battery: Some(false),
            cpu_temp_c: Some(temp),
            ..SystemState::default()
        });
    }

    let mut into_quiet = 0;
    while let Ok(t) = transitions.try_recv() {
        if t.to == EfficiencyMode::Quiet {
            into_quiet += 1;
        }
    }
    // 82 °C never clears the 75 °C recovery bar, so the whole trace is one
    // sustained excursion.
    assert_eq!(into_quiet, 1);
}

mod filter_soundness {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    struct ArbBackend {
        healthy: bool,
        throttled: bool,
        power_watts: f64,
        latency_ms: f64,
        embeds: bool,
    }

    fn arb_backend() -> impl Strategy<Value = ArbBackend> {
        (
            any::<bool>(),
            any::<bool>(),
            1.0f64..80.0,
            10.0f64..1000.0,
            any::<bool>(),
        )
            .prop_map(|(healthy, throttled, power_watts, latency_ms, embeds)| ArbBackend {
                healthy,
                throttled,
                power_watts,
                latency_ms,
                embeds,
            })
    }

    fn arb_mode() -> impl Strategy<Value = EfficiencyMode> {
        prop_oneof![
            Just(EfficiencyMode::Performance),
            Just(EfficiencyMode::Balanced),
            Just(EfficiencyMode::Efficiency),
            Just(EfficiencyMode::Quiet),
            Just(EfficiencyMode::UltraEfficiency),
        ]
    }

    proptest! {
        /// No decision ever names a backend that is unhealthy, throttled,
        /// over the caller's budgets, outside the mode's power budget, or
        /// missing the requested capability.
        #[test]
        fn decisions_respect_every_filter(
            backends in proptest::collection::vec(arb_backend(), 1..6),
            mode in arb_mode(),
            max_power in proptest::option::of(5.0f64..60.0),
            max_latency in proptest::option::of(50.0f64..900.0),
            want_embed in any::<bool>(),
        ) {
            let registry = Registry::new();
            let mut arbs = std::collections::HashMap::new();
            for (i, b) in backends.iter().enumerate() {
                let id = format!("b{i}");
                let caps = CapabilitySet { embed: b.embeds, ..CapabilitySet::default() };
                registry.register(Arc::new(
                    ScriptedBackend::named(&id)
                        .with_power(b.power_watts)
                        .with_latency(b.latency_ms)
                        .with_capabilities(caps),
                ));
                if !b.healthy {
                    registry.set_healthy(&id, false, "scripted");
                }
                arbs.insert(id, b.clone());
            }
            for (id, b) in &arbs {
                if b.throttled {
                    registry.set_thermal_throttled(id, true);
                }
            }

            let (_tx, profile_rx) = watch::channel(ModeProfile::for_mode(mode));
            let queues = QueueManager::new();
            let engine = RoutingEngine::new(
                registry.clone(), queues, profile_rx, DecisionRing::default(),
            );

            let ann = Annotations {
                max_power_watts: max_power,
                max_latency_ms: max_latency,
                ..Annotations::default()
            };
            let op = if want_embed { Operation::Embed } else { Operation::Generate };

            if let Ok(decision) = engine.route("m", op, &ann) {
                let chosen = arbs.get(decision.backend.id()).unwrap();
                prop_assert!(chosen.healthy);
                prop_assert!(!chosen.throttled);
                if let Some(cap) = max_power {
                    prop_assert!(chosen.power_watts <= cap);
                }
                if let Some(cap) = max_latency {
                    prop_assert!(chosen.latency_ms <= cap);
                }
                if let Some(budget) = ModeProfile::for_mode(mode).power_budget_watts {
                    prop_assert!(chosen.power_watts <= budget);
                }
                if want_embed {
                    prop_assert!(chosen.embeds);
                }
            }
        }
    }
}
