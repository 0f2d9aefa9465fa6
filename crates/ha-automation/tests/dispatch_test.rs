//! Dispatch, registration and tracing behavior

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{change, Counter, FnRegistry, Harness, OnFor, Runs, SWITCH};
use ha_automation::{
    Automation, AutomationManager, AutomationMeta, AutomationMetadata, AutomationRegistry,
    EntityProblem, EntityStateProvider, ExecutionContext, HealthPoller, Registrar,
    RegistrationError, SpawningExecutor, Tracer,
};
use ha_config::HealthConfig;
use ha_core::{EventTiming, State, StateChange};
use ha_trace::{ExceptionKind, LogInfo, LogLevel, TraceLayer, TraceStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn test_failure_does_not_affect_other_automations() {
    let mut harness = Harness::new(0);
    let broken_runs = Runs::default();
    let healthy_runs = Runs::default();
    let (b, h) = (broken_runs.clone(), healthy_runs.clone());
    let manager = harness.manager(move |reg| {
        reg.register(Counter::new("Broken", &b).failing("light offline"))
            .register(Counter::new("Healthy", &h));
    });

    let dispatched = manager.trigger_automations(&change(SWITCH, "on")).await;

    assert_eq!(dispatched, 2);
    assert_eq!(broken_runs.count(), 1);
    assert_eq!(healthy_runs.count(), 1);

    let report = harness.failures.try_recv().unwrap();
    assert_eq!(report.automation_key, "broken");
    assert_eq!(report.message, "light offline");
    assert!(harness.failures.try_recv().is_err());

    let healthy = manager.get_traces("healthy");
    assert_eq!(healthy.len(), 1);
    assert!(healthy[0].event.exception.is_none());

    let broken = manager.get_traces("broken");
    let exception = broken[0].event.exception.as_ref().unwrap();
    assert_eq!(exception.kind, ExceptionKind::Error);
    assert_eq!(exception.message, "light offline");
}

#[tokio::test]
async fn test_dispatch_filters() {
    let harness = Harness::new(0);
    let runs = Runs::default();
    let r = runs.clone();
    let manager = harness.manager(move |reg| {
        reg.register(Counter::new("Switch", &r));
    });

    // Other entity
    assert_eq!(manager.trigger_automations(&change("switch.y", "on")).await, 0);
    // Bad state
    assert_eq!(
        manager.trigger_automations(&change(SWITCH, "unavailable")).await,
        0
    );
    // Timing outside the default mask
    let replayed = change(SWITCH, "on").with_timing(EventTiming::PRE_STARTUP_POST_LAST_CACHED);
    assert_eq!(manager.trigger_automations(&replayed).await, 0);

    assert_eq!(runs.count(), 0);
    assert!(manager.get_by_key("switch").unwrap().metadata().last_triggered.is_none());

    assert_eq!(manager.trigger_automations(&change(SWITCH, "on")).await, 1);
    assert_eq!(runs.count(), 1);
    let metadata = manager.get_by_key("switch").unwrap().metadata();
    assert!(metadata.last_triggered.is_some());
    assert!(metadata.last_executed.is_some());
}

#[tokio::test]
async fn test_repeated_trigger_entity_dispatches_once() {
    let harness = Harness::new(0);
    let runs = Runs::default();
    let r = runs.clone();
    let manager = harness.manager(move |reg| {
        let mut counter = Counter::new("Switch", &r);
        counter.triggers = vec![SWITCH.to_string(), SWITCH.to_string()];
        reg.register(counter);
    });

    assert_eq!(manager.trigger_automations(&change(SWITCH, "on")).await, 1);
    assert_eq!(runs.count(), 1);
    assert_eq!(
        manager.get_by_key("switch").unwrap().trigger_entity_ids(),
        [SWITCH]
    );
}

#[test]
fn test_switch_on_runs_conditional_synchronously() {
    let harness = Harness::new(0);
    let runs = Runs::default();
    let r = runs.clone();
    let manager = harness.manager(move |reg| {
        reg.register_conditional(OnFor::new("Switch on", Duration::ZERO, &r));
    });

    let event = change(SWITCH, "on").with_timing(EventTiming::POST_STARTUP);
    let dispatched = tokio_test::block_on(manager.trigger_automations(&event));

    assert_eq!(dispatched, 1);
    assert_eq!(runs.count(), 1);
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn test_duplicate_names_get_numbered_keys() {
    let harness = Harness::new(0);
    let runs = Runs::default();
    let r = runs.clone();
    let manager = harness.manager(move |reg| {
        reg.register(Counter::new("Porch Light", &r))
            .register(Counter::new("porch light", &r))
            .register(Counter::new("Porch-Light", &r))
            .register(Counter::new("PORCH  LIGHT!", &r));
    });

    let keys: Vec<String> = manager.get_all().iter().map(|a| a.key()).collect();
    assert_eq!(
        keys,
        vec!["porch_light", "porch_light2", "porch-light", "porch_light3"]
    );
    assert!(manager.get_by_key("porch_light2").is_some());
    assert!(manager.get_by_key("Porch Light").is_none());
}

#[test]
fn test_registry_name_is_source() {
    let harness = Harness::new(0);
    let runs = Runs::default();
    let r = runs.clone();
    let registries: Vec<Arc<dyn AutomationRegistry>> = vec![Arc::new(FnRegistry {
        name: "porch".to_string(),
        register: Box::new(move |reg: &mut Registrar| {
            reg.register(Counter::new("Light", &r));
        }),
    })];

    let manager = AutomationManager::new(&registries, Arc::clone(&harness.context)).unwrap();
    assert_eq!(manager.get_by_key("light").unwrap().metadata().source, "porch");
}

struct FailingRegistry;

impl AutomationRegistry for FailingRegistry {
    fn name(&self) -> &str {
        "failing"
    }

    fn register(&self, _: &mut Registrar) -> anyhow::Result<()> {
        anyhow::bail!("config missing")
    }
}

struct PanickingRegistry;

impl AutomationRegistry for PanickingRegistry {
    fn name(&self) -> &str {
        "panicking"
    }

    fn register(&self, _: &mut Registrar) -> anyhow::Result<()> {
        panic!("registry exploded")
    }
}

#[test]
fn test_registry_errors_are_fatal() {
    let harness = Harness::new(0);

    let registries: Vec<Arc<dyn AutomationRegistry>> = vec![Arc::new(FailingRegistry)];
    let err = AutomationManager::new(&registries, Arc::clone(&harness.context))
        .err()
        .unwrap();
    assert!(matches!(
        err,
        RegistrationError::Registry { ref registry, ref message }
            if registry == "failing" && message == "config missing"
    ));

    let registries: Vec<Arc<dyn AutomationRegistry>> = vec![Arc::new(PanickingRegistry)];
    let err = AutomationManager::new(&registries, Arc::clone(&harness.context))
        .err()
        .unwrap();
    assert!(err.to_string().contains("registry exploded"));
}

#[test]
fn test_unusable_key_is_fatal() {
    let harness = Harness::new(0);
    let runs = Runs::default();
    let registries: Vec<Arc<dyn AutomationRegistry>> = vec![Arc::new(FnRegistry {
        name: "test".to_string(),
        register: Box::new(move |reg: &mut Registrar| {
            reg.register(Counter::new("!!!", &runs));
        }),
    })];

    let err = AutomationManager::new(&registries, Arc::clone(&harness.context))
        .err()
        .unwrap();
    assert!(matches!(err, RegistrationError::InvalidKey { .. }));
}

struct Untidy;

impl AutomationMeta for Untidy {
    fn trigger_entity_ids(&self) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("entity list unavailable")
    }
}

#[async_trait]
impl Automation for Untidy {
    async fn execute(&self, _: &StateChange, _: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_authoring_errors_are_reported_not_fatal() {
    let mut harness = Harness::new(0);
    let manager = harness.manager(|reg| {
        reg.register(Untidy);
    });

    let untidy = manager.get_by_key("untidy").unwrap();
    assert!(untidy.trigger_entity_ids().is_empty());
    assert!(untidy.metadata().user_trigger_error.is_some());

    let report = harness.failures.try_recv().unwrap();
    assert_eq!(report.automation_key, "untidy");
    assert!(report.message.contains("entity list unavailable"));
}

struct Tracked {
    name: &'static str,
    triggers: Vec<&'static str>,
    extra: Vec<&'static str>,
}

impl AutomationMeta for Tracked {
    fn trigger_entity_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.triggers.iter().map(|s| s.to_string()).collect())
    }

    fn metadata(&self) -> anyhow::Result<Option<AutomationMetadata>> {
        let metadata = self
            .extra
            .iter()
            .fold(AutomationMetadata::new(self.name), |m, e| m.tracking(*e));
        Ok(Some(metadata))
    }
}

#[async_trait]
impl Automation for Tracked {
    async fn execute(&self, _: &StateChange, _: CancellationToken) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_entities_to_track_skips_disabled() {
    let harness = Harness::new(0);
    let manager = harness.manager(|reg| {
        reg.register(Tracked {
            name: "Porch",
            triggers: vec!["binary_sensor.porch", "switch.porch"],
            extra: vec!["light.porch"],
        })
        .register(Tracked {
            name: "Garage",
            triggers: vec!["binary_sensor.garage"],
            extra: vec![],
        });
    });

    let tracked: Vec<String> = manager.get_entities_to_track().into_iter().collect();
    assert_eq!(
        tracked,
        vec![
            "binary_sensor.garage",
            "binary_sensor.porch",
            "light.porch",
            "switch.porch"
        ]
    );

    manager.enable_automation("garage", false).unwrap();
    assert!(!manager
        .get_entities_to_track()
        .contains("binary_sensor.garage"));
}

// ============================================================================
// Tracing
// ============================================================================

struct Chatty;

impl AutomationMeta for Chatty {
    fn trigger_entity_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec![SWITCH.to_string()])
    }
}

#[async_trait]
impl Automation for Chatty {
    async fn execute(&self, change: &StateChange, _: CancellationToken) -> anyhow::Result<()> {
        info!(target: "porch_rules", entity_id = %change.entity_id, "first");
        tokio::spawn(
            async {
                info!(target: "porch_rules", "background");
            }
            .in_current_span(),
        );
        info!(target: "porch_rules", "second");
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_trace_captures_background_logs_in_order() {
    let harness = Harness::new(500);
    let subscriber = Registry::default().with(TraceLayer::new(Arc::clone(&harness.store)));
    let _guard = tracing::subscriber::set_default(subscriber);

    let manager = harness.manager(|reg| {
        reg.register(Chatty);
    });
    manager.trigger_automations(&change(SWITCH, "on")).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.store.active_count(), 0);

    let traces = manager.get_traces("chatty");
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.event.automation_key, "chatty");
    assert_eq!(
        trace.event.state_change.as_ref().map(|c| c.entity_id.as_str()),
        Some(SWITCH)
    );

    let messages: Vec<&str> = trace
        .logs
        .iter()
        .filter(|log| log.logger == "porch_rules")
        .map(|log| log.message.as_str())
        .collect();
    assert_eq!(messages, vec!["first", "second", "background"]);
    assert_eq!(
        trace.logs[0].properties.get("entity_id"),
        Some(&serde_json::json!(SWITCH))
    );

    // Nothing from the automation leaked into the global log
    assert!(manager
        .get_global_logs()
        .iter()
        .all(|log| log.logger != "porch_rules"));
}

#[tokio::test]
async fn test_spawning_executor_keeps_logs_in_trace() {
    let store = Arc::new(TraceStore::in_memory(&common::trace_config(0)));
    let subscriber = Registry::default().with(TraceLayer::new(Arc::clone(&store)));
    let _guard = tracing::subscriber::set_default(subscriber);

    let context = Arc::new(ExecutionContext::new(
        Tracer::new(Arc::clone(&store), Arc::new(ha_automation::LoggingFailureObserver)),
        Arc::new(SpawningExecutor),
    ));
    let registries: Vec<Arc<dyn AutomationRegistry>> = vec![Arc::new(FnRegistry {
        name: "test".to_string(),
        register: Box::new(|reg: &mut Registrar| {
            reg.register(Chatty);
        }),
    })];
    let manager = AutomationManager::new(&registries, context).unwrap();

    manager.trigger_automations(&change(SWITCH, "on")).await;

    let traces = manager.get_traces("chatty");
    let messages: Vec<&str> = traces[0]
        .logs
        .iter()
        .filter(|log| log.logger == "porch_rules")
        .map(|log| log.message.as_str())
        .collect();
    // The background line may land after the trace was flushed
    assert!(messages.starts_with(&["first", "second"]));
}

// ============================================================================
// Health poller
// ============================================================================

struct FixedStates(HashMap<String, State>);

#[async_trait]
impl EntityStateProvider for FixedStates {
    async fn get_state(&self, entity_id: &str) -> anyhow::Result<Option<State>> {
        Ok(self.0.get(entity_id).cloned())
    }
}

#[tokio::test]
async fn test_health_poller_reports_unresponsive_entities() {
    let harness = Harness::new(0);
    let manager = Arc::new(harness.manager(|reg| {
        reg.register(Tracked {
            name: "Porch",
            triggers: vec!["binary_sensor.porch", "sensor.stale", "switch.gone"],
            extra: vec!["light.porch"],
        });
    }));

    let old = chrono::Utc::now() - chrono::Duration::days(2);
    let states = [
        State::new("binary_sensor.porch", "on"),
        State::new("light.porch", "unavailable"),
        State::new("sensor.stale", "21.5").at(old),
    ];
    let provider = FixedStates(
        states
            .into_iter()
            .map(|s| (s.entity_id.clone(), s))
            .collect(),
    );

    let poller = HealthPoller::new(
        Arc::clone(&manager),
        Arc::new(provider),
        HealthConfig::default(),
    );
    let reports = poller.check_once().await;

    let problems: Vec<(&str, &EntityProblem)> = reports
        .iter()
        .map(|r| (r.entity_id.as_str(), &r.problem))
        .collect();
    assert_eq!(problems.len(), 3);
    assert_eq!(
        problems[0],
        ("light.porch", &EntityProblem::BadState("unavailable".to_string()))
    );
    assert!(matches!(problems[1], ("sensor.stale", EntityProblem::Stale { .. })));
    assert_eq!(problems[2], ("switch.gone", &EntityProblem::Missing));

    let tracker = manager.get_tracker_logs();
    assert_eq!(tracker.len(), 3);
    assert!(tracker[0].message.starts_with("switch.gone"));
}

#[tokio::test(start_paused = true)]
async fn test_health_poller_stops_on_shutdown() {
    let harness = Harness::new(0);
    let manager = Arc::new(harness.manager(|_| {}));
    let poller = HealthPoller::new(
        manager,
        Arc::new(FixedStates(HashMap::new())),
        HealthConfig::default(),
    );

    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    };

    tokio::time::sleep(Duration::from_secs(900)).await;
    shutdown.cancel();
    assert!(task.await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_health_poller_purges_expired_trace_records() {
    let harness = Harness::new(0);
    harness.store.append_tracker_log(LogInfo::new(
        LogLevel::Warning,
        "health",
        "switch.gone is unresponsive",
    ));
    // Past the default sliding expiration
    tokio::time::advance(Duration::from_secs(8 * 24 * 60 * 60)).await;

    let manager = Arc::new(harness.manager(|_| {}));
    let poller = HealthPoller::new(
        manager,
        Arc::new(FixedStates(HashMap::new())),
        HealthConfig::default(),
    );

    let shutdown = CancellationToken::new();
    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { poller.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.cancel();
    task.await.unwrap();

    // Nothing left for a second purge
    assert_eq!(harness.store.purge_expired(), 0);
}
