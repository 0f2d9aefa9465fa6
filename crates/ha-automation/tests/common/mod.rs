//! Test automations and engine setup shared by the behavior tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ha_automation::{
    Automation, AutomationManager, AutomationMeta, AutomationMetadata, AutomationRegistry,
    ChannelFailureObserver, ConditionalAutomation, ExecutionContext, FailureReport,
    InlineExecutor, Registrar, SchedulableAutomation, Tracer,
};
use ha_config::TraceConfig;
use ha_core::{State, StateChange};
use ha_trace::TraceStore;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

pub const SWITCH: &str = "switch.x";

/// Counts executions
#[derive(Debug, Clone, Default)]
pub struct Runs(Arc<AtomicUsize>);

impl Runs {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn change(entity_id: &str, state: &str) -> StateChange {
    StateChange::new(State::new(entity_id, state), None)
}

pub fn trace_config(flush_delay_ms: u64) -> TraceConfig {
    TraceConfig {
        flush_delay_ms,
        ..TraceConfig::default()
    }
}

/// Engine services wired to a failure channel
pub struct Harness {
    pub store: Arc<TraceStore>,
    pub context: Arc<ExecutionContext>,
    pub failures: UnboundedReceiver<FailureReport>,
}

impl Harness {
    pub fn new(flush_delay_ms: u64) -> Self {
        let store = Arc::new(TraceStore::in_memory(&trace_config(flush_delay_ms)));
        let (observer, failures) = ChannelFailureObserver::channel();
        let context = Arc::new(ExecutionContext::new(
            Tracer::new(Arc::clone(&store), Arc::new(observer)),
            Arc::new(InlineExecutor),
        ));
        Self {
            store,
            context,
            failures,
        }
    }

    pub fn manager(
        &self,
        registrar: impl Fn(&mut Registrar) + Send + Sync + 'static,
    ) -> AutomationManager {
        let registry: Arc<dyn AutomationRegistry> = Arc::new(FnRegistry {
            name: "test".to_string(),
            register: Box::new(registrar),
        });
        AutomationManager::new(&[registry], Arc::clone(&self.context)).unwrap()
    }
}

/// Registry backed by a closure
pub struct FnRegistry {
    pub name: String,
    pub register: Box<dyn Fn(&mut Registrar) + Send + Sync>,
}

impl AutomationRegistry for FnRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, registrar: &mut Registrar) -> anyhow::Result<()> {
        (self.register)(registrar);
        Ok(())
    }
}

/// Simple automation that counts runs and optionally fails
pub struct Counter {
    pub name: String,
    pub triggers: Vec<String>,
    pub runs: Runs,
    pub fail_with: Option<String>,
}

impl Counter {
    pub fn new(name: &str, runs: &Runs) -> Self {
        Self {
            name: name.to_string(),
            triggers: vec![SWITCH.to_string()],
            runs: runs.clone(),
            fail_with: None,
        }
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }
}

impl AutomationMeta for Counter {
    fn trigger_entity_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.triggers.clone())
    }

    fn metadata(&self) -> anyhow::Result<Option<AutomationMetadata>> {
        Ok(Some(AutomationMetadata::new(&self.name)))
    }
}

#[async_trait]
impl Automation for Counter {
    async fn execute(&self, _: &StateChange, _: CancellationToken) -> anyhow::Result<()> {
        self.runs.hit();
        match &self.fail_with {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(()),
        }
    }
}

/// Runs once `switch.x` has been "on" for `wait`
pub struct OnFor {
    pub name: String,
    pub wait: Duration,
    pub runs: Runs,
    /// Condition check fails instead of answering
    pub broken: bool,
    pub on_error: bool,
}

impl OnFor {
    pub fn new(name: &str, wait: Duration, runs: &Runs) -> Self {
        Self {
            name: name.to_string(),
            wait,
            runs: runs.clone(),
            broken: false,
            on_error: false,
        }
    }
}

impl AutomationMeta for OnFor {
    fn trigger_entity_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec![SWITCH.to_string()])
    }

    fn metadata(&self) -> anyhow::Result<Option<AutomationMetadata>> {
        Ok(Some(AutomationMetadata::new(&self.name)))
    }
}

#[async_trait]
impl ConditionalAutomation for OnFor {
    async fn continues_to_be_true(&self, change: &StateChange) -> anyhow::Result<bool> {
        if self.broken {
            anyhow::bail!("sensor lookup failed");
        }
        Ok(change.new_state.is("on"))
    }

    fn for_duration(&self) -> Duration {
        self.wait
    }

    fn should_execute_on_continue_error(&self) -> bool {
        self.on_error
    }

    async fn execute(&self, _: CancellationToken) -> anyhow::Result<()> {
        self.runs.hit();
        Ok(())
    }
}

/// Shared handle to the instant a [`Scheduled`] automation returns next
#[derive(Debug, Clone, Default)]
pub struct NextRun {
    next: Arc<Mutex<Option<DateTime<Utc>>>>,
    failing: Arc<AtomicBool>,
}

impl NextRun {
    pub fn set(&self, next: Option<DateTime<Utc>>) {
        *self.next.lock().unwrap() = next;
    }

    /// Make the schedule calculation fail until reset
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn get(&self) -> anyhow::Result<Option<DateTime<Utc>>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("calendar lookup failed");
        }
        Ok(*self.next.lock().unwrap())
    }
}

/// Runs at whatever instant the test sets in `next`
pub struct Scheduled {
    pub next: NextRun,
    pub runs: Runs,
    pub reschedulable: bool,
    pub past_events: bool,
    pub on_error: bool,
}

impl Scheduled {
    pub fn new(next: &NextRun, runs: &Runs) -> Self {
        Self {
            next: next.clone(),
            runs: runs.clone(),
            reschedulable: false,
            past_events: false,
            on_error: false,
        }
    }
}

impl AutomationMeta for Scheduled {
    fn trigger_entity_ids(&self) -> anyhow::Result<Vec<String>> {
        Ok(vec![SWITCH.to_string()])
    }

    fn metadata(&self) -> anyhow::Result<Option<AutomationMetadata>> {
        Ok(Some(AutomationMetadata::new("Scheduled")))
    }
}

#[async_trait]
impl SchedulableAutomation for Scheduled {
    async fn next_scheduled(&self, _: &StateChange) -> anyhow::Result<Option<DateTime<Utc>>> {
        self.next.get()
    }

    fn is_reschedulable(&self) -> bool {
        self.reschedulable
    }

    fn should_execute_past_events(&self) -> bool {
        self.past_events
    }

    fn should_execute_on_continue_error(&self) -> bool {
        self.on_error
    }

    async fn execute(&self, _: CancellationToken) -> anyhow::Result<()> {
        self.runs.hit();
        Ok(())
    }
}
