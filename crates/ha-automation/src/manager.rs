//! Automation management
//!
//! The [`AutomationManager`] owns every registered automation and decides which
//! of them see an incoming state change. Its indices are built once, from the
//! automation registries, and are read-only afterwards.

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::join_all;
use ha_core::StateChange;
use ha_trace::{LogInfo, TraceData, TraceStore};
use indexmap::IndexMap;
use tracing::{debug, info};

use crate::automation::{Automation, AutomationKind, ConditionalAutomation, SchedulableAutomation};
use crate::error::{AutomationError, AutomationPanic, AutomationResult, RegistrationError};
use crate::metadata::clean_key;
use crate::wrapper::{ExecutionContext, RegisteredAutomation};

/// A named source of automations
pub trait AutomationRegistry: Send + Sync {
    /// Recorded as the `source` of every automation it registers
    fn name(&self) -> &str;

    fn register(&self, registrar: &mut Registrar) -> anyhow::Result<()>;
}

/// Collects the automations of one registry
#[derive(Debug, Default)]
pub struct Registrar {
    automations: Vec<AutomationKind>,
}

impl Registrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, automation: impl Automation + 'static) -> &mut Self {
        self.register_kind(AutomationKind::simple(automation))
    }

    pub fn register_conditional(
        &mut self,
        automation: impl ConditionalAutomation + 'static,
    ) -> &mut Self {
        self.register_kind(AutomationKind::conditional(automation))
    }

    pub fn register_schedulable(
        &mut self,
        automation: impl SchedulableAutomation + 'static,
    ) -> &mut Self {
        self.register_kind(AutomationKind::schedulable(automation))
    }

    pub fn register_kind(&mut self, kind: AutomationKind) -> &mut Self {
        self.automations.push(kind);
        self
    }

    pub fn len(&self) -> usize {
        self.automations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.automations.is_empty()
    }
}

/// Owns every registered automation and dispatches state changes to them
pub struct AutomationManager {
    /// Automations by unique key, in registration order
    by_key: IndexMap<String, Arc<RegisteredAutomation>>,
    /// Automations by trigger entity id
    by_trigger: HashMap<String, Vec<Arc<RegisteredAutomation>>>,
    context: Arc<ExecutionContext>,
}

impl AutomationManager {
    /// Build the dispatch index from registries, in order
    ///
    /// A registry that fails or panics, or an automation whose key cleans to
    /// nothing, aborts the whole build.
    pub fn new(
        registries: &[Arc<dyn AutomationRegistry>],
        context: Arc<ExecutionContext>,
    ) -> Result<Self, RegistrationError> {
        let mut wrappers = Vec::new();

        for registry in registries {
            let source = registry.name().to_string();
            let mut registrar = Registrar::new();

            let result = catch_unwind(AssertUnwindSafe(|| registry.register(&mut registrar)))
                .unwrap_or_else(|payload| Err(AutomationPanic::from_payload(payload).into()));
            if let Err(e) = result {
                return Err(RegistrationError::Registry {
                    registry: source,
                    message: format!("{:#}", e),
                });
            }

            debug!(registry = %source, count = registrar.len(), "Collected automations");
            wrappers.extend(
                registrar
                    .automations
                    .into_iter()
                    .map(|kind| RegisteredAutomation::new(kind, &source, Arc::clone(&context))),
            );
        }

        Self::from_wrappers(wrappers, context)
    }

    /// Build the dispatch index from already wrapped automations
    pub fn from_wrappers(
        wrappers: Vec<RegisteredAutomation>,
        context: Arc<ExecutionContext>,
    ) -> Result<Self, RegistrationError> {
        let mut by_key: IndexMap<String, Arc<RegisteredAutomation>> = IndexMap::new();
        let mut by_trigger: HashMap<String, Vec<Arc<RegisteredAutomation>>> = HashMap::new();

        for wrapper in wrappers {
            let metadata = wrapper.metadata();
            let base = clean_key(metadata.key_source());
            if base.is_empty() {
                return Err(RegistrationError::InvalidKey {
                    name: metadata.name,
                });
            }

            let key = unique_key(&base, |candidate| by_key.contains_key(candidate));
            wrapper.assign_key(key.clone());
            wrapper.report_authoring_errors();

            let wrapper = Arc::new(wrapper);
            for entity_id in wrapper.trigger_entity_ids() {
                by_trigger
                    .entry(entity_id.clone())
                    .or_default()
                    .push(Arc::clone(&wrapper));
            }

            info!(
                automation_key = %key,
                name = %metadata.name,
                source = %metadata.source,
                "Registered automation"
            );
            by_key.insert(key, wrapper);
        }

        info!(
            "Registered {} automations on {} trigger entities",
            by_key.len(),
            by_trigger.len()
        );

        Ok(Self {
            by_key,
            by_trigger,
            context,
        })
    }

    /// Dispatch a state change to every automation that wants it
    ///
    /// Matching automations run concurrently; the returned future completes
    /// when all of them have. Failures stay inside each automation's trace.
    /// Returns the number of automations dispatched to.
    pub async fn trigger_automations(&self, change: &StateChange) -> usize {
        let Some(candidates) = self.by_trigger.get(&change.entity_id) else {
            return 0;
        };

        let matches: Vec<&Arc<RegisteredAutomation>> = candidates
            .iter()
            .filter(|wrapper| wrapper.accepts(change))
            .collect();
        if matches.is_empty() {
            return 0;
        }

        debug!(
            entity_id = %change.entity_id,
            timing = %change.timing,
            count = matches.len(),
            "Dispatching state change"
        );
        join_all(matches.iter().map(|wrapper| wrapper.execute(change))).await;
        matches.len()
    }

    /// Enable or disable by key; disabling cancels any pending run
    pub fn enable_automation(&self, key: &str, enable: bool) -> AutomationResult<()> {
        let wrapper = self
            .by_key
            .get(key)
            .ok_or_else(|| AutomationError::NotFound(key.to_string()))?;

        wrapper.set_enabled(enable);
        info!(
            automation_key = %key,
            "{} automation",
            if enable { "Enabled" } else { "Disabled" }
        );
        Ok(())
    }

    /// All automations in registration order
    pub fn get_all(&self) -> Vec<Arc<RegisteredAutomation>> {
        self.by_key.values().cloned().collect()
    }

    /// Exact key lookup
    pub fn get_by_key(&self, key: &str) -> Option<Arc<RegisteredAutomation>> {
        self.by_key.get(key).cloned()
    }

    /// Trigger and additionally tracked entities of every enabled automation
    pub fn get_entities_to_track(&self) -> BTreeSet<String> {
        self.by_key
            .values()
            .filter(|wrapper| wrapper.is_enabled())
            .flat_map(|wrapper| {
                let tracked = wrapper.metadata().additional_entities_to_track;
                wrapper
                    .trigger_entity_ids()
                    .iter()
                    .cloned()
                    .chain(tracked)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.by_key.len()
    }

    pub fn trace_store(&self) -> &Arc<TraceStore> {
        self.context.store()
    }

    pub fn get_traces(&self, key: &str) -> Vec<TraceData> {
        self.trace_store().get_traces(key)
    }

    pub fn get_global_logs(&self) -> Vec<LogInfo> {
        self.trace_store().get_global_logs()
    }

    pub fn get_error_logs(&self) -> Vec<LogInfo> {
        self.trace_store().get_error_logs()
    }

    pub fn get_tracker_logs(&self) -> Vec<LogInfo> {
        self.trace_store().get_tracker_logs()
    }
}

/// `base`, then `base2`, `base3`, ... until one is free
fn unique_key(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (2u32..)
        .map(|n| format!("{}{}", base, n))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}
