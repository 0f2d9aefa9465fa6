//! Trace and log store
//!
//! Holds the in-flight ("active") traces and persists finished ones, together
//! with the global, error and tracker logs, into bounded records in a
//! [`TraceCache`]. Every record is most-recent-first and evicts its oldest
//! entries once it grows past its capacity.
//!
//! Record keys:
//! - `trace.<automation key>` - finished traces of one automation
//! - `logs.global` - log lines emitted outside of any trace
//! - `logs.error` - the subset of global lines at warning or above
//! - `logs.tracker` - entity health reports

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ha_config::TraceConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheResult, FileCache, MemoryCache, TraceCache};
use crate::model::{ExceptionInfo, LogInfo, LogLevel, TraceData, TraceEvent, TraceScope};

const GLOBAL_LOG_KEY: &str = "logs.global";
const ERROR_LOG_KEY: &str = "logs.error";
const TRACKER_LOG_KEY: &str = "logs.tracker";

fn trace_record_key(automation_key: &str) -> String {
    format!("trace.{}", automation_key)
}

/// Retention settings derived from [`TraceConfig`]
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub max_traces: usize,
    pub max_logs: usize,
    pub flush_delay: Duration,
    pub global_level: LogLevel,
}

impl From<&TraceConfig> for StoreSettings {
    fn from(config: &TraceConfig) -> Self {
        Self {
            max_traces: config.max_traces_per_automation,
            max_logs: config.max_log_entries,
            flush_delay: config.flush_delay(),
            global_level: config.global_log_level.parse().unwrap_or(LogLevel::Info),
        }
    }
}

/// A trace that is still collecting log lines
#[derive(Debug)]
struct ActiveTrace {
    event: Mutex<TraceEvent>,
    logs: Mutex<Vec<LogInfo>>,
}

impl ActiveTrace {
    fn new(event: TraceEvent) -> Self {
        Self {
            event: Mutex::new(event),
            logs: Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> TraceData {
        TraceData {
            event: self
                .event
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            logs: self
                .logs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

/// Thread-safe trace and log store
pub struct TraceStore {
    cache: Arc<dyn TraceCache>,
    active: DashMap<TraceScope, Arc<ActiveTrace>>,
    /// One lock per record key, guarding read-modify-write of that record
    locks: DashMap<String, Arc<Mutex<()>>>,
    settings: StoreSettings,
}

impl TraceStore {
    /// Create a store from configuration
    ///
    /// Uses a [`FileCache`] when `storage_dir` is set and a [`MemoryCache`]
    /// otherwise.
    pub fn new(config: &TraceConfig) -> CacheResult<Self> {
        let cache: Arc<dyn TraceCache> = match &config.storage_dir {
            Some(dir) => Arc::new(FileCache::new(dir, config.sliding_expiration())?),
            None => Arc::new(MemoryCache::new(config.sliding_expiration())),
        };
        Ok(Self::with_cache(cache, StoreSettings::from(config)))
    }

    /// Create an in-memory store
    pub fn in_memory(config: &TraceConfig) -> Self {
        Self::with_cache(
            Arc::new(MemoryCache::new(config.sliding_expiration())),
            StoreSettings::from(config),
        )
    }

    /// Create a store over an explicit cache
    pub fn with_cache(cache: Arc<dyn TraceCache>, settings: StoreSettings) -> Self {
        Self {
            cache,
            active: DashMap::new(),
            locks: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    /// Register a new active trace and return its scope
    ///
    /// If another trace with the identical scope is still active, the event
    /// time is nudged forward by a microsecond until the scope is unique.
    pub fn begin(&self, mut event: TraceEvent) -> TraceScope {
        loop {
            let scope = event.scope();
            match self.active.entry(scope.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(ActiveTrace::new(event)));
                    return scope;
                }
                Entry::Occupied(_) => {
                    event.event_time += chrono::Duration::microseconds(1);
                }
            }
        }
    }

    /// Append a log line to the active trace for `scope`
    ///
    /// Lines arriving after the trace was flushed are treated as untraced.
    pub fn append_log(&self, scope: &TraceScope, log: LogInfo) {
        let active = self.active.get(scope).map(|entry| Arc::clone(entry.value()));
        match active {
            Some(active) => active
                .logs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(log),
            None => self.record_untraced(log),
        }
    }

    /// Attach a failure to the active trace for `scope`
    pub fn record_exception(&self, scope: &TraceScope, exception: ExceptionInfo) {
        if let Some(active) = self.active.get(scope) {
            active
                .event
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .exception = Some(exception);
        }
    }

    /// Mark a trace as finished
    ///
    /// The trace stays active for the configured flush delay so that log
    /// lines from background work still attach to it, then it is persisted.
    pub fn complete(self: &Arc<Self>, scope: TraceScope) {
        let delay = self.settings.flush_delay;
        if delay.is_zero() {
            self.flush(&scope);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(self);
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    store.flush(&scope);
                });
            }
            Err(_) => self.flush(&scope),
        }
    }

    /// Persist an active trace immediately and remove it from the active table
    pub fn flush(&self, scope: &TraceScope) {
        let key = trace_record_key(&scope.automation_key);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some((_, active)) = self.active.remove(scope) else {
            return;
        };
        let data = active.snapshot();
        debug!(
            automation_key = %scope.automation_key,
            logs = data.logs.len(),
            "Persisting trace"
        );
        self.prepend_locked(&key, data, self.settings.max_traces);
    }

    /// Record a log line that does not belong to any trace
    pub fn record_untraced(&self, log: LogInfo) {
        if log.level.is_error_log_level() {
            self.push_record(ERROR_LOG_KEY, log.clone(), self.settings.max_logs);
        }
        if log.level >= self.settings.global_level {
            self.push_record(GLOBAL_LOG_KEY, log, self.settings.max_logs);
        }
    }

    /// Record an entity health report
    pub fn append_tracker_log(&self, log: LogInfo) {
        self.push_record(TRACKER_LOG_KEY, log, self.settings.max_logs);
    }

    /// All traces of one automation, active ones first, most recent first
    pub fn get_traces(&self, automation_key: &str) -> Vec<TraceData> {
        let key = trace_record_key(automation_key);
        let lock = self.lock_for(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut traces: Vec<TraceData> = self
            .active
            .iter()
            .filter(|entry| entry.key().automation_key == automation_key)
            .map(|entry| entry.value().snapshot())
            .collect();
        traces.sort_by(|a, b| b.event.event_time.cmp(&a.event.event_time));

        traces.extend(self.read_record::<TraceData>(&key));
        traces
    }

    /// Log lines emitted outside of any trace, most recent first
    pub fn get_global_logs(&self) -> Vec<LogInfo> {
        self.read_locked(GLOBAL_LOG_KEY)
    }

    /// Untraced log lines at warning or above, most recent first
    pub fn get_error_logs(&self) -> Vec<LogInfo> {
        self.read_locked(ERROR_LOG_KEY)
    }

    /// Entity health reports, most recent first
    pub fn get_tracker_logs(&self) -> Vec<LogInfo> {
        self.read_locked(TRACKER_LOG_KEY)
    }

    /// Drop persisted records whose sliding expiration has passed
    pub fn purge_expired(&self) -> usize {
        match self.cache.purge_expired() {
            Ok(purged) => {
                if purged > 0 {
                    debug!(purged, "Purged expired trace records");
                }
                purged
            }
            Err(e) => {
                warn!(error = %e, "Failed to purge expired trace records");
                0
            }
        }
    }

    /// Number of traces still collecting log lines
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn read_locked<T: DeserializeOwned>(&self, key: &str) -> Vec<T> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        Vec::from(self.read_record::<T>(key))
    }

    fn push_record<T: Serialize + DeserializeOwned>(&self, key: &str, item: T, capacity: usize) {
        let lock = self.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.prepend_locked(key, item, capacity);
    }

    /// Caller must hold the lock for `key`
    fn prepend_locked<T: Serialize + DeserializeOwned>(&self, key: &str, item: T, capacity: usize) {
        let mut items: VecDeque<T> = self.read_record(key);
        items.push_front(item);
        items.truncate(capacity);

        let result = serde_json::to_value(&items)
            .map_err(CacheError::from)
            .and_then(|value| self.cache.set(key, value));
        if let Err(e) = result {
            warn!(key, error = %e, "Failed to write trace record");
        }
    }

    fn read_record<T: DeserializeOwned>(&self, key: &str) -> VecDeque<T> {
        match self.cache.get(key) {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(key, error = %e, "Discarding unreadable trace record");
                VecDeque::new()
            }),
            Ok(None) => VecDeque::new(),
            Err(e) => {
                warn!(key, error = %e, "Failed to read trace record");
                VecDeque::new()
            }
        }
    }
}
