use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::domain::{Decision, RuleConfig, RuleStats};
use crate::observability::MetricsRegistry;

use super::hot_reload::{HotReloadHandle, ReloadCallback};
use super::source::{RuleError, RuleSource, SourceMarker};

/// Load a rule configuration from a source.
///
/// Parses the document, drops incomplete entries and sorts rules by weight.
pub fn load_rules(source: &dyn RuleSource) -> Result<RuleConfig, RuleError> {
    let doc = source.read()?;
    RuleConfig::from_document(doc).map_err(RuleError::Validation)
}

/// Owner of the published rule configuration.
///
/// Readers get an `Arc` snapshot that never changes underneath them; a
/// reload builds a complete new snapshot and swaps it in only on success.
/// Per-rule telemetry sits behind its own lock so evaluation never contends
/// with configuration readers.
pub struct RuleStore {
    source: Box<dyn RuleSource>,
    current: RwLock<Arc<RuleConfig>>,
    /// Serializes reloads from the poller and from callers
    reload_lock: Mutex<()>,
    stats: Mutex<AHashMap<String, RuleStats>>,
    last_marker: Mutex<Option<SourceMarker>>,
    last_error: Mutex<Option<String>>,
    hot_reload: Mutex<Option<HotReloadHandle>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl RuleStore {
    /// Create a store over a source. Nothing is loaded until [`RuleStore::reload`].
    pub fn new(source: impl RuleSource + 'static) -> Self {
        RuleStore {
            source: Box::new(source),
            current: RwLock::new(Arc::new(RuleConfig::empty())),
            reload_lock: Mutex::new(()),
            stats: Mutex::new(AHashMap::new()),
            last_marker: Mutex::new(None),
            last_error: Mutex::new(None),
            hot_reload: Mutex::new(None),
            metrics: None,
        }
    }

    /// Count reload outcomes in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Create a store and perform the initial load.
    pub fn open(source: impl RuleSource + 'static) -> Result<Self, RuleError> {
        let store = RuleStore::new(source);
        store.reload()?;
        Ok(store)
    }

    /// Re-read the source and publish the result.
    ///
    /// All-or-nothing: on failure the active configuration is left as is.
    pub fn reload(&self) -> Result<Arc<RuleConfig>, RuleError> {
        let _guard = self.reload_lock.lock();

        let marker = self.source.modification_marker().ok();

        let config = match load_rules(self.source.as_ref()) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                error!(source = %self.source.describe(), error = %e, "Failed to load rules");
                *self.last_error.lock() = Some(e.to_string());
                self.record_reload(false);
                return Err(e);
            }
        };

        *self.current.write() = config.clone();

        {
            let mut stats = self.stats.lock();
            for rule in &config.rules {
                stats.entry(rule.id.clone()).or_default();
            }
        }

        *self.last_marker.lock() = marker;
        *self.last_error.lock() = None;
        self.record_reload(true);

        info!(
            source = %self.source.describe(),
            version = %config.version,
            generation = config.generation,
            rules = config.rules.len(),
            "Loaded rules"
        );

        Ok(config)
    }

    fn record_reload(&self, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_rule_reload(success);
        }
    }

    /// Current published snapshot.
    #[inline]
    pub fn current(&self) -> Arc<RuleConfig> {
        self.current.read().clone()
    }

    /// Whether a configuration has been published.
    pub fn is_initialized(&self) -> bool {
        self.current.read().generation != 0
    }

    /// Map a score to a decision using the current thresholds.
    pub fn make_decision(&self, score: f64) -> Decision {
        self.current.read().thresholds.make_decision(score)
    }

    /// Message of the most recent failed load, cleared by a successful one.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub(crate) fn last_marker(&self) -> Option<SourceMarker> {
        self.last_marker.lock().clone()
    }

    pub(crate) fn source_marker(&self) -> Result<SourceMarker, RuleError> {
        self.source.modification_marker()
    }

    pub(crate) fn describe_source(&self) -> String {
        self.source.describe()
    }

    /// Start polling the source for changes.
    ///
    /// Exactly one poller runs per store. The callback, if any, receives
    /// each newly published snapshot.
    pub fn enable_hot_reload(
        self: &Arc<Self>,
        interval: Duration,
        callback: Option<ReloadCallback>,
    ) -> Result<(), RuleError> {
        if interval.is_zero() {
            return Err(RuleError::HotReload("interval must be positive".to_string()));
        }

        let mut slot = self.hot_reload.lock();
        if slot.is_some() {
            return Err(RuleError::HotReload("hot reload already enabled".to_string()));
        }
        if !self.is_initialized() {
            return Err(RuleError::HotReload("rules not loaded yet".to_string()));
        }

        let handle = HotReloadHandle::spawn(Arc::downgrade(self), interval, callback)?;
        *slot = Some(handle);

        info!(interval_ms = interval.as_millis() as u64, "Hot reload enabled");
        Ok(())
    }

    /// Stop the poller and wait for it to exit. No-op if not running.
    pub fn disable_hot_reload(&self) {
        let handle = self.hot_reload.lock().take();
        if let Some(handle) = handle {
            handle.stop();
            info!("Hot reload disabled");
        }
    }

    pub fn is_hot_reload_enabled(&self) -> bool {
        self.hot_reload.lock().is_some()
    }

    /// Record one evaluation attempt of a rule.
    pub fn record_evaluation(&self, rule_id: &str, triggered: bool, elapsed: Duration) {
        let mut stats = self.stats.lock();
        apply_attempt(&mut stats, rule_id, triggered, elapsed);
    }

    /// Record a whole evaluation pass under a single lock acquisition.
    pub fn record_evaluations<'a>(
        &self,
        attempts: impl IntoIterator<Item = (&'a str, bool, Duration)>,
    ) {
        let mut stats = self.stats.lock();
        for (rule_id, triggered, elapsed) in attempts {
            apply_attempt(&mut stats, rule_id, triggered, elapsed);
        }
    }

    /// Copy of the per-rule telemetry.
    pub fn rule_statistics(&self) -> AHashMap<String, RuleStats> {
        self.stats.lock().clone()
    }

    /// Zero all telemetry counters, keeping the known rule ids.
    pub fn reset_statistics(&self) {
        let mut stats = self.stats.lock();
        for entry in stats.values_mut() {
            *entry = RuleStats::default();
        }
        info!("Rule statistics reset");
    }
}

fn apply_attempt(
    stats: &mut AHashMap<String, RuleStats>,
    rule_id: &str,
    triggered: bool,
    elapsed: Duration,
) {
    if !stats.contains_key(rule_id) {
        stats.insert(rule_id.to_string(), RuleStats::default());
    }

    if let Some(entry) = stats.get_mut(rule_id) {
        entry.evaluation_count += 1;
        entry.total_time += elapsed;
        if triggered {
            entry.hit_count += 1;
        }
    }
}

impl Drop for RuleStore {
    fn drop(&mut self) {
        if let Some(handle) = self.hot_reload.get_mut().take() {
            handle.stop();
        }
    }
}
