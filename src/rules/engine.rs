use ahash::AHashMap;
use evalexpr::{HashMapContext, Node};
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::domain::{Rule, Transaction};

use super::context::{DerivedFeatures, RuleContext};
use super::expression::{binding_table, compile_expression, value_to_score, ExpressionError};
use super::store::RuleStore;

/// Results strictly above this count as triggered.
pub const TRIGGER_THRESHOLD: f64 = 0.5;

/// Latency budget for one full rule pass.
pub const RULE_PASS_BUDGET: Duration = Duration::from_millis(5);

/// Per-pass telemetry stays on the stack up to this many rules.
const INLINE_ATTEMPTS: usize = 32;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Ids of engines not yet dropped.
static LIVE_ENGINES: Mutex<Vec<u64>> = Mutex::new(Vec::new());

/// Bumped on every engine drop so threads know when to prune.
static DROP_EPOCH: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static WORKER_CACHES: RefCell<WorkerCaches> = RefCell::new(WorkerCaches::default());
}

/// Per-thread compiled rules, keyed by engine id.
#[derive(Default)]
struct WorkerCaches {
    /// Drop epoch at the last prune
    epoch: u64,
    engines: AHashMap<u64, WorkerCache>,
}

impl WorkerCaches {
    /// Release entries of engines dropped on other threads.
    fn prune(&mut self) {
        let epoch = DROP_EPOCH.load(Ordering::Acquire);
        if epoch == self.epoch {
            return;
        }
        self.epoch = epoch;
        if self.engines.is_empty() {
            return;
        }

        let live = LIVE_ENGINES.lock();
        let before = self.engines.len();
        self.engines.retain(|id, _| live.contains(id));
        let released = before - self.engines.len();
        if released > 0 {
            debug!(released, "Released compiled rules of dropped engines");
        }
    }
}

struct CompiledRule {
    generation: u64,
    node: Node,
}

/// One thread's compiled expressions and binding table for one engine.
struct WorkerCache {
    generation: u64,
    bindings: HashMapContext,
    compiled: AHashMap<String, CompiledRule>,
}

impl WorkerCache {
    fn new() -> Self {
        WorkerCache {
            generation: 0,
            bindings: binding_table(),
            compiled: AHashMap::new(),
        }
    }

    /// Drop everything compiled against another generation.
    fn reset(&mut self, generation: u64) {
        if self.generation != 0 {
            debug!(
                from = self.generation,
                to = generation,
                "Rule configuration changed, clearing compiled cache"
            );
        }
        self.generation = generation;
        self.bindings = binding_table();
        self.compiled.clear();
    }

    fn evaluate(&mut self, rule: &Rule, generation: u64) -> Result<f64, ExpressionError> {
        if let Some(cached) = self.compiled.get(&rule.id) {
            if cached.generation == generation {
                return run(&cached.node, &self.bindings);
            }
        }

        self.compiled.remove(&rule.id);
        let node = compile_expression(&rule.expression)?;
        let result = run(&node, &self.bindings);
        self.compiled
            .insert(rule.id.clone(), CompiledRule { generation, node });
        result
    }
}

#[inline]
fn run(node: &Node, bindings: &HashMapContext) -> Result<f64, ExpressionError> {
    let value = node
        .eval_with_context(bindings)
        .map_err(ExpressionError::Evaluate)?;
    value_to_score(value)
}

/// Outcome of one rule for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub triggered: bool,
    /// Weight contributed to the total (full weight or zero)
    pub score: f64,
    /// Raw numeric value of the expression
    pub value: f64,
    pub evaluation_time: Duration,
}

/// Outcome of a full rule pass over one transaction.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleEvaluationMetrics {
    /// Per-rule results in evaluation order; failed rules are omitted
    pub results: Vec<RuleResult>,
    /// Sum of triggered weights, unclamped
    pub total_score: f64,
    pub rules_triggered: usize,
    pub rules_evaluated: usize,
    pub rules_failed: usize,
    /// Sum of the per-rule evaluation times
    pub rule_time: Duration,
    /// Wall-clock time of the whole pass
    pub total_latency: Duration,
    /// Version of the configuration the pass ran against
    pub rules_version: String,
}

impl RuleEvaluationMetrics {
    /// Ids of triggered rules in evaluation order.
    pub fn triggered_rules(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.triggered)
            .map(|r| r.rule_id.as_str())
            .collect()
    }
}

/// Evaluates the published rule set against transactions.
///
/// Every calling thread keeps its own compiled expressions, stamped with the
/// configuration generation they were built from. A thread that sees a new
/// generation discards its cache before evaluating anything.
pub struct RuleEngine {
    id: u64,
    store: Arc<RuleStore>,
}

impl RuleEngine {
    pub fn new(store: Arc<RuleStore>) -> Self {
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        LIVE_ENGINES.lock().push(id);
        RuleEngine { id, store }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Evaluate with neutral derived features.
    pub fn evaluate(&self, tx: &Transaction) -> RuleEvaluationMetrics {
        self.evaluate_context(&RuleContext::from_transaction(tx))
    }

    /// Evaluate with externally computed derived features.
    pub fn evaluate_with_features(
        &self,
        tx: &Transaction,
        features: DerivedFeatures,
    ) -> RuleEvaluationMetrics {
        self.evaluate_context(&RuleContext::with_features(tx, features))
    }

    /// Evaluate every enabled rule against a prepared context.
    pub fn evaluate_context(&self, ctx: &RuleContext) -> RuleEvaluationMetrics {
        let start = Instant::now();
        let config = self.store.current();

        if config.generation == 0 {
            error!("Rule engine not initialized, no rules loaded");
            return RuleEvaluationMetrics::default();
        }
        if !ctx.is_valid() {
            error!(
                customer_id = %ctx.customer_id,
                merchant_id = %ctx.merchant_id,
                "Invalid rule context"
            );
            return RuleEvaluationMetrics::default();
        }

        let mut metrics = RuleEvaluationMetrics {
            rules_version: config.version.clone(),
            ..Default::default()
        };
        let mut attempts: SmallVec<[(&str, bool, Duration); INLINE_ATTEMPTS]> = SmallVec::new();

        WORKER_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();
            caches.prune();
            let cache = caches
                .engines
                .entry(self.id)
                .or_insert_with(WorkerCache::new);

            if cache.generation != config.generation {
                cache.reset(config.generation);
            }

            if let Err(e) = ctx.bind(&mut cache.bindings) {
                // A type clash in the table; start over with a fresh one
                warn!(error = %e, "Rebuilding rule binding table");
                cache.bindings = binding_table();
                if let Err(e) = ctx.bind(&mut cache.bindings) {
                    error!(error = %e, "Failed to bind rule context");
                    return;
                }
            }

            for rule in config.enabled_rules() {
                let rule_start = Instant::now();
                let outcome = cache.evaluate(rule, config.generation);
                let elapsed = rule_start.elapsed();
                metrics.rule_time += elapsed;

                match outcome {
                    Ok(value) => {
                        let triggered = value > TRIGGER_THRESHOLD;
                        let score = if triggered { rule.weight } else { 0.0 };

                        metrics.total_score += score;
                        metrics.rules_evaluated += 1;
                        if triggered {
                            metrics.rules_triggered += 1;
                        }
                        metrics.results.push(RuleResult {
                            rule_id: rule.id.clone(),
                            triggered,
                            score,
                            value,
                            evaluation_time: elapsed,
                        });
                        attempts.push((rule.id.as_str(), triggered, elapsed));
                    }
                    Err(e) => {
                        match &e {
                            ExpressionError::Compile(_) => {
                                error!(rule_id = %rule.id, error = %e, "Failed to compile rule")
                            }
                            _ => warn!(rule_id = %rule.id, error = %e, "Rule evaluation failed"),
                        }
                        metrics.rules_failed += 1;
                        attempts.push((rule.id.as_str(), false, elapsed));
                    }
                }
            }
        });

        self.store.record_evaluations(attempts);

        metrics.total_latency = start.elapsed();

        debug!(
            rules_evaluated = metrics.rules_evaluated,
            rules_triggered = metrics.rules_triggered,
            rules_failed = metrics.rules_failed,
            total_score = metrics.total_score,
            latency_us = metrics.total_latency.as_micros() as u64,
            "Rule evaluation complete"
        );

        if metrics.total_latency > RULE_PASS_BUDGET {
            warn!(
                latency_us = metrics.total_latency.as_micros() as u64,
                rules = config.rules.len(),
                "Rule evaluation exceeded latency budget"
            );
        }

        metrics
    }

    /// Number of rules compiled on the calling thread.
    pub fn cached_rule_count(&self) -> usize {
        WORKER_CACHES.with(|caches| {
            caches
                .borrow()
                .engines
                .get(&self.id)
                .map_or(0, |cache| cache.compiled.len())
        })
    }

    /// Drop the calling thread's compiled rules for this engine.
    pub fn clear_thread_cache(&self) {
        let _ = WORKER_CACHES.try_with(|caches| {
            if let Ok(mut caches) = caches.try_borrow_mut() {
                caches.engines.remove(&self.id);
            }
        });
    }
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("id", &self.id)
            .field("generation", &self.store.current().generation)
            .finish()
    }
}

impl Drop for RuleEngine {
    fn drop(&mut self) {
        self.clear_thread_cache();

        // Other threads release their entries on their next evaluation
        LIVE_ENGINES.lock().retain(|id| *id != self.id);
        DROP_EPOCH.fetch_add(1, Ordering::Release);
    }
}
