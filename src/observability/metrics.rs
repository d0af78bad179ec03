use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::domain::Decision;

/// In-process counters for the scoring core.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Total transactions scored
    pub decisions_total: AtomicU64,

    /// Decisions by outcome
    pub decisions_approve: AtomicU64,
    pub decisions_review: AtomicU64,
    pub decisions_decline: AtomicU64,

    /// Scoring latency buckets
    pub latency_under_1ms: AtomicU64,
    pub latency_1_2ms: AtomicU64,
    pub latency_2_5ms: AtomicU64,
    pub latency_5_10ms: AtomicU64,
    pub latency_over_10ms: AtomicU64,

    /// Rule evaluation counts
    pub rules_evaluated_total: AtomicU64,
    pub rules_triggered_total: AtomicU64,
    pub rules_failed_total: AtomicU64,

    /// Pattern screening
    pub pattern_scans_total: AtomicU64,
    pub pattern_blacklist_hits: AtomicU64,
    pub pattern_whitelist_hits: AtomicU64,

    /// Rule reloads
    pub rule_reloads_total: AtomicU64,
    pub rule_reload_errors: AtomicU64,
}

/// Point-in-time copy of a [`MetricsRegistry`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub decisions_total: u64,
    pub decisions_approve: u64,
    pub decisions_review: u64,
    pub decisions_decline: u64,
    /// Bucket counts for <1ms, 1-2ms, 2-5ms, 5-10ms and >=10ms
    pub latency_buckets: [u64; 5],
    pub rules_evaluated_total: u64,
    pub rules_triggered_total: u64,
    pub rules_failed_total: u64,
    pub pattern_scans_total: u64,
    pub pattern_blacklist_hits: u64,
    pub pattern_whitelist_hits: u64,
    pub rule_reloads_total: u64,
    pub rule_reload_errors: u64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    /// Record a decision outcome.
    pub fn record_decision(&self, decision: Decision) {
        self.decisions_total.fetch_add(1, Ordering::Relaxed);

        let counter = match decision {
            Decision::Approve => &self.decisions_approve,
            Decision::Review => &self.decisions_review,
            Decision::Decline => &self.decisions_decline,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record scoring latency.
    pub fn record_latency(&self, start: Instant) {
        let micros = start.elapsed().as_micros() as u64;

        let bucket = if micros < 1000 {
            &self.latency_under_1ms
        } else if micros < 2000 {
            &self.latency_1_2ms
        } else if micros < 5000 {
            &self.latency_2_5ms
        } else if micros < 10000 {
            &self.latency_5_10ms
        } else {
            &self.latency_over_10ms
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the counts of one rule pass.
    pub fn record_rule_pass(&self, evaluated: usize, triggered: usize, failed: usize) {
        self.rules_evaluated_total
            .fetch_add(evaluated as u64, Ordering::Relaxed);
        self.rules_triggered_total
            .fetch_add(triggered as u64, Ordering::Relaxed);
        self.rules_failed_total
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    /// Record one pattern screening of a transaction.
    pub fn record_pattern_scan(&self, blacklist_hits: usize, whitelist_hits: usize) {
        self.pattern_scans_total.fetch_add(1, Ordering::Relaxed);
        self.pattern_blacklist_hits
            .fetch_add(blacklist_hits as u64, Ordering::Relaxed);
        self.pattern_whitelist_hits
            .fetch_add(whitelist_hits as u64, Ordering::Relaxed);
    }

    /// Record a rule reload.
    pub fn record_rule_reload(&self, success: bool) {
        self.rule_reloads_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.rule_reload_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            decisions_total: load(&self.decisions_total),
            decisions_approve: load(&self.decisions_approve),
            decisions_review: load(&self.decisions_review),
            decisions_decline: load(&self.decisions_decline),
            latency_buckets: [
                load(&self.latency_under_1ms),
                load(&self.latency_1_2ms),
                load(&self.latency_2_5ms),
                load(&self.latency_5_10ms),
                load(&self.latency_over_10ms),
            ],
            rules_evaluated_total: load(&self.rules_evaluated_total),
            rules_triggered_total: load(&self.rules_triggered_total),
            rules_failed_total: load(&self.rules_failed_total),
            pattern_scans_total: load(&self.pattern_scans_total),
            pattern_blacklist_hits: load(&self.pattern_blacklist_hits),
            pattern_whitelist_hits: load(&self.pattern_whitelist_hits),
            rule_reloads_total: load(&self.rule_reloads_total),
            rule_reload_errors: load(&self.rule_reload_errors),
        }
    }
}

/// Records elapsed time into the latency buckets when dropped.
pub struct TimingGuard<'a> {
    registry: &'a MetricsRegistry,
    start: Instant,
}

impl<'a> TimingGuard<'a> {
    pub fn new(registry: &'a MetricsRegistry) -> Self {
        TimingGuard {
            registry,
            start: Instant::now(),
        }
    }
}

impl<'a> Drop for TimingGuard<'a> {
    fn drop(&mut self) {
        self.registry.record_latency(self.start);
    }
}
