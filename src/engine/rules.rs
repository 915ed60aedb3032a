// Concurrent rule-evaluation engine

//! # Rule Engine Module
//!
//! This module provides the engine that owns the rule collection for one
//! fact type. It supports safe concurrent registration, removal, and
//! evaluation, caches the sorted-by-priority view (invalidated on any
//! mutation), and tracks per-rule performance metrics.
//!
//! ## Key Features
//!
//! - **Priority ordering**: matched rules execute in strictly descending
//!   priority; ties break by registration order
//! - **Rule isolation**: a failing predicate or action never aborts
//!   sibling rules in the same pass
//! - **Stop conditions**: `stop_on_first_match` halts after the first
//!   match; `max_rules_to_execute` bounds how many matched rules run
//!   actions - each ends the evaluation pass when it triggers, in
//!   evaluate-all mode included
//! - **Cancellable async evaluation**: `execute_async` awaits async rules
//!   and checks the cancellation token between rule evaluations (never in
//!   the middle of a rule's action)
//!
//! ## Concurrency
//!
//! Many readers (evaluations) run concurrently with rare writers
//! (registration/removal). The collection sits behind a `std::sync::RwLock`
//! and evaluation clones the `Arc`ed sorted view before doing any work, so
//! the lock is never held across an await. Performance counters live in a
//! `DashMap`; each update is one read-modify-write under the shard lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clock::{system_clock, SharedClock};
use crate::models::rule::{Rule, RuleOutcome};
use crate::{RelayError, Result};

/// Execution options for a rule engine instance
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Halt the pass after the first matched rule
    pub stop_on_first_match: bool,

    /// Execute actions for at most this many matched rules; the pass ends
    /// once the cap is reached
    pub max_rules_to_execute: Option<usize>,

    /// Record per-rule execution count and duration statistics
    pub track_performance: bool,

    /// Permit registering multiple rules with the same id
    pub allow_duplicate_ids: bool,
}

/// Per-rule performance counters
#[derive(Debug, Clone)]
pub struct RuleMetrics {
    pub executions: u64,
    pub total_duration: Duration,
    pub min_duration: Duration,
    pub max_duration: Duration,
}

impl RuleMetrics {
    fn first(duration: Duration) -> Self {
        Self {
            executions: 1,
            total_duration: duration,
            min_duration: duration,
            max_duration: duration,
        }
    }

    fn record(&mut self, duration: Duration) {
        self.executions += 1;
        self.total_duration += duration;
        self.min_duration = self.min_duration.min(duration);
        self.max_duration = self.max_duration.max(duration);
    }

    pub fn average_duration(&self) -> Duration {
        if self.executions == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.executions as u32
        }
    }
}

/// One rule's record within an [`EngineResult`]
#[derive(Debug, Clone)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub rule_name: String,
    pub priority: i32,

    /// Whether the predicate fired. Stays `true` when an action failed
    /// after the predicate matched - the condition did fire; the failure
    /// belongs to the action. (One policy, applied globally.)
    pub matched: bool,

    pub outcome: RuleOutcome,
    pub duration: Duration,
}

/// Aggregate result of one evaluation pass
#[derive(Debug, Clone, Default)]
pub struct EngineResult {
    /// Rules whose predicate was evaluated in this pass
    pub total_evaluated: usize,

    /// Rules whose predicate fired
    pub matched: usize,

    /// Failure messages, one per errored rule, in evaluation order
    pub errors: Vec<String>,

    /// Per-rule records in evaluation (priority) order
    pub evaluations: Vec<RuleEvaluation>,
}

impl EngineResult {
    /// Ids of rules that matched and completed their actions
    pub fn succeeded_ids(&self) -> Vec<&str> {
        self.evaluations
            .iter()
            .filter(|e| e.outcome == RuleOutcome::Success && e.matched)
            .map(|e| e.rule_id.as_str())
            .collect()
    }
}

/// Lightweight match record returned by [`RuleEngine::matching_rules`]
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub priority: i32,
}

struct Registered<F> {
    /// Registration sequence; breaks priority ties (earlier wins)
    seq: u64,
    rule: Arc<Rule<F>>,
}

struct Inner<F> {
    rules: Vec<Registered<F>>,
    next_seq: u64,

    /// Sorted-by-priority view, rebuilt lazily; `None` when stale
    sorted: Option<Arc<Vec<Arc<Rule<F>>>>>,
}

/// The concurrent rule-evaluation engine for one fact type
///
/// ## Example:
/// ```
/// use agent_relay::{RuleEngine, EngineOptions, RuleBuilder};
///
/// let engine: RuleEngine<i64> = RuleEngine::new(EngineOptions::default());
/// engine.register(
///     RuleBuilder::new("large").priority(10).when(|n: &i64| *n > 100).build(),
/// ).unwrap();
///
/// let result = engine.execute(&250);
/// assert_eq!(result.matched, 1);
/// ```
pub struct RuleEngine<F> {
    inner: RwLock<Inner<F>>,
    options: EngineOptions,
    metrics: DashMap<String, RuleMetrics>,
    clock: SharedClock,
}

impl<F> RuleEngine<F> {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            inner: RwLock::new(Inner {
                rules: Vec::new(),
                next_seq: 0,
                sorted: None,
            }),
            options,
            metrics: DashMap::new(),
            clock: system_clock(),
        }
    }

    /// Replace the time source used for performance accounting
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Add a rule to the collection
    ///
    /// Fails with [`RelayError::Validation`] when the id is empty or, unless
    /// `allow_duplicate_ids` is set, when the id is already registered.
    /// Invalidates the cached sorted view.
    pub fn register(&self, rule: Rule<F>) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(RelayError::Validation("rule id must not be empty".into()));
        }

        let mut inner = self.write_inner();
        if !self.options.allow_duplicate_ids
            && inner.rules.iter().any(|r| r.rule.id == rule.id)
        {
            return Err(RelayError::Validation(format!(
                "rule id '{}' is already registered",
                rule.id
            )));
        }

        debug!(rule_id = %rule.id, priority = rule.priority, "registering rule");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.rules.push(Registered {
            seq,
            rule: Arc::new(rule),
        });
        inner.sorted = None;
        Ok(())
    }

    /// Remove every rule with the given id; returns whether any was removed
    pub fn remove(&self, rule_id: &str) -> bool {
        let mut inner = self.write_inner();
        let before = inner.rules.len();
        inner.rules.retain(|r| r.rule.id != rule_id);
        let removed = inner.rules.len() != before;
        if removed {
            inner.sorted = None;
        }
        removed
    }

    /// Remove all rules
    pub fn clear(&self) {
        let mut inner = self.write_inner();
        inner.rules.clear();
        inner.sorted = None;
    }

    pub fn rule_count(&self) -> usize {
        self.read_inner().rules.len()
    }

    /// The cached sorted-by-priority view, rebuilt under the write lock
    /// when stale. Returned as a shared snapshot so evaluation never holds
    /// the lock.
    fn sorted_view(&self) -> Arc<Vec<Arc<Rule<F>>>> {
        if let Some(view) = self.read_inner().sorted.as_ref() {
            return Arc::clone(view);
        }

        let mut inner = self.write_inner();
        // Another writer may have rebuilt it between the locks
        if let Some(view) = inner.sorted.as_ref() {
            return Arc::clone(view);
        }

        let mut order: Vec<(i32, u64, Arc<Rule<F>>)> = inner
            .rules
            .iter()
            .map(|r| (r.rule.priority, r.seq, Arc::clone(&r.rule)))
            .collect();
        // Highest priority first; registration order breaks ties
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let view: Arc<Vec<Arc<Rule<F>>>> =
            Arc::new(order.into_iter().map(|(_, _, rule)| rule).collect());
        inner.sorted = Some(Arc::clone(&view));
        view
    }

    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, Inner<F>> {
        self.inner.read().expect("rule collection lock poisoned")
    }

    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, Inner<F>> {
        self.inner.write().expect("rule collection lock poisoned")
    }

    fn record_metrics(&self, rule_id: &str, duration: Duration) {
        if !self.options.track_performance {
            return;
        }
        // Entry guard holds the shard lock for the whole read-modify-write
        self.metrics
            .entry(rule_id.to_string())
            .and_modify(|m| m.record(duration))
            .or_insert_with(|| RuleMetrics::first(duration));
    }

    /// Snapshot of one rule's performance counters
    pub fn rule_metrics(&self, rule_id: &str) -> Option<RuleMetrics> {
        self.metrics.get(rule_id).map(|m| m.clone())
    }

    /// Snapshot of all performance counters
    pub fn all_metrics(&self) -> HashMap<String, RuleMetrics> {
        self.metrics
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Evaluate all rules against a fact, executing actions for matches
    ///
    /// Rules evaluate highest-priority-first. A predicate error is recorded
    /// as [`RuleOutcome::Error`] with `matched = false`; an action error is
    /// recorded as an error with `matched = true`. Neither aborts the pass.
    ///
    /// Asynchronous rules cannot run here and are recorded as errors; use
    /// [`Self::execute_async`] for them.
    pub fn execute(&self, fact: &F) -> EngineResult {
        let view = self.sorted_view();
        let mut result = EngineResult::default();
        let mut executed = 0usize;

        for rule in view.iter() {
            let started = self.clock.now();
            let evaluation = match rule.matches(fact) {
                Ok(false) => RuleEvaluation {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    priority: rule.priority,
                    matched: false,
                    outcome: RuleOutcome::NotMatched,
                    duration: self.clock.now() - started,
                },
                Ok(true) => {
                    result.matched += 1;
                    executed += 1;
                    let outcome = match rule.run_actions(fact) {
                        Ok(()) => RuleOutcome::Success,
                        Err(e) => RuleOutcome::Error {
                            message: e.to_string(),
                        },
                    };
                    RuleEvaluation {
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        priority: rule.priority,
                        matched: true,
                        outcome,
                        duration: self.clock.now() - started,
                    }
                }
                Err(e) => RuleEvaluation {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    priority: rule.priority,
                    matched: false,
                    outcome: RuleOutcome::Error {
                        message: e.to_string(),
                    },
                    duration: self.clock.now() - started,
                },
            };

            self.record_metrics(&rule.id, evaluation.duration);
            if let RuleOutcome::Error { message } = &evaluation.outcome {
                result.errors.push(format!("{}: {}", rule.id, message));
            }
            let matched = evaluation.matched;
            result.evaluations.push(evaluation);

            if matched {
                if self.options.stop_on_first_match {
                    break;
                }
                if let Some(max) = self.options.max_rules_to_execute {
                    if executed >= max {
                        break;
                    }
                }
            }
        }

        result.total_evaluated = result.evaluations.len();
        result
    }

    /// Without executing actions, list the rules whose predicate currently
    /// matches, in priority order
    ///
    /// Predicate errors (including async rules) count as non-matching here.
    /// Predicate timing still feeds the performance counters when tracking
    /// is enabled.
    pub fn matching_rules(&self, fact: &F) -> Vec<RuleMatch> {
        let view = self.sorted_view();
        let mut matches = Vec::new();
        for rule in view.iter() {
            let started = self.clock.now();
            let matched = rule.matches(fact).unwrap_or(false);
            self.record_metrics(&rule.id, self.clock.now() - started);
            if matched {
                matches.push(RuleMatch {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    priority: rule.priority,
                });
            }
        }
        matches
    }
}

impl<F: Sync> RuleEngine<F> {
    /// Async evaluation with cooperative cancellation
    ///
    /// Same semantics as [`Self::execute`], but async predicates and actions
    /// are awaited, and the cancellation token is checked between rule
    /// evaluations - a rule's action, once started, always completes or
    /// fails on its own. Cancellation returns [`RelayError::Cancelled`].
    pub async fn execute_async(
        &self,
        fact: &F,
        cancel: &CancellationToken,
    ) -> Result<EngineResult> {
        let view = self.sorted_view();
        let mut result = EngineResult::default();
        let mut executed = 0usize;

        for rule in view.iter() {
            if cancel.is_cancelled() {
                debug!(evaluated = result.evaluations.len(), "rule evaluation cancelled");
                return Err(RelayError::Cancelled);
            }

            let started = self.clock.now();
            let evaluation = match rule.matches_async(fact).await {
                Ok(false) => RuleEvaluation {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    priority: rule.priority,
                    matched: false,
                    outcome: RuleOutcome::NotMatched,
                    duration: self.clock.now() - started,
                },
                Ok(true) => {
                    result.matched += 1;
                    executed += 1;
                    let outcome = match rule.run_actions_async(fact).await {
                        Ok(()) => RuleOutcome::Success,
                        Err(e) => RuleOutcome::Error {
                            message: e.to_string(),
                        },
                    };
                    RuleEvaluation {
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        priority: rule.priority,
                        matched: true,
                        outcome,
                        duration: self.clock.now() - started,
                    }
                }
                Err(e) => RuleEvaluation {
                    rule_id: rule.id.clone(),
                    rule_name: rule.name.clone(),
                    priority: rule.priority,
                    matched: false,
                    outcome: RuleOutcome::Error {
                        message: e.to_string(),
                    },
                    duration: self.clock.now() - started,
                },
            };

            self.record_metrics(&rule.id, evaluation.duration);
            if let RuleOutcome::Error { message } = &evaluation.outcome {
                result.errors.push(format!("{}: {}", rule.id, message));
            }
            let matched = evaluation.matched;
            result.evaluations.push(evaluation);

            if matched {
                if self.options.stop_on_first_match {
                    break;
                }
                if let Some(max) = self.options.max_rules_to_execute {
                    if executed >= max {
                        break;
                    }
                }
            }
        }

        result.total_evaluated = result.evaluations.len();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::rule::RuleBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn trace_rule(
        id: &str,
        priority: i32,
        trace: Arc<Mutex<Vec<String>>>,
        matches: bool,
    ) -> Rule<u32> {
        let label = id.to_string();
        RuleBuilder::new(id)
            .priority(priority)
            .when(move |_| matches)
            .then(move |_| trace.lock().unwrap().push(label.clone()))
            .build()
    }

    #[test]
    fn rejects_empty_and_duplicate_ids() {
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());
        assert!(matches!(
            engine.register(RuleBuilder::new("  ").build()),
            Err(RelayError::Validation(_))
        ));

        engine.register(RuleBuilder::new("one").build()).unwrap();
        assert!(matches!(
            engine.register(RuleBuilder::new("one").build()),
            Err(RelayError::Validation(_))
        ));

        let lax: RuleEngine<u32> = RuleEngine::new(EngineOptions {
            allow_duplicate_ids: true,
            ..Default::default()
        });
        lax.register(RuleBuilder::new("dup").build()).unwrap();
        lax.register(RuleBuilder::new("dup").build()).unwrap();
        assert_eq!(lax.rule_count(), 2);
    }

    #[test]
    fn actions_run_in_descending_priority_regardless_of_registration() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());

        // Registered low-priority-first on purpose
        engine
            .register(trace_rule("low", 10, Arc::clone(&trace), true))
            .unwrap();
        engine
            .register(trace_rule("mid", 50, Arc::clone(&trace), true))
            .unwrap();
        engine
            .register(trace_rule("high", 100, Arc::clone(&trace), true))
            .unwrap();

        let result = engine.execute(&0);
        assert_eq!(result.total_evaluated, 3);
        assert_eq!(result.matched, 3);
        assert_eq!(*trace.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());
        engine
            .register(trace_rule("first", 5, Arc::clone(&trace), true))
            .unwrap();
        engine
            .register(trace_rule("second", 5, Arc::clone(&trace), true))
            .unwrap();

        engine.execute(&0);
        assert_eq!(*trace.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn stop_on_first_match_runs_exactly_one_action() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions {
            stop_on_first_match: true,
            ..Default::default()
        });
        engine
            .register(trace_rule("p100", 100, Arc::clone(&trace), true))
            .unwrap();
        engine
            .register(trace_rule("p50", 50, Arc::clone(&trace), true))
            .unwrap();
        engine
            .register(trace_rule("p10", 10, Arc::clone(&trace), true))
            .unwrap();

        let result = engine.execute(&0);
        assert_eq!(result.matched, 1);
        assert_eq!(*trace.lock().unwrap(), vec!["p100"]);
    }

    #[test]
    fn stop_on_first_match_skips_non_matching_rules() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions {
            stop_on_first_match: true,
            ..Default::default()
        });
        engine
            .register(trace_rule("never", 100, Arc::clone(&trace), false))
            .unwrap();
        engine
            .register(trace_rule("always", 50, Arc::clone(&trace), true))
            .unwrap();

        let result = engine.execute(&0);
        assert_eq!(result.total_evaluated, 2);
        assert_eq!(*trace.lock().unwrap(), vec!["always"]);
    }

    #[test]
    fn max_rules_to_execute_caps_the_pass() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions {
            max_rules_to_execute: Some(2),
            ..Default::default()
        });
        for (id, priority) in [("a", 30), ("b", 20), ("c", 10)] {
            engine
                .register(trace_rule(id, priority, Arc::clone(&trace), true))
                .unwrap();
        }

        let result = engine.execute(&0);
        assert_eq!(result.matched, 2);
        assert_eq!(*trace.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn failing_rule_does_not_abort_siblings() {
        let hits = Arc::new(AtomicUsize::new(0));
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());

        engine
            .register(
                RuleBuilder::new("explodes")
                    .priority(100)
                    .then_try(|_| Err(RelayError::Internal("action blew up".into())))
                    .build(),
            )
            .unwrap();
        let counter = Arc::clone(&hits);
        engine
            .register(
                RuleBuilder::new("survives")
                    .priority(10)
                    .then(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .build(),
            )
            .unwrap();

        let result = engine.execute(&0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("explodes"));

        // Action failure keeps matched = true: the condition did fire
        let errored = &result.evaluations[0];
        assert!(errored.matched);
        assert!(matches!(errored.outcome, RuleOutcome::Error { .. }));
        // Errored rules still count toward matched and the execution cap
        assert_eq!(result.matched, 2);
    }

    #[test]
    fn predicate_error_is_recorded_as_unmatched() {
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());
        engine
            .register(
                RuleBuilder::new("bad-predicate")
                    .when_try(|_| Err(RelayError::Internal("cannot decide".into())))
                    .build(),
            )
            .unwrap();

        let result = engine.execute(&0);
        assert_eq!(result.matched, 0);
        assert!(!result.evaluations[0].matched);
        assert!(matches!(
            result.evaluations[0].outcome,
            RuleOutcome::Error { .. }
        ));
    }

    #[test]
    fn mutation_invalidates_sorted_cache() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());
        engine
            .register(trace_rule("old", 10, Arc::clone(&trace), true))
            .unwrap();
        engine.execute(&0);

        engine
            .register(trace_rule("new-high", 99, Arc::clone(&trace), true))
            .unwrap();
        trace.lock().unwrap().clear();
        engine.execute(&0);
        assert_eq!(*trace.lock().unwrap(), vec!["new-high", "old"]);

        assert!(engine.remove("old"));
        assert!(!engine.remove("old"));
        trace.lock().unwrap().clear();
        engine.execute(&0);
        assert_eq!(*trace.lock().unwrap(), vec!["new-high"]);

        engine.clear();
        assert_eq!(engine.rule_count(), 0);
        assert_eq!(engine.execute(&0).total_evaluated, 0);
    }

    #[test]
    fn matching_rules_lists_without_executing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());
        engine
            .register(
                RuleBuilder::new("threshold")
                    .priority(7)
                    .when(|n: &u32| *n > 10)
                    .then(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .build(),
            )
            .unwrap();

        let matches = engine.matching_rules(&50);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule_id, "threshold");
        assert_eq!(matches[0].priority, 7);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert!(engine.matching_rules(&5).is_empty());
    }

    #[test]
    fn performance_tracking_accumulates() {
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions {
            track_performance: true,
            ..Default::default()
        });
        engine.register(RuleBuilder::new("tracked").build()).unwrap();

        engine.execute(&0);
        engine.execute(&0);
        engine.execute(&0);

        let metrics = engine.rule_metrics("tracked").unwrap();
        assert_eq!(metrics.executions, 3);
        assert!(metrics.min_duration <= metrics.max_duration);
        assert!(metrics.total_duration >= metrics.max_duration);
        assert_eq!(engine.all_metrics().len(), 1);
    }

    #[test]
    fn performance_tracking_disabled_by_default() {
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());
        engine.register(RuleBuilder::new("untracked").build()).unwrap();
        engine.execute(&0);
        assert!(engine.rule_metrics("untracked").is_none());
    }

    #[test]
    fn sync_execute_records_async_rules_as_errors() {
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());
        engine
            .register(
                RuleBuilder::new("async-only")
                    .when_async(|n: &u32| {
                        let n = *n;
                        Box::pin(async move { Ok(n > 0) })
                    })
                    .build(),
            )
            .unwrap();

        let result = engine.execute(&1);
        assert_eq!(result.matched, 0);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("execute_async"));
    }

    #[tokio::test]
    async fn execute_async_awaits_async_rules() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());
        engine
            .register(
                RuleBuilder::new("async-rule")
                    .priority(1)
                    .when_async(|n: &u32| {
                        let n = *n;
                        Box::pin(async move { Ok(n % 2 == 0) })
                    })
                    .then_async(move |_| {
                        let counter = Arc::clone(&counter);
                        Box::pin(async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                    })
                    .build(),
            )
            .unwrap();

        let cancel = CancellationToken::new();
        let result = engine.execute_async(&4, &cancel).await.unwrap();
        assert_eq!(result.matched, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let result = engine.execute_async(&3, &cancel).await.unwrap();
        assert_eq!(result.matched, 0);
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_rules() {
        let engine: RuleEngine<u32> = RuleEngine::new(EngineOptions::default());
        engine.register(RuleBuilder::new("any").build()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine.execute_async(&0, &cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
    }
}
