// Rules - named, prioritized predicate + actions over a fact type

//! # Rule Module
//!
//! This module defines the rule type evaluated by the
//! [`RuleEngine`](crate::engine::rules::RuleEngine). A rule pairs a predicate
//! over a fact type with an ordered list of actions, plus identity and a
//! priority used for sort ordering. Rules come in three shapes:
//!
//! - **Leaf rules**: one predicate, zero or more actions; predicate and
//!   actions may be synchronous or asynchronous
//! - **Composite rules**: `all` (AND), `any` (OR), and `negate` (NOT)
//!   combinations of child rules - under `any`, *every* matching child
//!   executes its actions, not just the first
//! - **Default rules**: a builder without a predicate produces an
//!   always-matching rule
//!
//! Predicates and actions are fallible (`Result`); the engine records a
//! failure as a per-rule error without aborting sibling rules. When an
//! action fails after its predicate matched, the rule still counts as
//! matched - the condition did fire, the failure belongs to the action.
//!
//! ## Rust Learning Notes:
//!
//! ### Recursive Enums
//! `RuleBody` is recursive: `All` and `Any` hold vectors of `Rule`, and
//! `Not` boxes a single child to break the infinite-size chain.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{RelayError, Result};

/// Tagged per-rule evaluation outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Predicate matched and all actions completed
    Success,
    /// Predicate evaluated false; no actions ran
    NotMatched,
    /// Predicate or action failed; carries the failure message
    Error { message: String },
}

/// Synchronous, fallible predicate over a fact
type SyncPredicate<F> = Arc<dyn Fn(&F) -> Result<bool> + Send + Sync>;

/// Asynchronous predicate: reads the fact, returns an owned future
type AsyncPredicate<F> = Arc<dyn Fn(&F) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Synchronous, fallible action over a fact
type SyncAction<F> = Arc<dyn Fn(&F) -> Result<()> + Send + Sync>;

/// Asynchronous action: reads the fact, returns an owned future
type AsyncAction<F> = Arc<dyn Fn(&F) -> BoxFuture<'static, Result<()>> + Send + Sync>;

enum PredicateFn<F> {
    Sync(SyncPredicate<F>),
    Async(AsyncPredicate<F>),
}

enum ActionFn<F> {
    Sync(SyncAction<F>),
    Async(AsyncAction<F>),
}

enum RuleBody<F> {
    Leaf {
        predicate: PredicateFn<F>,
        actions: Vec<ActionFn<F>>,
    },
    /// AND: matches when every child matches
    All { children: Vec<Rule<F>> },
    /// OR: matches when at least one child matches; all matching children
    /// execute their actions
    Any { children: Vec<Rule<F>> },
    /// NOT: matches when the child does not match; executes no actions
    Not { child: Box<Rule<F>> },
}

/// A named, prioritized predicate + actions pair
///
/// Immutable once built. Registered into exactly one engine collection;
/// higher `priority` evaluates first.
///
/// ## Example:
/// ```
/// use agent_relay::{Rule, RuleBuilder};
///
/// let rule: Rule<i64> = RuleBuilder::new("positive")
///     .name("Value must be positive")
///     .priority(10)
///     .when(|n: &i64| *n > 0)
///     .build();
/// assert!(rule.matches(&5).unwrap());
/// assert!(!rule.matches(&-5).unwrap());
/// ```
pub struct Rule<F> {
    pub id: String,
    pub name: String,
    pub priority: i32,
    body: RuleBody<F>,
}

impl<F> std::fmt::Debug for Rule<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl<F> Rule<F> {
    /// AND combination: matches when every child matches
    ///
    /// An empty child list matches vacuously.
    pub fn all(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        children: Vec<Rule<F>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            body: RuleBody::All { children },
        }
    }

    /// OR combination: matches when at least one child matches
    ///
    /// An empty child list never matches. On execution, *every* matching
    /// child runs its actions.
    pub fn any(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        children: Vec<Rule<F>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            body: RuleBody::Any { children },
        }
    }

    /// NOT combination: matches when the child does not match
    pub fn negate(
        id: impl Into<String>,
        name: impl Into<String>,
        priority: i32,
        child: Rule<F>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority,
            body: RuleBody::Not {
                child: Box::new(child),
            },
        }
    }

    /// Whether any predicate or action in this rule requires awaiting
    pub fn is_async(&self) -> bool {
        match &self.body {
            RuleBody::Leaf { predicate, actions } => {
                matches!(predicate, PredicateFn::Async(_))
                    || actions.iter().any(|a| matches!(a, ActionFn::Async(_)))
            }
            RuleBody::All { children } | RuleBody::Any { children } => {
                children.iter().any(Rule::is_async)
            }
            RuleBody::Not { child } => child.is_async(),
        }
    }

    fn async_misuse(&self) -> RelayError {
        RelayError::Internal(format!(
            "rule '{}' contains async logic; evaluate it with execute_async",
            self.id
        ))
    }

    /// Evaluate the predicate without executing actions (synchronous path)
    ///
    /// Fails if this rule (or any child) is asynchronous.
    pub fn matches(&self, fact: &F) -> Result<bool> {
        match &self.body {
            RuleBody::Leaf { predicate, .. } => match predicate {
                PredicateFn::Sync(p) => p(fact),
                PredicateFn::Async(_) => Err(self.async_misuse()),
            },
            RuleBody::All { children } => {
                for child in children {
                    if !child.matches(fact)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            RuleBody::Any { children } => {
                for child in children {
                    if child.matches(fact)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            RuleBody::Not { child } => Ok(!child.matches(fact)?),
        }
    }

    /// Evaluate the predicate without executing actions (async path)
    ///
    /// Synchronous parts are called inline; async parts are awaited.
    pub fn matches_async<'a>(&'a self, fact: &'a F) -> BoxFuture<'a, Result<bool>>
    where
        F: Sync,
    {
        Box::pin(async move {
            match &self.body {
                RuleBody::Leaf { predicate, .. } => match predicate {
                    PredicateFn::Sync(p) => p(fact),
                    PredicateFn::Async(p) => p(fact).await,
                },
                RuleBody::All { children } => {
                    for child in children {
                        if !child.matches_async(fact).await? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                RuleBody::Any { children } => {
                    for child in children {
                        if child.matches_async(fact).await? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
                RuleBody::Not { child } => Ok(!child.matches_async(fact).await?),
            }
        })
    }

    /// Execute the actions of a matched rule (synchronous path)
    ///
    /// For `all`, every child's actions run in order. For `any`, each
    /// child's predicate is re-evaluated and only matching children run
    /// their actions. A failing action stops the remaining actions of this
    /// rule and surfaces as the rule's error.
    pub fn run_actions(&self, fact: &F) -> Result<()> {
        match &self.body {
            RuleBody::Leaf { actions, .. } => {
                for action in actions {
                    match action {
                        ActionFn::Sync(a) => a(fact)?,
                        ActionFn::Async(_) => return Err(self.async_misuse()),
                    }
                }
                Ok(())
            }
            RuleBody::All { children } => {
                for child in children {
                    child.run_actions(fact)?;
                }
                Ok(())
            }
            RuleBody::Any { children } => {
                for child in children {
                    if child.matches(fact)? {
                        child.run_actions(fact)?;
                    }
                }
                Ok(())
            }
            RuleBody::Not { .. } => Ok(()),
        }
    }

    /// Execute the actions of a matched rule (async path)
    pub fn run_actions_async<'a>(&'a self, fact: &'a F) -> BoxFuture<'a, Result<()>>
    where
        F: Sync,
    {
        Box::pin(async move {
            match &self.body {
                RuleBody::Leaf { actions, .. } => {
                    for action in actions {
                        match action {
                            ActionFn::Sync(a) => a(fact)?,
                            ActionFn::Async(a) => a(fact).await?,
                        }
                    }
                    Ok(())
                }
                RuleBody::All { children } => {
                    for child in children {
                        child.run_actions_async(fact).await?;
                    }
                    Ok(())
                }
                RuleBody::Any { children } => {
                    for child in children {
                        if child.matches_async(fact).await? {
                            child.run_actions_async(fact).await?;
                        }
                    }
                    Ok(())
                }
                RuleBody::Not { .. } => Ok(()),
            }
        })
    }
}

/// Fluent construction of leaf rules
///
/// A builder without a `when*` call produces an always-matching rule; a
/// builder without a `name` uses the id as the name.
///
/// ## Example:
/// ```
/// use agent_relay::RuleBuilder;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let hits = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&hits);
/// let rule = RuleBuilder::new("count-large")
///     .priority(5)
///     .when(|n: &u32| *n > 100)
///     .then(move |_n| { counter.fetch_add(1, Ordering::SeqCst); })
///     .build();
///
/// assert!(rule.matches(&200).unwrap());
/// rule.run_actions(&200).unwrap();
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
pub struct RuleBuilder<F> {
    id: String,
    name: Option<String>,
    priority: i32,
    predicate: Option<PredicateFn<F>>,
    actions: Vec<ActionFn<F>>,
}

impl<F> RuleBuilder<F> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            priority: 0,
            predicate: None,
            actions: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Infallible predicate
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&F) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(PredicateFn::Sync(Arc::new(move |fact| Ok(predicate(fact)))));
        self
    }

    /// Fallible predicate; `Err` is recorded as a rule error, not a match
    pub fn when_try<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&F) -> Result<bool> + Send + Sync + 'static,
    {
        self.predicate = Some(PredicateFn::Sync(Arc::new(predicate)));
        self
    }

    /// Asynchronous predicate
    ///
    /// The closure reads the fact and returns an owned boxed future, so it
    /// may clone whatever fields it needs before awaiting:
    ///
    /// ```
    /// use agent_relay::RuleBuilder;
    ///
    /// let rule = RuleBuilder::new("async-check")
    ///     .when_async(|s: &String| {
    ///         let value = s.clone();
    ///         Box::pin(async move { Ok(value.len() > 3) })
    ///     })
    ///     .build();
    /// assert!(rule.is_async());
    /// ```
    pub fn when_async<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&F) -> BoxFuture<'static, Result<bool>> + Send + Sync + 'static,
    {
        self.predicate = Some(PredicateFn::Async(Arc::new(predicate)));
        self
    }

    /// Infallible action, appended in order
    pub fn then<A>(mut self, action: A) -> Self
    where
        A: Fn(&F) + Send + Sync + 'static,
    {
        self.actions.push(ActionFn::Sync(Arc::new(move |fact| {
            action(fact);
            Ok(())
        })));
        self
    }

    /// Fallible action; `Err` marks the rule as errored (matched stays true)
    pub fn then_try<A>(mut self, action: A) -> Self
    where
        A: Fn(&F) -> Result<()> + Send + Sync + 'static,
    {
        self.actions.push(ActionFn::Sync(Arc::new(action)));
        self
    }

    /// Asynchronous action; same owned-future shape as [`Self::when_async`]
    pub fn then_async<A>(mut self, action: A) -> Self
    where
        A: Fn(&F) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        self.actions.push(ActionFn::Async(Arc::new(action)));
        self
    }

    pub fn build(self) -> Rule<F> {
        let name = self.name.unwrap_or_else(|| self.id.clone());
        Rule {
            id: self.id,
            name,
            priority: self.priority,
            body: RuleBody::Leaf {
                // No predicate configured means the rule always matches
                predicate: self
                    .predicate
                    .unwrap_or_else(|| PredicateFn::Sync(Arc::new(|_| Ok(true)))),
                actions: self.actions,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_rule(id: &str, priority: i32, hits: Arc<AtomicUsize>, threshold: i64) -> Rule<i64> {
        RuleBuilder::new(id)
            .priority(priority)
            .when(move |n: &i64| *n >= threshold)
            .then(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .build()
    }

    #[test]
    fn builder_defaults_to_always_match_and_id_as_name() {
        let rule: Rule<i64> = RuleBuilder::new("anything").build();
        assert_eq!(rule.name, "anything");
        assert!(rule.matches(&0).unwrap());
        assert!(!rule.is_async());
    }

    #[test]
    fn and_requires_all_children() {
        let hits = Arc::new(AtomicUsize::new(0));
        let rule = Rule::all(
            "both",
            "Both thresholds",
            0,
            vec![
                counting_rule("low", 0, Arc::clone(&hits), 10),
                counting_rule("high", 0, Arc::clone(&hits), 100),
            ],
        );

        assert!(!rule.matches(&50).unwrap());
        assert!(rule.matches(&150).unwrap());

        // All children run their actions when the AND fires
        rule.run_actions(&150).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn or_runs_every_matching_child_action() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let rule = Rule::any(
            "any-threshold",
            "Any threshold",
            0,
            vec![
                counting_rule("ten", 0, Arc::clone(&first), 10),
                counting_rule("fifty", 0, Arc::clone(&second), 50),
                counting_rule("thousand", 0, Arc::clone(&third), 1000),
            ],
        );

        assert!(rule.matches(&60).unwrap());
        rule.run_actions(&60).unwrap();

        // Both matching children fire, the non-matching one does not
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_composites() {
        let all: Rule<i64> = Rule::all("empty-and", "vacuous", 0, vec![]);
        let any: Rule<i64> = Rule::any("empty-or", "never", 0, vec![]);
        assert!(all.matches(&0).unwrap());
        assert!(!any.matches(&0).unwrap());
    }

    #[test]
    fn not_inverts_and_runs_no_actions() {
        let hits = Arc::new(AtomicUsize::new(0));
        let rule = Rule::negate(
            "not-large",
            "Not large",
            0,
            counting_rule("large", 0, Arc::clone(&hits), 100),
        );

        assert!(rule.matches(&5).unwrap());
        assert!(!rule.matches(&500).unwrap());

        rule.run_actions(&5).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fallible_predicate_propagates_error() {
        let rule: Rule<i64> = RuleBuilder::new("broken")
            .when_try(|_| Err(RelayError::Internal("boom".into())))
            .build();
        assert!(rule.matches(&1).is_err());
    }

    #[test]
    fn failing_action_stops_remaining_actions() {
        let hits = Arc::new(AtomicUsize::new(0));
        let after = Arc::clone(&hits);
        let rule: Rule<i64> = RuleBuilder::new("partial")
            .then_try(|_| Err(RelayError::Internal("first action failed".into())))
            .then(move |_| {
                after.fetch_add(1, Ordering::SeqCst);
            })
            .build();

        assert!(rule.run_actions(&1).is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sync_path_rejects_async_rules() {
        let rule: Rule<i64> = RuleBuilder::new("needs-await")
            .when_async(|n: &i64| {
                let n = *n;
                Box::pin(async move { Ok(n > 0) })
            })
            .build();

        assert!(rule.is_async());
        let err = rule.matches(&1).unwrap_err();
        assert!(err.to_string().contains("execute_async"));
    }

    #[tokio::test]
    async fn async_path_handles_mixed_rules() {
        let rule: Rule<i64> = Rule::all(
            "mixed",
            "sync and async children",
            0,
            vec![
                RuleBuilder::new("sync-child").when(|n: &i64| *n > 0).build(),
                RuleBuilder::new("async-child")
                    .when_async(|n: &i64| {
                        let n = *n;
                        Box::pin(async move { Ok(n < 100) })
                    })
                    .build(),
            ],
        );

        assert!(rule.matches_async(&50).await.unwrap());
        assert!(!rule.matches_async(&500).await.unwrap());
    }
}
