//! Login rule evaluation.
//!
//! Rules are tried in order and the first satisfied rule allows the login.
//! Within a rule, predicates are checked in order and the first failing
//! predicate ends that rule; later predicates are not evaluated.

use std::collections::BTreeSet;

use super::rules::{Predicate, PredicateKind, Rule, RuleSet};
use crate::auth::{PerUnit, UserRecord};

/// Outcome of evaluating a rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzResult {
    pub allowed: bool,
    /// Index of the rule that allowed the login; `None` when the rule set is
    /// empty or nothing matched.
    pub matched_rule: Option<usize>,
}

/// Outcome of evaluating a single rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleOutcome {
    pub satisfied: bool,
    /// Number of predicates evaluated before the rule was decided.
    pub evaluated: usize,
    /// Predicate that failed, if any.
    pub failed_at: Option<PredicateKind>,
}

/// Whether `user` may log in under `rules`.
pub fn can_login(rules: &RuleSet, user: &UserRecord) -> bool {
    evaluate(rules, user).allowed
}

pub fn evaluate(rules: &RuleSet, user: &UserRecord) -> AuthzResult {
    if rules.is_empty() {
        tracing::debug!(account_id = %user.account_id(), "No login rules configured, allowing");
        return AuthzResult {
            allowed: true,
            matched_rule: None,
        };
    }

    for (index, rule) in rules.rules().iter().enumerate() {
        let outcome = evaluate_rule(rule, user);
        if outcome.satisfied {
            tracing::debug!(
                account_id = %user.account_id(),
                rule = index,
                "Login rule satisfied"
            );
            return AuthzResult {
                allowed: true,
                matched_rule: Some(index),
            };
        }
        tracing::trace!(
            account_id = %user.account_id(),
            rule = index,
            failed_at = ?outcome.failed_at,
            "Login rule not satisfied"
        );
    }

    AuthzResult {
        allowed: false,
        matched_rule: None,
    }
}

pub fn evaluate_rule(rule: &Rule, user: &UserRecord) -> RuleOutcome {
    let scope = rule.unit_scope();
    let mut evaluated = 0;
    for predicate in rule.predicates() {
        evaluated += 1;
        if !check(predicate, scope, user) {
            return RuleOutcome {
                satisfied: false,
                evaluated,
                failed_at: Some(predicate.kind()),
            };
        }
    }
    RuleOutcome {
        satisfied: true,
        evaluated,
        failed_at: None,
    }
}

fn check(predicate: &Predicate, scope: Option<&str>, user: &UserRecord) -> bool {
    match predicate {
        Predicate::UnitCode(code) => user
            .unit_codes()
            .is_some_and(|codes| codes.contains(code.as_str())),
        Predicate::Role(wanted) => intersects(user.roles(), scope, wanted),
        Predicate::Title(wanted) => intersects(user.titles(), scope, wanted),
        Predicate::Group(wanted) => intersects(user.groups(), scope, wanted),
        Predicate::OpenId(wanted) => wanted.contains(user.account_id()),
    }
}

/// Whether any value held for `scope` (or any unit when unscoped) is wanted.
fn intersects(held: Option<PerUnit<'_>>, scope: Option<&str>, wanted: &BTreeSet<String>) -> bool {
    let Some(held) = held else {
        return false;
    };
    let hit = |values: &BTreeSet<&str>| values.iter().any(|v| wanted.contains(*v));
    match scope {
        Some(unit) => held.get(unit).is_some_and(hit),
        None => held.values().any(hit),
    }
}
