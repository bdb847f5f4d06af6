//! Rule-based login authorization.
//!
//! The authorization flow:
//! 1. Compile the configured rule tables into a [`RuleSet`] (fails on malformed rules)
//! 2. Evaluate the rules in order against the verified [`UserRecord`](crate::auth::UserRecord)
//! 3. Allow on the first satisfied rule, deny when none is satisfied
//!
//! An empty rule set places no restriction on who may log in.

mod engine;
mod error;
mod rules;

pub use engine::{AuthzResult, RuleOutcome, can_login, evaluate, evaluate_rule};
pub use error::AuthzError;
pub use rules::{Predicate, PredicateKind, Rule, RuleSet};
