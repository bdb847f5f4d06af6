//! Login rules.
//!
//! A rule is a table of predicates drawn from a closed vocabulary:
//!
//! ```toml
//! [[openid.can_login_rules]]
//! unitCode = "014569"
//! role = ["teacher", "student"]
//!
//! [[openid.can_login_rules]]
//! openID = "somebody"
//! ```
//!
//! `unitCode` takes a single string. The other keys take a string or a list
//! of strings meaning "any of". Keys outside the vocabulary are skipped with
//! a warning, so a typo in a key widens the rule instead of rejecting it.

use std::collections::BTreeSet;

use serde_json::Value;

use super::AuthzError;

/// Predicate vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredicateKind {
    UnitCode,
    Role,
    Title,
    Group,
    OpenId,
}

impl PredicateKind {
    pub const ALL: [PredicateKind; 5] = [
        PredicateKind::UnitCode,
        PredicateKind::Role,
        PredicateKind::Title,
        PredicateKind::Group,
        PredicateKind::OpenId,
    ];

    /// Key used in configuration files.
    pub fn key(&self) -> &'static str {
        match self {
            PredicateKind::UnitCode => "unitCode",
            PredicateKind::Role => "role",
            PredicateKind::Title => "title",
            PredicateKind::Group => "group",
            PredicateKind::OpenId => "openID",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key)
    }
}

/// One required condition of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// The user must belong to this unit.
    UnitCode(String),
    /// The user must hold any of these roles.
    Role(BTreeSet<String>),
    /// The user must hold any of these titles.
    Title(BTreeSet<String>),
    /// The user must carry any of these group tags.
    Group(BTreeSet<String>),
    /// The user's account id must be one of these.
    OpenId(BTreeSet<String>),
}

impl Predicate {
    pub fn kind(&self) -> PredicateKind {
        match self {
            Predicate::UnitCode(_) => PredicateKind::UnitCode,
            Predicate::Role(_) => PredicateKind::Role,
            Predicate::Title(_) => PredicateKind::Title,
            Predicate::Group(_) => PredicateKind::Group,
            Predicate::OpenId(_) => PredicateKind::OpenId,
        }
    }
}

/// Predicates AND-combined, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rule {
    predicates: Vec<Predicate>,
}

impl Rule {
    pub fn new(predicates: Vec<Predicate>) -> Self {
        Self { predicates }
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    /// Unit the rule's role/title/group checks are restricted to.
    pub fn unit_scope(&self) -> Option<&str> {
        self.predicates.iter().find_map(|p| match p {
            Predicate::UnitCode(code) => Some(code.as_str()),
            _ => None,
        })
    }
}

/// Rules OR-combined. Empty means no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Compile configured rule tables.
    ///
    /// Every entry is checked to be a table before any is compiled, so a
    /// single malformed entry rejects the whole list.
    pub fn compile(values: &[Value]) -> Result<Self, AuthzError> {
        if let Some(index) = values.iter().position(|v| !v.is_object()) {
            return Err(AuthzError::rule_format(index, "each rule must be a table"));
        }

        let rules = values
            .iter()
            .enumerate()
            .map(|(index, value)| compile_rule(index, value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

fn compile_rule(index: usize, value: &Value) -> Result<Rule, AuthzError> {
    let Some(table) = value.as_object() else {
        return Err(AuthzError::rule_format(index, "each rule must be a table"));
    };

    let mut predicates = Vec::with_capacity(table.len());
    for (key, requirement) in table {
        let Some(kind) = PredicateKind::from_key(key) else {
            tracing::warn!(
                rule = index,
                key = %key,
                "Unknown login rule key is ignored"
            );
            continue;
        };

        let predicate = match kind {
            PredicateKind::UnitCode => match requirement {
                Value::String(code) => Predicate::UnitCode(code.clone()),
                _ => {
                    return Err(AuthzError::rule_format(index, "unitCode must be a string"));
                }
            },
            PredicateKind::Role => Predicate::Role(any_of(index, kind, requirement)?),
            PredicateKind::Title => Predicate::Title(any_of(index, kind, requirement)?),
            PredicateKind::Group => Predicate::Group(any_of(index, kind, requirement)?),
            PredicateKind::OpenId => Predicate::OpenId(any_of(index, kind, requirement)?),
        };
        predicates.push(predicate);
    }

    Ok(Rule { predicates })
}

fn any_of(index: usize, kind: PredicateKind, value: &Value) -> Result<BTreeSet<String>, AuthzError> {
    let invalid =
        || AuthzError::rule_format(index, format!("{} must be a string or list of strings", kind.key()));

    match value {
        Value::String(s) => Ok(BTreeSet::from([s.clone()])),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
            .collect(),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_compile_string_and_list_requirements() {
        let rules = RuleSet::compile(&[json!({
            "unitCode": "014569",
            "role": ["teacher", "student"],
            "title": "director"
        })])
        .unwrap();

        let rule = &rules.rules()[0];
        assert_eq!(rule.unit_scope(), Some("014569"));
        assert_eq!(
            rule.predicates(),
            &[
                Predicate::UnitCode("014569".into()),
                Predicate::Role(BTreeSet::from(["teacher".into(), "student".into()])),
                Predicate::Title(BTreeSet::from(["director".into()])),
            ]
        );
    }

    #[test]
    fn test_predicates_keep_configuration_order() {
        let rules = RuleSet::compile(&[json!({"group": "IT lead", "openID": "amy", "role": "x"})])
            .unwrap();
        let kinds: Vec<_> = rules.rules()[0].predicates().iter().map(Predicate::kind).collect();
        assert_eq!(
            kinds,
            vec![PredicateKind::Group, PredicateKind::OpenId, PredicateKind::Role]
        );
    }

    #[test]
    fn test_empty_list_compiles_to_empty_set() {
        let rules = RuleSet::compile(&[]).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn test_non_table_rule_rejects_whole_list() {
        let err = RuleSet::compile(&[json!({"role": "teacher"}), json!("teacher")]).unwrap_err();
        assert!(matches!(err, AuthzError::RuleFormat { index: 1, .. }));
    }

    #[test]
    fn test_non_table_reported_before_later_value_errors() {
        let err = RuleSet::compile(&[json!({"unitCode": 1}), json!(["x"])]).unwrap_err();
        assert!(matches!(err, AuthzError::RuleFormat { index: 1, .. }));
    }

    #[test]
    fn test_unit_code_must_be_string() {
        let err = RuleSet::compile(&[json!({"unitCode": ["A", "B"]})]).unwrap_err();
        assert!(matches!(err, AuthzError::RuleFormat { index: 0, .. }));
    }

    #[test]
    fn test_list_of_non_strings_rejected() {
        let err = RuleSet::compile(&[json!({"role": [1, 2]})]).unwrap_err();
        assert!(err.to_string().contains("role must be a string or list of strings"));
    }

    #[test]
    fn test_unknown_key_ignored() {
        let rules = RuleSet::compile(&[json!({"rol": "teacher", "unitCode": "A"})]).unwrap();
        assert_eq!(
            rules.rules()[0].predicates(),
            &[Predicate::UnitCode("A".into())]
        );
    }

    #[test]
    fn test_key_round_trip() {
        for kind in PredicateKind::ALL {
            assert_eq!(PredicateKind::from_key(kind.key()), Some(kind));
        }
        assert_eq!(PredicateKind::from_key("openid"), None);
    }
}
