//! Read-only projections over [`UserRecord`].
//!
//! Set-valued accessors aggregate across every authorization record, so a
//! user holding several affiliations is seen through all of them until a
//! role has been selected. They return `None` when the provider sent no
//! authorization records at all.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::Serialize;

use super::{AuthRecord, UserRecord, schema};

/// Gender as displayed to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    /// Map the provider's code: `M` is male, anything else female.
    pub fn from_code(code: &str) -> Self {
        if code == "M" { Gender::Male } else { Gender::Female }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Gender::Male => "男",
            Gender::Female => "女",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Grade, class and seat split out of the six-digit class code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassCode {
    pub grade: String,
    pub class_number: String,
    pub seat_number: String,
}

impl ClassCode {
    /// Split `GGCCSS`. Codes that are not exactly six characters are rejected.
    pub fn parse(code: &str) -> Option<Self> {
        let chars: Vec<char> = code.chars().collect();
        if chars.len() != 6 {
            return None;
        }
        let field = |i: usize| chars[i..i + 2].iter().collect::<String>();
        Some(Self {
            grade: field(0),
            class_number: field(2),
            seat_number: field(4),
        })
    }
}

/// Unit code to the set of values found for it.
pub type PerUnit<'a> = BTreeMap<&'a str, BTreeSet<&'a str>>;

impl UserRecord {
    pub fn nickname(&self) -> Option<&str> {
        self.claim(schema::NICKNAME)
    }

    pub fn email(&self) -> Option<&str> {
        self.claim(schema::EMAIL)
    }

    pub fn name(&self) -> Option<&str> {
        self.claim(schema::NAME)
    }

    pub fn birth_date(&self) -> Option<&str> {
        self.claim(schema::BIRTH_DATE)
    }

    pub fn gender(&self) -> Option<Gender> {
        self.claim(schema::GENDER).map(Gender::from_code)
    }

    pub fn id_code(&self) -> Option<&str> {
        self.claim(schema::ID_CODE)
    }

    pub fn unit_name(&self) -> Option<&str> {
        self.claim(schema::UNIT_NAME)
    }

    pub fn class_code(&self) -> Option<ClassCode> {
        let raw = self.claim(schema::CLASS_CODE)?;
        let parsed = ClassCode::parse(raw);
        if parsed.is_none() {
            tracing::warn!(
                account_id = %self.account_id(),
                class_code = %raw,
                "Class code is not six characters, ignoring"
            );
        }
        parsed
    }

    /// Distinct institution names across all affiliations.
    pub fn unit_full_names(&self) -> Option<BTreeSet<&str>> {
        self.distinct(|r| r.unit_name.as_str())
    }

    /// Distinct institution codes across all affiliations.
    pub fn unit_codes(&self) -> Option<BTreeSet<&str>> {
        self.distinct(|r| r.unit_code.as_str())
    }

    pub fn roles(&self) -> Option<PerUnit<'_>> {
        self.per_unit(|r| std::iter::once(r.role.as_str()))
    }

    /// Titles per unit. Records with an empty title contribute nothing.
    pub fn titles(&self) -> Option<PerUnit<'_>> {
        self.per_unit(|r| std::iter::once(r.title.as_str()).filter(|t| !t.is_empty()))
    }

    /// Union of job-function tags per unit.
    pub fn groups(&self) -> Option<PerUnit<'_>> {
        self.per_unit(|r| r.groups.iter().map(String::as_str))
    }

    fn distinct<'a, F>(&'a self, field: F) -> Option<BTreeSet<&'a str>>
    where
        F: Fn(&'a AuthRecord) -> &'a str,
    {
        if self.auth_info().is_empty() {
            return None;
        }
        Some(self.auth_info().iter().map(field).collect())
    }

    fn per_unit<'a, F, I>(&'a self, values: F) -> Option<PerUnit<'a>>
    where
        F: Fn(&'a AuthRecord) -> I,
        I: Iterator<Item = &'a str>,
    {
        if self.auth_info().is_empty() {
            return None;
        }
        let mut map = PerUnit::new();
        for record in self.auth_info() {
            map.entry(record.unit_code.as_str())
                .or_default()
                .extend(values(record));
        }
        Some(map)
    }
}
