//! Normalized representation of one authenticated identity.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

use super::{AuthError, schema};

/// One institutional affiliation from the authorization-info claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    /// Institution code (e.g. `014569`).
    #[serde(rename = "id")]
    pub unit_code: String,

    /// Institution display name.
    #[serde(rename = "name", default, deserialize_with = "null_as_empty")]
    pub unit_name: String,

    /// Identity within the institution (teacher, student, ...).
    #[serde(default, deserialize_with = "null_as_empty")]
    pub role: String,

    /// Job title, may be empty.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,

    /// Job-function tags, may be empty.
    #[serde(default, deserialize_with = "null_as_empty_set")]
    pub groups: BTreeSet<String>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_empty_set<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeSet<String>, D::Error> {
    Ok(Option::<BTreeSet<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A verified user: scalar claims, authorization records and account id.
///
/// Every requested claim has an entry in `claims`; claims the provider did not
/// return are stored as `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    claims: BTreeMap<String, Option<String>>,
    auth_info: Vec<AuthRecord>,
    account_id: String,
}

/// Data presented to the user when they hold more than one affiliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChoices {
    pub name: Option<String>,
    pub auth_infos: Vec<AuthRecord>,
}

impl UserRecord {
    /// Build a record from the attributes of a verified provider response.
    ///
    /// `identity_url` is the identity asserted by the provider; its last path
    /// segment becomes the account id.
    pub fn from_claims(
        raw: &HashMap<String, String>,
        identity_url: &str,
        required: &[String],
    ) -> Result<Self, AuthError> {
        let account_id = account_id_from_identity(identity_url).ok_or_else(|| {
            AuthError::ProviderData(format!("identity URL has no account segment: {identity_url}"))
        })?;

        let auth_info = match raw.get(schema::AUTH_INFO) {
            Some(payload) => parse_auth_info(payload)?,
            None => Vec::new(),
        };

        let mut claims: BTreeMap<String, Option<String>> = raw
            .iter()
            .filter(|(name, _)| name.as_str() != schema::AUTH_INFO)
            .map(|(name, value)| (name.clone(), Some(value.clone())))
            .collect();
        for name in required.iter().filter(|n| n.as_str() != schema::AUTH_INFO) {
            claims.entry(name.clone()).or_insert(None);
        }

        tracing::debug!(
            account_id = %account_id,
            claims = claims.len(),
            affiliations = auth_info.len(),
            "Normalized OpenID user data"
        );

        Ok(Self {
            claims,
            auth_info,
            account_id,
        })
    }

    /// Raw value of a scalar claim, `None` when the provider did not return it.
    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(|v| v.as_deref())
    }

    pub fn claims(&self) -> &BTreeMap<String, Option<String>> {
        &self.claims
    }

    pub fn auth_info(&self) -> &[AuthRecord] {
        &self.auth_info
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Whether the user must pick one affiliation before the login check.
    pub fn has_multiple_roles(&self) -> bool {
        self.auth_info.len() > 1
    }

    pub fn role_choices(&self) -> RoleChoices {
        RoleChoices {
            name: self.claim(schema::NAME).map(str::to_string),
            auth_infos: self.auth_info.clone(),
        }
    }

    /// Narrow the authorization records to the single zero-based `index`.
    pub fn select_role(&mut self, index: usize) -> Result<(), AuthError> {
        let available = self.auth_info.len();
        if index >= available {
            return Err(AuthError::InvalidRoleSelection { index, available });
        }
        let chosen = self.auth_info.swap_remove(index);
        tracing::debug!(
            account_id = %self.account_id,
            unit_code = %chosen.unit_code,
            role = %chosen.role,
            "Selected login role"
        );
        self.auth_info = vec![chosen];
        Ok(())
    }
}

/// Decode the JSON authorization-info claim.
pub fn parse_auth_info(payload: &str) -> Result<Vec<AuthRecord>, AuthError> {
    let records: Vec<AuthRecord> = serde_json::from_str(payload)
        .map_err(|e| AuthError::ProviderData(format!("authorization info is not valid: {e}")))?;

    if let Some(pos) = records.iter().position(|r| r.unit_code.trim().is_empty()) {
        return Err(AuthError::ProviderData(format!(
            "authorization record #{pos} has an empty unit code"
        )));
    }

    Ok(records)
}

/// Last non-empty path segment of an identity URL.
///
/// A URL without a path segment names the provider, not a user.
pub fn account_id_from_identity(identity_url: &str) -> Option<String> {
    let url = Url::parse(identity_url).ok()?;
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(str::to_string)
}
