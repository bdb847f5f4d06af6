//! OpenID 2.0 adapter.
//!
//! The core only needs three things from the protocol layer: whether an
//! assertion is valid, the attributes it carries and the asserted identity.
//! [`OpenidVerifier`] is that seam. [`DirectVerifier`] implements it with
//! stateless direct verification (`check_authentication`) against the
//! configured OP endpoint; discovery and associations are not used.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;

use super::{AuthError, schema};
use crate::config::OpenidConfig;

pub const OPENID_NS: &str = "http://specs.openid.net/auth/2.0";
pub const IDENTIFIER_SELECT: &str = "http://specs.openid.net/auth/2.0/identifier_select";
pub const AX_NS: &str = "http://openid.net/srv/ax/1.0";

/// How far a `response_nonce` timestamp may lie from our clock, in seconds.
const NONCE_WINDOW_SECS: i64 = 300;

/// Fields a positive assertion must always sign.
const ALWAYS_SIGNED: [&str; 4] = ["op_endpoint", "return_to", "response_nonce", "assoc_handle"];

/// What the provider reported in `openid.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionMode {
    /// The user declined to authorize.
    Cancel,
    /// Positive assertion, still to be verified.
    IdRes,
    /// Anything else, e.g. the return URL was opened directly.
    Other,
}

/// `openid.*` parameters of a provider redirect.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct CallbackParams(HashMap<String, String>);

impl CallbackParams {
    pub fn new(params: HashMap<String, String>) -> Self {
        Self(params)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn mode(&self) -> AssertionMode {
        match self.get("openid.mode") {
            Some("cancel") => AssertionMode::Cancel,
            Some("id_res") => AssertionMode::IdRes,
            _ => AssertionMode::Other,
        }
    }

    /// The asserted identity URL.
    pub fn identity_url(&self) -> Option<&str> {
        self.get("openid.identity")
            .or_else(|| self.get("openid.claimed_id"))
    }

    /// Field names listed in `openid.signed`, without the `openid.` prefix.
    pub fn signed_fields(&self) -> BTreeSet<&str> {
        self.get("openid.signed")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fields that must be covered by the signature but are not.
    ///
    /// `claimed_id` and `identity` are required only when present.
    pub fn unsigned_required_fields(&self) -> Vec<&'static str> {
        let signed = self.signed_fields();
        let mut required = ALWAYS_SIGNED.to_vec();
        if self.get("openid.claimed_id").is_some() {
            required.push("claimed_id");
        }
        if self.get("openid.identity").is_some() {
            required.push("identity");
        }
        required.retain(|field| !signed.contains(field));
        required
    }

    /// The parameters covered by the provider's signature.
    ///
    /// A verified signature vouches only for these, so identity and
    /// attributes must be read from the returned subset.
    pub fn signed(&self) -> CallbackParams {
        let signed = self.signed_fields();
        let kept = self
            .0
            .iter()
            .filter(|(key, _)| {
                matches!(
                    key.as_str(),
                    "openid.ns" | "openid.mode" | "openid.signed" | "openid.sig"
                ) || key
                    .strip_prefix("openid.")
                    .is_some_and(|field| signed.contains(field))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        CallbackParams(kept)
    }

    /// Attribute Exchange values keyed by claim name.
    ///
    /// Multi-valued attributes contribute their first value.
    pub fn claims(&self) -> HashMap<String, String> {
        let alias = self
            .iter()
            .find_map(|(k, v)| {
                (v == AX_NS)
                    .then(|| k.strip_prefix("openid.ns."))
                    .flatten()
            })
            .unwrap_or("ax");

        let type_prefix = format!("openid.{alias}.type.");
        let mut claims = HashMap::new();
        for (key, uri) in self.iter() {
            let Some(attr) = key.strip_prefix(type_prefix.as_str()) else {
                continue;
            };
            let Some(name) = schema::claim_from_type_uri(uri) else {
                continue;
            };
            let value = self
                .get(&format!("openid.{alias}.value.{attr}"))
                .or_else(|| self.get(&format!("openid.{alias}.value.{attr}.1")));
            if let Some(value) = value {
                claims.insert(name.to_string(), value.to_string());
            }
        }
        claims
    }
}

/// Verifies positive assertions.
#[async_trait]
pub trait OpenidVerifier: Send + Sync {
    async fn verify(&self, params: &CallbackParams) -> Result<bool, AuthError>;
}

/// Build the `checkid_setup` URL that starts a login.
pub fn auth_url(config: &OpenidConfig) -> Result<String, AuthError> {
    let mut url = Url::parse(config.endpoint())
        .map_err(|e| AuthError::Verification(format!("invalid OP endpoint: {e}")))?;

    let aliases: Vec<String> = config.required.iter().map(|n| schema::ax_alias(n)).collect();
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("openid.ns", OPENID_NS)
            .append_pair("openid.mode", "checkid_setup")
            .append_pair("openid.return_to", &config.return_to)
            .append_pair("openid.realm", &config.realm())
            .append_pair("openid.identity", IDENTIFIER_SELECT)
            .append_pair("openid.claimed_id", IDENTIFIER_SELECT)
            .append_pair("openid.ns.ax", AX_NS)
            .append_pair("openid.ax.mode", "fetch_request");
        for (name, alias) in config.required.iter().zip(&aliases) {
            query.append_pair(&format!("openid.ax.type.{alias}"), &schema::ax_type_uri(name));
        }
        query.append_pair("openid.ax.required", &aliases.join(","));
    }

    Ok(url.into())
}

/// Seconds-resolution UTC timestamp that starts every `response_nonce`.
fn nonce_timestamp(nonce: &str) -> Option<DateTime<Utc>> {
    let stamp = nonce.get(..20)?;
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Nonces of accepted assertions, remembered for the clock window.
struct NonceCache {
    window: chrono::Duration,
    seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NonceCache {
    fn new(window: chrono::Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn is_fresh(&self, issued: DateTime<Utc>) -> bool {
        let now = Utc::now();
        (now - issued).abs() <= self.window
    }

    async fn contains(&self, nonce: &str) -> bool {
        self.seen.lock().await.contains_key(nonce)
    }

    /// Record an accepted nonce. Returns false if it was accepted before.
    async fn insert(&self, nonce: &str, issued: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let window = self.window;
        let mut seen = self.seen.lock().await;
        // Nonces outside the window are rejected as stale anyway
        seen.retain(|_, at| now - *at <= window);
        if seen.contains_key(nonce) {
            return false;
        }
        seen.insert(nonce.to_string(), issued);
        true
    }
}

/// Stateless verification by asking the provider to check its own signature.
///
/// Besides the provider's verdict, an assertion must sign the endpoint,
/// return URL, nonce and identity fields, and its nonce must be fresh and
/// unseen.
pub struct DirectVerifier {
    endpoint: String,
    return_to: String,
    http_client: reqwest::Client,
    nonces: NonceCache,
}

impl DirectVerifier {
    pub fn new(config: &OpenidConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: &OpenidConfig, http_client: reqwest::Client) -> Self {
        Self {
            endpoint: config.endpoint().to_string(),
            return_to: config.return_to.clone(),
            http_client,
            nonces: NonceCache::new(chrono::Duration::seconds(NONCE_WINDOW_SECS)),
        }
    }

    fn same_endpoint(&self, asserted: &str) -> bool {
        asserted.trim_end_matches('/') == self.endpoint.trim_end_matches('/')
    }

    /// Scheme, host, port and path must equal the configured return URL.
    fn same_return_to(&self, asserted: &str) -> bool {
        let (Ok(expected), Ok(asserted)) = (Url::parse(&self.return_to), Url::parse(asserted))
        else {
            return false;
        };
        expected.scheme() == asserted.scheme()
            && expected.host_str() == asserted.host_str()
            && expected.port_or_known_default() == asserted.port_or_known_default()
            && expected.path() == asserted.path()
    }
}

#[async_trait]
impl OpenidVerifier for DirectVerifier {
    async fn verify(&self, params: &CallbackParams) -> Result<bool, AuthError> {
        if params.mode() != AssertionMode::IdRes {
            return Ok(false);
        }

        match params.get("openid.op_endpoint") {
            Some(asserted) if self.same_endpoint(asserted) => {}
            other => {
                tracing::warn!(
                    op_endpoint = other.unwrap_or("<missing>"),
                    "Assertion names an unexpected OP endpoint"
                );
                return Ok(false);
            }
        }

        if !params
            .get("openid.return_to")
            .is_some_and(|r| self.same_return_to(r))
        {
            tracing::warn!("Assertion return_to does not match the configured URL");
            return Ok(false);
        }

        let unsigned = params.unsigned_required_fields();
        if !unsigned.is_empty() {
            tracing::warn!(fields = ?unsigned, "Assertion leaves required fields unsigned");
            return Ok(false);
        }

        let nonce = params.get("openid.response_nonce").unwrap_or_default();
        let Some(issued) = nonce_timestamp(nonce).filter(|t| self.nonces.is_fresh(*t)) else {
            tracing::warn!(nonce = %nonce, "Assertion nonce is malformed or stale");
            return Ok(false);
        };
        if self.nonces.contains(nonce).await {
            tracing::warn!(nonce = %nonce, "Assertion nonce was already used");
            return Ok(false);
        }

        let form: Vec<(&str, &str)> = params
            .iter()
            .filter(|(k, _)| k.starts_with("openid."))
            .map(|(k, v)| {
                if k == "openid.mode" {
                    (k, "check_authentication")
                } else {
                    (k, v)
                }
            })
            .collect();

        tracing::debug!(endpoint = %self.endpoint, "Sending check_authentication");

        let response = self
            .http_client
            .post(&self.endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to reach OpenID provider");
                AuthError::Verification(format!("provider unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            tracing::error!(status = %status, "check_authentication returned error");
            return Err(AuthError::Verification(format!(
                "check_authentication returned {status}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Verification(format!("unreadable response: {e}")))?;

        let is_valid = parse_key_values(&body).get("is_valid").copied() == Some("true");
        if !is_valid {
            tracing::info!("Provider rejected the assertion");
            return Ok(false);
        }

        // Concurrent replays can both pass the lookup above; only one insert wins.
        if !self.nonces.insert(nonce, issued).await {
            tracing::warn!(nonce = %nonce, "Assertion nonce was already used");
            return Ok(false);
        }
        Ok(true)
    }
}

/// Parse an OpenID key-value form (`key:value` per line).
fn parse_key_values(body: &str) -> HashMap<&str, &str> {
    body.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect()
}
