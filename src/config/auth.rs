use serde::{Deserialize, Serialize};
use url::Url;

use super::ConfigError;
use crate::{
    auth::schema::{self, default_required},
    authz::{AuthzError, RuleSet},
};

/// OpenID provider and login policy configuration.
///
/// # Example
///
/// ```toml
/// [openid]
/// identity = "https://openid.ntpc.edu.tw/"
/// return_to = "https://app.example.org/ntpcopenid/login"
///
/// [[openid.can_login_rules]]
/// unitCode = "014569"
/// role = ["teacher", "student"]
///
/// [openid.redirects]
/// login_allow = "/home"
/// login_deny = "/denied"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenidConfig {
    /// Provider identity base URL.
    #[serde(default = "default_identity")]
    pub identity: String,

    /// OP endpoint receiving `checkid_setup` and `check_authentication`.
    /// Defaults to `identity`.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// URL the provider sends the user back to. Must route to the login callback.
    #[serde(default = "default_return_to")]
    pub return_to: String,

    /// OpenID realm. Defaults to the origin of `return_to`.
    #[serde(default)]
    pub realm: Option<String>,

    /// Claims requested from the provider.
    #[serde(default = "default_required")]
    pub required: Vec<String>,

    /// Path prefix of the login routes.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Login rules. Empty means anyone the provider verifies may log in.
    #[serde(default)]
    pub can_login_rules: Vec<serde_json::Value>,

    /// Where the user is sent at the end of each flow.
    #[serde(default)]
    pub redirects: RedirectConfig,
}

impl Default for OpenidConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            endpoint: None,
            return_to: default_return_to(),
            realm: None,
            required: default_required(),
            prefix: default_prefix(),
            can_login_rules: Vec::new(),
            redirects: RedirectConfig::default(),
        }
    }
}

fn default_identity() -> String {
    "https://openid.ntpc.edu.tw/".to_string()
}

fn default_return_to() -> String {
    "http://localhost:8080/ntpcopenid/login".to_string()
}

fn default_prefix() -> String {
    "ntpcopenid".to_string()
}

impl OpenidConfig {
    pub fn endpoint(&self) -> &str {
        self.endpoint.as_deref().unwrap_or(&self.identity)
    }

    pub fn realm(&self) -> String {
        if let Some(realm) = &self.realm {
            return realm.clone();
        }
        match Url::parse(&self.return_to) {
            Ok(url) => format!("{}/", url.origin().ascii_serialization()),
            Err(_) => self.return_to.clone(),
        }
    }

    /// Route prefix with a leading slash and no trailing slash.
    pub fn route_prefix(&self) -> String {
        let trimmed = self.prefix.trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }

    /// Compile the configured login rules.
    pub fn rules(&self) -> Result<RuleSet, AuthzError> {
        RuleSet::compile(&self.can_login_rules)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("openid.identity", self.identity.as_str()),
            ("openid.endpoint", self.endpoint()),
            ("openid.return_to", self.return_to.as_str()),
        ] {
            Url::parse(value).map_err(|e| {
                ConfigError::Validation(format!("{field} is not a valid URL ({value}): {e}"))
            })?;
        }

        if self.required.is_empty() {
            return Err(ConfigError::Validation(
                "openid.required must list at least one claim".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = self.required.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(ConfigError::Validation(format!(
                "openid.required lists {dup} more than once"
            )));
        }
        if !self.required.iter().any(|n| n == schema::AUTH_INFO) {
            tracing::warn!(
                "openid.required does not request {}; login rules on unit, role, title or group \
                 will never match",
                schema::AUTH_INFO
            );
        }

        let rules = self.rules()?;
        if rules.is_empty() {
            tracing::info!("No login rules configured; every verified user may log in");
        }

        Ok(())
    }
}

/// Redirect targets for each end of the login flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedirectConfig {
    /// The user cancelled at the provider.
    #[serde(default = "default_redirect")]
    pub user_cancel: String,

    /// The assertion could not be verified or its data was unusable.
    #[serde(default = "default_redirect")]
    pub validate_fail: String,

    /// The login rules allowed the user.
    #[serde(default = "default_redirect")]
    pub login_allow: String,

    /// The login rules denied the user.
    #[serde(default = "default_redirect")]
    pub login_deny: String,

    /// The callback was reached outside of a login flow.
    #[serde(default = "default_redirect")]
    pub other: String,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            user_cancel: default_redirect(),
            validate_fail: default_redirect(),
            login_allow: default_redirect(),
            login_deny: default_redirect(),
            other: default_redirect(),
        }
    }
}

fn default_redirect() -> String {
    "/".to_string()
}

/// Login session cookie configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Cookie name.
    #[serde(default = "default_session_cookie")]
    pub cookie_name: String,

    /// How long a verified user is kept, in seconds.
    #[serde(default = "default_session_duration")]
    pub duration_secs: u64,

    /// Secure cookie (HTTPS only).
    #[serde(default = "default_true")]
    pub secure: bool,

    /// SameSite cookie attribute.
    #[serde(default)]
    pub same_site: SameSite,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_session_cookie(),
            duration_secs: default_session_duration(),
            secure: true,
            same_site: SameSite::default(),
        }
    }
}

fn default_session_cookie() -> String {
    "ntpcopenid_session".to_string()
}

fn default_session_duration() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SameSite {
    #[default]
    Lax,
    Strict,
    None,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OpenidConfig::default();
        assert_eq!(config.endpoint(), "https://openid.ntpc.edu.tw/");
        assert_eq!(config.required.len(), 9);
        assert_eq!(config.route_prefix(), "/ntpcopenid");
        assert_eq!(config.realm(), "http://localhost:8080/");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_endpoint_and_realm() {
        let config = OpenidConfig {
            endpoint: Some("https://openid.ntpc.edu.tw/server".into()),
            realm: Some("https://*.example.org/".into()),
            ..OpenidConfig::default()
        };
        assert_eq!(config.endpoint(), "https://openid.ntpc.edu.tw/server");
        assert_eq!(config.realm(), "https://*.example.org/");
    }

    #[test]
    fn test_route_prefix_normalized() {
        let mut config = OpenidConfig {
            prefix: "/auth/ntpc/".into(),
            ..OpenidConfig::default()
        };
        assert_eq!(config.route_prefix(), "/auth/ntpc");
        config.prefix = "/".into();
        assert_eq!(config.route_prefix(), "");
    }

    #[test]
    fn test_duplicate_required_claim_rejected() {
        let config = OpenidConfig {
            required: vec![schema::NAME.into(), schema::NAME.into()],
            ..OpenidConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_malformed_rule_rejected_at_validation() {
        let config = OpenidConfig {
            can_login_rules: vec![serde_json::json!("teacher")],
            ..OpenidConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Rules(AuthzError::RuleFormat { index: 0, .. }))
        ));
    }
}
