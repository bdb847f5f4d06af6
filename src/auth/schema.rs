//! Attribute schema of the New Taipei City education OpenID provider.
//!
//! The provider reuses generic Attribute Exchange names for its own fields,
//! so several names do not mean what the axschema.org registry says they do.

/// Nickname.
pub const NICKNAME: &str = "namePerson/friendly";
/// Official e-mail address.
pub const EMAIL: &str = "contact/email";
/// Legal name.
pub const NAME: &str = "namePerson";
/// Birth date, e.g. `1973-01-16`.
pub const BIRTH_DATE: &str = "birthDate";
/// Single-letter gender code.
pub const GENDER: &str = "person/gender";
/// Personal identifier code.
pub const ID_CODE: &str = "contact/postalCode/home";
/// Institution (school) display name.
pub const UNIT_NAME: &str = "contact/country/home";
/// Six-digit grade / class / seat code.
pub const CLASS_CODE: &str = "pref/language";
/// JSON-encoded array of per-institution authorization records.
pub const AUTH_INFO: &str = "pref/timezone";

/// Claims requested when the configuration does not override them.
pub const DEFAULT_REQUIRED: [&str; 9] = [
    NICKNAME, EMAIL, NAME, BIRTH_DATE, GENDER, ID_CODE, UNIT_NAME, CLASS_CODE, AUTH_INFO,
];

/// Namespace prefix of Attribute Exchange type URIs.
pub const AX_TYPE_PREFIX: &str = "http://axschema.org/";

/// Attribute Exchange type URI for a claim name.
pub fn ax_type_uri(name: &str) -> String {
    format!("{AX_TYPE_PREFIX}{name}")
}

/// Claim name carried by an Attribute Exchange type URI, if it is an axschema.org URI.
pub fn claim_from_type_uri(uri: &str) -> Option<&str> {
    uri.strip_prefix(AX_TYPE_PREFIX).filter(|name| !name.is_empty())
}

/// Attribute Exchange alias for a claim name. Aliases may not contain `.` or `,`.
pub fn ax_alias(name: &str) -> String {
    name.replace(['/', '.', ','], "_")
}

pub(crate) fn default_required() -> Vec<String> {
    DEFAULT_REQUIRED.iter().map(|s| s.to_string()).collect()
}
