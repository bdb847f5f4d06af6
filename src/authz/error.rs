//! Authorization errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("Login rule #{index} is malformed: {reason}")]
    RuleFormat { index: usize, reason: String },
}

impl AuthzError {
    pub fn rule_format(index: usize, reason: impl Into<String>) -> Self {
        Self::RuleFormat {
            index,
            reason: reason.into(),
        }
    }
}
