// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

use std::fmt;

/// Error type shared across the pema workspace.
///
/// Every failure in the reconstruction core is terminal for the run: a
/// silently-wrong averaged model is worse than a crash, so nothing here is
/// retried or downgraded to a warning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PemaError {
    /// Malformed user input or inconsistent checkpoint state.
    InvalidInput(String),
    /// Singular matrix, failed factorization, non-finite intermediate.
    NumericalIssue(String),
    /// Requested feature or tag has no registered implementation.
    NotSupported(String),
    /// IO failure, overflow, or exhausted system resource.
    ResourceLimit(String),
}

impl PemaError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn numerical_issue(msg: impl Into<String>) -> Self {
        Self::NumericalIssue(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    pub fn resource_limit(msg: impl Into<String>) -> Self {
        Self::ResourceLimit(msg.into())
    }

    /// Stable machine-readable code for structured error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NumericalIssue(_) => "numerical_issue",
            Self::NotSupported(_) => "not_supported",
            Self::ResourceLimit(_) => "resource_limit",
        }
    }
}

impl fmt::Display for PemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::NumericalIssue(msg) => write!(f, "numerical issue: {msg}"),
            Self::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Self::ResourceLimit(msg) => write!(f, "resource limit: {msg}"),
        }
    }
}

impl std::error::Error for PemaError {}

#[cfg(test)]
mod tests {
    use super::PemaError;

    #[test]
    fn codes_are_stable() {
        assert_eq!(PemaError::invalid_input("x").code(), "invalid_input");
        assert_eq!(PemaError::numerical_issue("x").code(), "numerical_issue");
        assert_eq!(PemaError::not_supported("x").code(), "not_supported");
        assert_eq!(PemaError::resource_limit("x").code(), "resource_limit");
    }

    #[test]
    fn display_includes_message() {
        let err = PemaError::numerical_issue("correlation matrix is singular");
        assert_eq!(
            err.to_string(),
            "numerical issue: correlation matrix is singular"
        );
    }
}
