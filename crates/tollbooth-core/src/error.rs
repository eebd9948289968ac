use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Authority errors.
///
/// Every variant except `Internal` and `Storage` is a typed, non-fatal outcome
/// reported to the caller. None of them is ever accompanied by a partial
/// ledger or supply mutation.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("insufficient balance: need {required}, have {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("supply exhausted: need {required}, remaining {remaining}")]
    SupplyExhausted { required: u64, remaining: u64 },

    #[error("membership denied for '{subject}': {reason}")]
    MembershipDenied { subject: String, reason: String },

    #[error("certificate authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("certificate '{id}' expired at {expired_at}")]
    Expired { id: String, expired_at: i64 },

    #[error("certificate '{0}' was already presented")]
    ReplayDetected(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("upstream '{service}' unavailable: {message}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),
}

/// Stable, serializable tag for an [`AuthorityError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    InsufficientFunds,
    SupplyExhausted,
    MembershipDenied,
    AuthenticationFailure,
    Expired,
    ReplayDetected,
    PermissionDenied,
    UpstreamUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidArgument => "invalid_argument",
            Self::InsufficientFunds => "insufficient_funds",
            Self::SupplyExhausted => "supply_exhausted",
            Self::MembershipDenied => "membership_denied",
            Self::AuthenticationFailure => "authentication_failure",
            Self::Expired => "expired",
            Self::ReplayDetected => "replay_detected",
            Self::PermissionDenied => "permission_denied",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Internal => "internal",
        }
    }
}

impl AuthorityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::SupplyExhausted { .. } => ErrorKind::SupplyExhausted,
            Self::MembershipDenied { .. } => ErrorKind::MembershipDenied,
            Self::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            Self::Expired { .. } => ErrorKind::Expired,
            Self::ReplayDetected(_) => ErrorKind::ReplayDetected,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::Storage(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Only upstream failures are worth retrying with the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }

    pub fn upstream(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}
