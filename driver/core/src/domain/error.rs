// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Lifecycle Error Taxonomy
//!
//! Every fallible lifecycle operation returns [`CsiError`]. Backend failures
//! are folded in through `From<BackendError>`; the gRPC layer maps each
//! variant onto exactly one status code.

use thiserror::Error;

use crate::domain::backend::{BackendError, BackendVersion};
use crate::domain::quota::QuotaError;
use crate::domain::volume_handle::HandleError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// Malformed request, conflicting parameters or a handle that cannot be decoded.
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// Transient backend failure that exhausted its retry budget.
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("backend rejected credentials: {0}")]
    Unauthorized(String),

    /// Backend version or cluster topology cannot serve the request.
    #[error("{0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backend refused the request; message is surfaced verbatim.
    #[error("{0}")]
    Rejected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        CsiError::InvalidArgument(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        CsiError::Unsupported(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CsiError::Internal(msg.into())
    }

    /// Feature gate failure naming the release the feature needs.
    pub fn minimum_version(feature: &str, minimum: &BackendVersion, actual: &BackendVersion) -> Self {
        CsiError::Unsupported(format!(
            "{} is not supported by backend version {}: minimum version required is {}",
            feature, actual, minimum
        ))
    }

    /// Fail with [`CsiError::Unsupported`] unless `actual` is at least `minimum`.
    pub fn require_version(feature: &str, minimum: &BackendVersion, actual: &BackendVersion) -> Result<(), Self> {
        if actual.at_least(minimum) {
            Ok(())
        } else {
            Err(Self::minimum_version(feature, minimum, actual))
        }
    }

    /// Whether the caller (usually a CSI sidecar) may usefully retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CsiError::BackendUnavailable(_) | CsiError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CsiError::NotFound(_))
    }
}

impl From<BackendError> for CsiError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(msg) => CsiError::NotFound(msg),
            BackendError::AlreadyExists(msg) => CsiError::AlreadyExists(msg),
            BackendError::Unauthorized(msg) => CsiError::Unauthorized(msg),
            BackendError::Unavailable(msg) => CsiError::BackendUnavailable(msg),
            BackendError::Timeout(msg) => CsiError::Timeout(msg),
            BackendError::Configuration(msg) => CsiError::Configuration(msg),
            BackendError::Rejected { message, .. } => CsiError::Rejected(message),
            BackendError::FilesetBusy(msg) => CsiError::Rejected(msg),
            BackendError::JobFailed { job_id, message } => {
                CsiError::Rejected(format!("backend job {} failed: {}", job_id, message))
            }
            other @ (BackendError::Serialization(_) | BackendError::Unknown(_)) => {
                CsiError::Internal(other.to_string())
            }
        }
    }
}

impl From<HandleError> for CsiError {
    fn from(err: HandleError) -> Self {
        CsiError::InvalidArgument(err.to_string())
    }
}

impl From<QuotaError> for CsiError {
    fn from(err: QuotaError) -> Self {
        CsiError::InvalidArgument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_fold_into_taxonomy() {
        let err: CsiError = BackendError::Rejected {
            status: 400,
            message: "Invalid pool name 'gold'".to_string(),
        }
        .into();
        assert_eq!(err, CsiError::Rejected("Invalid pool name 'gold'".to_string()));

        let err: CsiError = BackendError::Unavailable("503".to_string()).into();
        assert!(err.is_retryable());

        let err: CsiError = BackendError::NotFound("fileset pvc-1".to_string()).into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_version_gate_message() {
        let minimum = BackendVersion::new(&[5, 0, 5, 2]);
        assert!(CsiError::require_version("snapshots", &minimum, &BackendVersion::new(&[5, 1, 0])).is_ok());
        match CsiError::require_version("snapshots", &minimum, &BackendVersion::new(&[5, 0, 4])) {
            Err(CsiError::Unsupported(msg)) => assert!(msg.contains("minimum version required is 5.0.5.2")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
