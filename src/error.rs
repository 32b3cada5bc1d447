//! Error taxonomy
//!
//! [`DownloadErrorKind`] is the only vocabulary used to classify download and
//! install failures. [`StoreError`] is what controller operations return.

use serde::{Deserialize, Serialize};

use crate::types::PackageId;

/// Classification of a download/install failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum DownloadErrorKind {
    #[error("package not found")]
    NoPackage,

    #[error("mirror is not mirroring this package")]
    NotMirroring,

    #[error("hash mismatch: desired {desired}, actual {actual}")]
    HashMismatch { desired: String, actual: String },

    #[error("file not found on mirror")]
    FileNotFound,

    #[error("failed to spawn transfer worker")]
    WorkerSpawnFailed,

    #[error("http client error")]
    HttpClientError,

    #[error("blob not found")]
    BlobNotFound,

    #[error("local storage error")]
    VfsError,

    #[error("timed out")]
    Timeout,

    #[error("invalid manifest")]
    InvalidManifest,

    #[error("no mirror online")]
    Offline,
}

impl DownloadErrorKind {
    /// Failures tied to a specific mirror, recoverable by picking another one
    pub fn is_mirror_specific(&self) -> bool {
        matches!(
            self,
            DownloadErrorKind::NotMirroring
                | DownloadErrorKind::HashMismatch { .. }
                | DownloadErrorKind::FileNotFound
                | DownloadErrorKind::HttpClientError
                | DownloadErrorKind::Timeout
        )
    }
}

/// Errors returned by [`crate::controller::AppStore`] operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("package {0} not found in registry")]
    NotFound(PackageId),

    #[error(transparent)]
    Download(#[from] DownloadErrorKind),

    #[error("download {0} is already in progress")]
    DuplicateDownload(String),

    #[error("capabilities for {package_id} at {version_hash} have not been approved")]
    NotApproved {
        package_id: PackageId,
        version_hash: String,
    },

    #[error("package {0} is not installed")]
    NotInstalled(PackageId),

    #[error("version {version_hash} is not listed for {package_id}")]
    UnknownVersion {
        package_id: PackageId,
        version_hash: String,
    },

    #[error("package {0} has another operation in flight")]
    Busy(PackageId),

    #[error("install failed: {message}")]
    InstallFailed {
        kind: DownloadErrorKind,
        message: String,
    },

    #[error("{0:?} is not a content hash")]
    InvalidHash(String),

    #[error("reset requires explicit confirmation")]
    ConfirmationRequired,

    #[error("registry error: {0}")]
    Registry(String),

    #[error("state error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_mismatch_display() {
        let err = DownloadErrorKind::HashMismatch {
            desired: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(err.to_string(), "hash mismatch: desired aa, actual bb");
        assert!(err.is_mirror_specific());
    }

    #[test]
    fn test_local_failures_are_not_mirror_specific() {
        assert!(DownloadErrorKind::Timeout.is_mirror_specific());
        assert!(DownloadErrorKind::NotMirroring.is_mirror_specific());
        assert!(!DownloadErrorKind::VfsError.is_mirror_specific());
        assert!(!DownloadErrorKind::WorkerSpawnFailed.is_mirror_specific());
        assert!(!DownloadErrorKind::Offline.is_mirror_specific());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&DownloadErrorKind::NotMirroring).unwrap();
        assert_eq!(json, "\"not_mirroring\"");
    }
}
