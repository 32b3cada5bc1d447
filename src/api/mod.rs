//! HTTP surface
//!
//! `POST /api/request` takes any [`StoreRequest`]. The GET routes are
//! read-only conveniences over the same operations, plus server-sent event
//! streams for notifications and download progress and the artifact route
//! peers download from when we mirror a package.

pub mod request;
pub mod routes;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;

use crate::controller::AppStore;
use crate::error::{DownloadErrorKind, StoreError};
use crate::notifications::NotificationError;

pub use request::{StoreRequest, StoreResponse};

pub type SharedState = Arc<AppStore>;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/request", post(routes::api_request))
        // Listings
        .route("/api/listings", get(routes::api_listings))
        .route("/api/listings/:package_id", get(routes::api_listing))
        // Installed packages
        .route("/api/installed", get(routes::api_installed))
        .route("/api/installed/:package_id", get(routes::api_installed_package))
        .route("/api/phase/:package_id", get(routes::api_phase))
        // Downloads
        .route("/api/downloads", get(routes::api_download_dirs))
        .route("/api/downloads/stream", get(routes::api_download_stream))
        .route("/api/downloads/:package_id", get(routes::api_download_files))
        .route("/api/downloads/:package_id/:file", get(routes::api_serve_artifact))
        .route("/api/active-downloads", get(routes::api_active_downloads))
        .route("/api/packages/:package_id/sideload", post(routes::api_sideload))
        // Updates
        .route("/api/updates", get(routes::api_updates))
        .route("/api/approvals", get(routes::api_approvals))
        // Notifications
        .route("/api/notifications", get(routes::api_notifications))
        .route("/api/notifications/stream", get(routes::api_notification_stream))
        // Health check
        .route("/health", get(routes::health))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<DownloadErrorKind> for ApiError {
    fn from(kind: DownloadErrorKind) -> Self {
        ApiError::Store(StoreError::Download(kind))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Store(e) => match e {
                StoreError::NotFound(_) | StoreError::NotInstalled(_) => StatusCode::NOT_FOUND,
                StoreError::Download(kind) => match kind {
                    DownloadErrorKind::NoPackage
                    | DownloadErrorKind::BlobNotFound
                    | DownloadErrorKind::FileNotFound => StatusCode::NOT_FOUND,
                    DownloadErrorKind::NotMirroring => StatusCode::FORBIDDEN,
                    DownloadErrorKind::InvalidManifest => StatusCode::UNPROCESSABLE_ENTITY,
                    DownloadErrorKind::Offline => StatusCode::SERVICE_UNAVAILABLE,
                    DownloadErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                    DownloadErrorKind::HashMismatch { .. } | DownloadErrorKind::HttpClientError => {
                        StatusCode::BAD_GATEWAY
                    }
                    DownloadErrorKind::WorkerSpawnFailed | DownloadErrorKind::VfsError => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                },
                StoreError::DuplicateDownload(_) | StoreError::Busy(_) => StatusCode::CONFLICT,
                StoreError::NotApproved { .. } => StatusCode::FORBIDDEN,
                StoreError::UnknownVersion { .. }
                | StoreError::InvalidHash(_)
                | StoreError::ConfirmationRequired => StatusCode::BAD_REQUEST,
                StoreError::Registry(_) => StatusCode::BAD_GATEWAY,
                StoreError::InstallFailed { .. } | StoreError::State(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::Notification(NotificationError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Notification(NotificationError::Persistent(_)) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Store(e) => match e {
                StoreError::NotFound(_) => "not_found",
                StoreError::Download(_) => "download_error",
                StoreError::DuplicateDownload(_) => "duplicate_download",
                StoreError::NotApproved { .. } => "not_approved",
                StoreError::NotInstalled(_) => "not_installed",
                StoreError::UnknownVersion { .. } => "unknown_version",
                StoreError::Busy(_) => "busy",
                StoreError::InstallFailed { .. } => "install_failed",
                StoreError::InvalidHash(_) => "invalid_hash",
                StoreError::ConfirmationRequired => "confirmation_required",
                StoreError::Registry(_) => "registry_error",
                StoreError::State(_) => "state_error",
            },
            ApiError::Notification(NotificationError::NotFound(_)) => "notification_not_found",
            ApiError::Notification(NotificationError::Persistent(_)) => "notification_persistent",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
