//! HTTP handlers

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{ApiError, SharedState, StoreRequest, StoreResponse};
use crate::controller::PackagePhase;
use crate::manifest::ApprovalRecord;
use crate::notifications::Notification;
use crate::types::{AppListing, DownloadArtifact, DownloadProgress, PackageId, PackageState, Updates};

fn parse_package_id(raw: &str) -> Result<PackageId, ApiError> {
    raw.parse()
        .map_err(|e: crate::types::ParsePackageIdError| ApiError::BadRequest(e.to_string()))
}

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

/// POST /api/request
pub async fn api_request(
    State(store): State<SharedState>,
    Json(request): Json<StoreRequest>,
) -> Result<Json<StoreResponse>, ApiError> {
    Ok(Json(store.handle(request).await?))
}

/// GET /api/listings
pub async fn api_listings(
    State(store): State<SharedState>,
) -> Result<Json<BTreeMap<PackageId, AppListing>>, ApiError> {
    Ok(Json(store.list_listings().await?))
}

/// GET /api/listings/:package_id
pub async fn api_listing(
    State(store): State<SharedState>,
    Path(package_id): Path<String>,
) -> Result<Json<AppListing>, ApiError> {
    let package_id = parse_package_id(&package_id)?;
    Ok(Json(store.get_listing(&package_id).await?))
}

/// GET /api/installed
pub async fn api_installed(State(store): State<SharedState>) -> Json<Vec<PackageState>> {
    Json(store.installed_packages())
}

/// GET /api/installed/:package_id
pub async fn api_installed_package(
    State(store): State<SharedState>,
    Path(package_id): Path<String>,
) -> Result<Json<Option<PackageState>>, ApiError> {
    let package_id = parse_package_id(&package_id)?;
    Ok(Json(store.get_installed(&package_id)))
}

/// GET /api/phase/:package_id
pub async fn api_phase(
    State(store): State<SharedState>,
    Path(package_id): Path<String>,
) -> Result<Json<PackagePhase>, ApiError> {
    let package_id = parse_package_id(&package_id)?;
    Ok(Json(store.package_phase(&package_id).await))
}

/// GET /api/downloads
pub async fn api_download_dirs(
    State(store): State<SharedState>,
) -> Result<Json<Vec<DownloadArtifact>>, ApiError> {
    Ok(Json(store.list_downloads(None)?))
}

/// GET /api/downloads/:package_id
pub async fn api_download_files(
    State(store): State<SharedState>,
    Path(package_id): Path<String>,
) -> Result<Json<Vec<DownloadArtifact>>, ApiError> {
    let package_id = parse_package_id(&package_id)?;
    Ok(Json(store.list_downloads(Some(&package_id))?))
}

/// GET /api/downloads/:package_id/:hash.zip
///
/// Peers fetch artifacts here. Only packages we mirror are served.
pub async fn api_serve_artifact(
    State(store): State<SharedState>,
    Path((package_id, file)): Path<(String, String)>,
) -> Response {
    let Ok(package_id) = package_id.parse::<PackageId>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(version_hash) = file.strip_suffix(".zip") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !store.is_mirroring(&package_id) {
        debug!(package = %package_id, "Refusing artifact request, not mirroring");
        return (StatusCode::FORBIDDEN, "not mirroring").into_response();
    }
    let Some(path) = store.artifact_path(&package_id, version_hash) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/zip")], bytes).into_response(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read artifact");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /api/active-downloads
pub async fn api_active_downloads(
    State(store): State<SharedState>,
) -> Json<BTreeMap<String, DownloadProgress>> {
    Json(store.get_active_downloads())
}

#[derive(Serialize)]
pub struct SideloadResponse {
    pub version_hash: String,
    pub artifact: DownloadArtifact,
}

/// POST /api/packages/:package_id/sideload - body is the package zip
pub async fn api_sideload(
    State(store): State<SharedState>,
    Path(package_id): Path<String>,
    body: Bytes,
) -> Result<Json<SideloadResponse>, ApiError> {
    let package_id = parse_package_id(&package_id)?;
    if body.is_empty() {
        return Err(ApiError::BadRequest("empty package".to_string()));
    }
    let (version_hash, artifact) = store.sideload(&package_id, &body)?;
    Ok(Json(SideloadResponse {
        version_hash,
        artifact,
    }))
}

/// GET /api/updates
pub async fn api_updates(State(store): State<SharedState>) -> Json<Updates> {
    Json(store.get_updates())
}

/// GET /api/approvals
pub async fn api_approvals(State(store): State<SharedState>) -> Json<Vec<ApprovalRecord>> {
    Json(store.approvals())
}

/// GET /api/notifications
pub async fn api_notifications(State(store): State<SharedState>) -> Json<Vec<Notification>> {
    Json(store.list_notifications())
}

/// GET /api/notifications/stream
pub async fn api_notification_stream(
    State(store): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    event_stream(store.subscribe_notifications())
}

/// GET /api/downloads/stream
pub async fn api_download_stream(
    State(store): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    event_stream(store.subscribe_downloads())
}

/// Forward a broadcast channel as server-sent events
fn event_stream<T>(rx: broadcast::Receiver<T>) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    T: Serialize + Clone + Send + 'static,
{
    let events = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = Event::default()
                        .json_data(&event)
                        .unwrap_or_else(|_| Event::default().comment("unserializable event"));
                    return Some((Ok::<_, Infallible>(sse), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
