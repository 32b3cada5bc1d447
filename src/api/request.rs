//! Typed request/response union
//!
//! Every store operation is one [`StoreRequest`] variant with a fixed payload.
//! On the wire a request is a JSON object tagged by `op`:
//!
//! ```json
//! {"op": "install", "package_id": "foo:alice.os", "version_hash": "ab12.."}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ApiError;
use crate::controller::{AppStore, AutoUpdateOutcome, PackagePhase, ResetSummary, UninstallOutcome};
use crate::manifest::ApprovalRecord;
use crate::mirror::MirrorSelection;
use crate::notifications::Notification;
use crate::types::{
    AppListing, CapabilityManifest, DownloadArtifact, DownloadProgress, PackageId, PackageState,
    Updates,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreRequest {
    GetListing {
        package_id: PackageId,
    },
    ListListings,
    GetInstalled {
        package_id: PackageId,
    },
    /// Omit `package_id` to list package directories
    ListDownloads {
        #[serde(default)]
        package_id: Option<PackageId>,
    },
    CheckMirrors {
        package_id: PackageId,
    },
    StartDownload {
        package_id: PackageId,
        version_hash: String,
        mirror: String,
    },
    GetActiveDownloads,
    ClearActiveDownloads,
    GetManifest {
        package_id: PackageId,
        version_hash: String,
    },
    ApproveManifest {
        package_id: PackageId,
        version_hash: String,
    },
    Install {
        package_id: PackageId,
        version_hash: String,
    },
    Uninstall {
        package_id: PackageId,
    },
    SetAutoUpdate {
        package_id: PackageId,
        version_hash: String,
        enabled: bool,
    },
    GetUpdates,
    ResetStore {
        #[serde(default)]
        confirm: bool,
    },
    ListNotifications,
    DismissNotification {
        id: String,
    },
    RetryUpdate {
        package_id: PackageId,
    },
    SetMirroring {
        package_id: PackageId,
        enabled: bool,
    },
    RemoveDownload {
        package_id: PackageId,
        version_hash: String,
    },
    GetPhase {
        package_id: PackageId,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StoreResponse {
    Listing(AppListing),
    Listings(BTreeMap<PackageId, AppListing>),
    Installed(Option<PackageState>),
    Downloads(Vec<DownloadArtifact>),
    Mirrors(MirrorSelection),
    DownloadStarted { key: String },
    ActiveDownloads(BTreeMap<String, DownloadProgress>),
    Cleared { count: usize },
    Manifest(CapabilityManifest),
    Approved(ApprovalRecord),
    PackageInstalled(PackageState),
    Uninstalled(UninstallOutcome),
    Updates(Updates),
    Reset(ResetSummary),
    Notifications(Vec<Notification>),
    UpdateAttempt(AutoUpdateOutcome),
    Phase(PackagePhase),
    Ack,
}

impl AppStore {
    /// Dispatch one request
    pub async fn handle(&self, request: StoreRequest) -> Result<StoreResponse, ApiError> {
        use StoreRequest as R;

        let response = match request {
            R::GetListing { package_id } => StoreResponse::Listing(self.get_listing(&package_id).await?),
            R::ListListings => StoreResponse::Listings(self.list_listings().await?),
            R::GetInstalled { package_id } => StoreResponse::Installed(self.get_installed(&package_id)),
            R::ListDownloads { package_id } => {
                StoreResponse::Downloads(self.list_downloads(package_id.as_ref())?)
            }
            R::CheckMirrors { package_id } => StoreResponse::Mirrors(self.check_mirrors(&package_id).await?),
            R::StartDownload {
                package_id,
                version_hash,
                mirror,
            } => {
                let key = self.start_download(&package_id, &version_hash, &mirror)?;
                StoreResponse::DownloadStarted { key: key.to_string() }
            }
            R::GetActiveDownloads => StoreResponse::ActiveDownloads(self.get_active_downloads()),
            R::ClearActiveDownloads => StoreResponse::Cleared {
                count: self.clear_active_downloads(),
            },
            R::GetManifest {
                package_id,
                version_hash,
            } => StoreResponse::Manifest(self.get_manifest(&package_id, &version_hash)?),
            R::ApproveManifest {
                package_id,
                version_hash,
            } => StoreResponse::Approved(self.approve(&package_id, &version_hash)?),
            R::Install {
                package_id,
                version_hash,
            } => StoreResponse::PackageInstalled(self.install(&package_id, &version_hash).await?),
            R::Uninstall { package_id } => StoreResponse::Uninstalled(self.uninstall(&package_id).await?),
            R::SetAutoUpdate {
                package_id,
                version_hash,
                enabled,
            } => {
                self.set_auto_update(&package_id, &version_hash, enabled).await?;
                StoreResponse::Ack
            }
            R::GetUpdates => StoreResponse::Updates(self.get_updates()),
            R::ResetStore { confirm } => StoreResponse::Reset(self.reset_store(confirm).await?),
            R::ListNotifications => StoreResponse::Notifications(self.list_notifications()),
            R::DismissNotification { id } => {
                self.dismiss_notification(&id)?;
                StoreResponse::Ack
            }
            R::RetryUpdate { package_id } => {
                StoreResponse::UpdateAttempt(self.retry_update(&package_id).await?)
            }
            R::SetMirroring {
                package_id,
                enabled,
            } => {
                self.set_mirroring(&package_id, enabled)?;
                StoreResponse::Ack
            }
            R::RemoveDownload {
                package_id,
                version_hash,
            } => {
                self.remove_download(&package_id, &version_hash)?;
                StoreResponse::Ack
            }
            R::GetPhase { package_id } => StoreResponse::Phase(self.package_phase(&package_id).await),
        };
        Ok(response)
    }
}
