//! Install/update controller
//!
//! [`AppStore`] owns every table (installed packages, update bookkeeping,
//! auto-update subscriptions, approvals) and drives a package through
//!
//! ```text
//! NotInstalled → Downloading → AwaitingApproval → Installing → Installed → Uninstalling → NotInstalled
//! ```
//!
//! Operations on one package are serialized by an in-flight guard; a
//! conflicting concurrent operation gets [`StoreError::Busy`]. Table locks are
//! only held for short synchronous sections, never across I/O.

pub mod scheduler;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::digest::is_content_hash;
use crate::download::{
    ArtifactStore, DownloadEvent, DownloadManager, HttpArtifactTransport, TransferError,
};
use crate::download::transport::ArtifactTransport;
use crate::error::{DownloadErrorKind, Result, StoreError};
use crate::installer::{FsInstaller, InstallError, Installer};
use crate::manifest::{ApprovalRecord, CarryOver, ManifestGate};
use crate::mirror::{HttpMirrorProber, MirrorProber, MirrorSelection, MirrorSelector, NodeDirectory};
use crate::notifications::{
    BusEvent, Notification, NotificationAction, NotificationBus, NotificationError,
    NotificationKind,
};
use crate::registry::{ChainSource, HttpChainSource, RegistryClient, RegistryError};
use crate::state::{StateStore, StoreState};
use crate::types::{
    AppListing, CapabilityManifest, DownloadArtifact, DownloadKey, DownloadProgress, PackageId,
    PackageState, Updates,
};

/// Update sub-state of an installed package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateStatus {
    UpToDate,
    UpdateAvailable { version: String, version_hash: String },
    UpdateFailed { version_hash: String },
}

/// Where a package is in its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PackagePhase {
    NotInstalled,
    Downloading { version_hash: String },
    AwaitingApproval { version_hash: String },
    Installing { version_hash: String },
    Installed { version_hash: String, update: UpdateStatus },
    Uninstalling,
}

/// Result of one auto-update attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AutoUpdateOutcome {
    UpToDate,
    Updated { version_hash: String },
    AwaitingApproval { version_hash: String },
    /// Another operation on the package is running; nothing was done
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UninstallOutcome {
    pub package_id: PackageId,
    /// Capability grants are read at process start; the host must reload
    pub reload_required: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetSummary {
    /// Recorded and still reported by the host
    pub kept: Vec<PackageId>,
    /// Reported by the host but unknown to us
    pub adopted: Vec<PackageId>,
    /// Recorded but no longer on the host
    pub dropped: Vec<PackageId>,
    pub listings: usize,
}

/// Trait seams the store is built from
pub struct StoreComponents {
    pub chain: Arc<dyn ChainSource>,
    pub prober: Arc<dyn MirrorProber>,
    pub transport: Arc<dyn ArtifactTransport>,
    pub installer: Arc<dyn Installer>,
}

impl StoreComponents {
    /// HTTP-backed components for a real node
    pub fn http(config: &Config) -> Self {
        let directory = NodeDirectory::from_config(&config.mirrors);
        Self {
            chain: Arc::new(HttpChainSource::new(
                config.registry.indexer_url.clone(),
                config.registry.metadata_timeout(),
            )),
            prober: Arc::new(HttpMirrorProber::new(
                directory.clone(),
                config.mirrors.probe_timeout(),
            )),
            transport: Arc::new(HttpArtifactTransport::new(directory)),
            installer: Arc::new(FsInstaller::new(&config.node.data_dir)),
        }
    }
}

#[derive(Default)]
struct Tables {
    packages: BTreeMap<PackageId, PackageState>,
    updates: Updates,
    auto_update: BTreeSet<PackageId>,
}

/// Removes the package from the in-flight set on drop
struct PackageGuard<'a> {
    in_flight: &'a DashMap<PackageId, &'static str>,
    package_id: PackageId,
}

impl Drop for PackageGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.package_id);
    }
}

pub struct AppStore {
    node_id: String,
    registry: RegistryClient,
    mirrors: MirrorSelector,
    downloads: Arc<DownloadManager>,
    gate: ManifestGate,
    installer: Arc<dyn Installer>,
    notifications: Arc<NotificationBus>,
    tables: RwLock<Tables>,
    /// Transient phases; installed/not-installed come from `tables`
    phases: Arc<DashMap<PackageId, PackagePhase>>,
    in_flight: DashMap<PackageId, &'static str>,
    state_store: StateStore,
    persist_lock: Mutex<()>,
    max_attempts: usize,
    auto_update_on_install: bool,
}

fn registry_error(e: RegistryError) -> StoreError {
    match e {
        RegistryError::NotFound(package_id) => StoreError::NotFound(package_id),
        other => StoreError::Registry(other.to_string()),
    }
}

fn install_error(e: InstallError) -> StoreError {
    let kind = match &e {
        InstallError::Worker(_) => DownloadErrorKind::WorkerSpawnFailed,
        InstallError::NotInstalled(_) => DownloadErrorKind::NoPackage,
        InstallError::Archive(_) | InstallError::Io { .. } => DownloadErrorKind::VfsError,
    };
    StoreError::InstallFailed {
        kind,
        message: e.to_string(),
    }
}

/// Version hashes name files; refuse anything that is not a hex digest
fn check_hash(version_hash: &str) -> Result<()> {
    if is_content_hash(version_hash) {
        Ok(())
    } else {
        Err(StoreError::InvalidHash(version_hash.to_string()))
    }
}

impl AppStore {
    /// Build the store, loading persisted state from the data directory
    pub fn new(config: &Config, components: StoreComponents) -> Result<Self> {
        let store = ArtifactStore::new(&config.node.data_dir);
        let state_store = StateStore::new(config.state_path());
        let saved = state_store
            .load()
            .map_err(|e| StoreError::State(e.to_string()))?;

        let gate = ManifestGate::new(store.clone(), config.updates.approval_policy);
        gate.restore(saved.approvals);

        info!(
            node = %config.node.id,
            data_dir = %config.node.data_dir.display(),
            installed = saved.packages.len(),
            policy = ?config.updates.approval_policy,
            "App store initialized"
        );

        Ok(Self {
            node_id: config.node.id.clone(),
            registry: RegistryClient::new(components.chain, config.registry.cache_ttl()),
            mirrors: MirrorSelector::new(components.prober, config.mirrors.probe_timeout()),
            downloads: Arc::new(DownloadManager::new(
                store,
                components.transport,
                config.downloads.chunk_timeout(),
            )),
            gate,
            installer: components.installer,
            notifications: Arc::new(NotificationBus::new()),
            tables: RwLock::new(Tables {
                packages: saved.packages,
                updates: saved.updates,
                auto_update: saved.auto_update,
            }),
            phases: Arc::new(DashMap::new()),
            in_flight: DashMap::new(),
            state_store,
            persist_lock: Mutex::new(()),
            max_attempts: config.downloads.max_attempts.max(1),
            auto_update_on_install: config.updates.auto_update_on_install,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config, StoreComponents::http(config))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    pub async fn get_listing(&self, package_id: &PackageId) -> Result<AppListing> {
        let mut listing = self
            .registry
            .resolve(package_id)
            .await
            .map_err(registry_error)?;
        listing.auto_update = self.read_tables().auto_update.contains(package_id);
        Ok(listing)
    }

    pub async fn list_listings(&self) -> Result<BTreeMap<PackageId, AppListing>> {
        let mut listings = self.registry.list().await.map_err(registry_error)?;
        let tables = self.read_tables();
        for (package_id, listing) in listings.iter_mut() {
            listing.auto_update = tables.auto_update.contains(package_id);
        }
        Ok(listings)
    }

    pub fn get_installed(&self, package_id: &PackageId) -> Option<PackageState> {
        self.read_tables().packages.get(package_id).cloned()
    }

    pub fn installed_packages(&self) -> Vec<PackageState> {
        self.read_tables().packages.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Mirrors and downloads
    // ------------------------------------------------------------------

    /// Probe the package's mirrors and report which one would be used
    pub async fn check_mirrors(&self, package_id: &PackageId) -> Result<MirrorSelection> {
        let candidates = self.candidates(package_id).await?;
        Ok(self.mirrors.select(package_id, &candidates).await?)
    }

    /// Start a background download from `mirror`.
    ///
    /// Returns as soon as the download is registered; a second request for the
    /// same `package_id:version_hash` is rejected with `DuplicateDownload`.
    pub fn start_download(
        &self,
        package_id: &PackageId,
        version_hash: &str,
        mirror: &str,
    ) -> Result<DownloadKey> {
        check_hash(version_hash)?;
        let ticket = self
            .downloads
            .begin(package_id, version_hash, mirror)
            .map_err(|e| match e {
                TransferError::Duplicate(key) => StoreError::DuplicateDownload(key),
                TransferError::Failed(kind) => StoreError::Download(kind),
                TransferError::Abandoned(key) => StoreError::DuplicateDownload(key),
            })?;
        let key = ticket.key.clone();

        let downloads = Arc::clone(&self.downloads);
        let notifications = Arc::clone(&self.notifications);
        let phases = Arc::clone(&self.phases);
        let package_id = package_id.clone();
        let version_hash = version_hash.to_string();

        tokio::spawn(async move {
            let mirror = ticket.mirror.clone();
            match downloads.run(ticket).await {
                Ok(_) => {
                    phases.insert(
                        package_id.clone(),
                        PackagePhase::AwaitingApproval {
                            version_hash: version_hash.clone(),
                        },
                    );
                    notifications.emit(
                        Notification::new(
                            NotificationKind::Download,
                            format!("Downloaded {} ({})", package_id, version_hash),
                        )
                        .for_package(&package_id, Some(&version_hash))
                        .with_action(NotificationAction::ReviewManifest {
                            package_id: package_id.clone(),
                            version_hash: version_hash.clone(),
                        }),
                    );
                }
                Err(TransferError::Failed(kind)) => {
                    notifications.emit(
                        Notification::new(
                            NotificationKind::Failure(kind.clone()),
                            format!("Download of {} from {} failed: {}", package_id, mirror, kind),
                        )
                        .for_package(&package_id, Some(&version_hash)),
                    );
                }
                Err(e) => debug!(package = %package_id, error = %e, "Download ended without result"),
            }
        });

        Ok(key)
    }

    pub fn get_active_downloads(&self) -> BTreeMap<String, DownloadProgress> {
        self.downloads.active_downloads()
    }

    pub fn clear_active_downloads(&self) -> usize {
        self.downloads.clear_active()
    }

    pub fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.downloads.subscribe()
    }

    /// Directory listing when `package_id` is `None`, otherwise that package's artifacts
    pub fn list_downloads(&self, package_id: Option<&PackageId>) -> Result<Vec<DownloadArtifact>> {
        Ok(self.downloads.list_downloads(package_id)?)
    }

    pub fn remove_download(&self, package_id: &PackageId, version_hash: &str) -> Result<()> {
        check_hash(version_hash)?;
        self.downloads.remove_download(package_id, version_hash)?;
        self.phases.remove_if(package_id, |_, phase| {
            matches!(phase, PackagePhase::AwaitingApproval { version_hash: h } if h == version_hash)
        });
        Ok(())
    }

    pub fn set_mirroring(&self, package_id: &PackageId, enabled: bool) -> Result<()> {
        Ok(self.downloads.set_mirroring(package_id, enabled)?)
    }

    pub fn is_mirroring(&self, package_id: &PackageId) -> bool {
        self.downloads.store().is_mirroring(package_id)
    }

    /// Path of a stored artifact, if present
    pub fn artifact_path(&self, package_id: &PackageId, version_hash: &str) -> Option<std::path::PathBuf> {
        let store = self.downloads.store();
        store
            .has_artifact(package_id, version_hash)
            .then(|| store.artifact_path(package_id, version_hash))
    }

    /// Add a locally built package; its version hash is its content hash
    pub fn sideload(&self, package_id: &PackageId, bytes: &[u8]) -> Result<(String, DownloadArtifact)> {
        let (version_hash, artifact) = self.downloads.add_local(package_id, bytes)?;
        self.phases.insert(
            package_id.clone(),
            PackagePhase::AwaitingApproval {
                version_hash: version_hash.clone(),
            },
        );
        Ok((version_hash, artifact))
    }

    // ------------------------------------------------------------------
    // Manifest gate
    // ------------------------------------------------------------------

    pub fn get_manifest(&self, package_id: &PackageId, version_hash: &str) -> Result<CapabilityManifest> {
        check_hash(version_hash)?;
        Ok(self.gate.fetch_manifest(package_id, version_hash)?)
    }

    /// Operator approval of the manifest for exactly this version
    pub fn approve(&self, package_id: &PackageId, version_hash: &str) -> Result<ApprovalRecord> {
        check_hash(version_hash)?;
        let record = self.gate.record_approval(package_id, version_hash)?;
        self.persist()?;
        Ok(record)
    }

    pub fn approvals(&self) -> Vec<ApprovalRecord> {
        self.gate.approvals()
    }

    // ------------------------------------------------------------------
    // Install / uninstall
    // ------------------------------------------------------------------

    /// Install a downloaded, approved version
    pub async fn install(&self, package_id: &PackageId, version_hash: &str) -> Result<PackageState> {
        check_hash(version_hash)?;
        let _guard = self.lock_package(package_id, "install")?;
        match self.install_locked(package_id, version_hash).await {
            Ok(state) => {
                self.notifications.emit(
                    Notification::new(NotificationKind::Install, format!("Installed {}", package_id))
                        .for_package(package_id, Some(version_hash)),
                );
                Ok(state)
            }
            Err(e) => {
                let mut notification = Notification::new(
                    failure_kind(&e),
                    format!("Install of {} failed: {}", package_id, e),
                )
                .for_package(package_id, Some(version_hash));
                if matches!(e, StoreError::NotApproved { .. }) {
                    notification = notification.with_action(NotificationAction::ReviewManifest {
                        package_id: package_id.clone(),
                        version_hash: version_hash.to_string(),
                    });
                }
                self.notifications.emit(notification);
                Err(e)
            }
        }
    }

    /// Install without notifying; the caller reports the outcome
    async fn install_locked(&self, package_id: &PackageId, version_hash: &str) -> Result<PackageState> {
        let store = self.downloads.store();
        if !store.has_artifact(package_id, version_hash) {
            return Err(DownloadErrorKind::BlobNotFound.into());
        }
        let manifest = self.gate.fetch_manifest(package_id, version_hash)?;
        if !self.gate.is_approved(package_id, version_hash) {
            return Err(StoreError::NotApproved {
                package_id: package_id.clone(),
                version_hash: version_hash.to_string(),
            });
        }

        let verified = match self.registry.resolve(package_id).await {
            Ok(listing) => listing
                .properties()
                .map(|p| p.version_for_hash(version_hash).is_some())
                .unwrap_or(false),
            Err(e) => {
                debug!(package = %package_id, error = %e, "Listing unavailable, installing unverified");
                false
            }
        };

        self.phases.insert(
            package_id.clone(),
            PackagePhase::Installing {
                version_hash: version_hash.to_string(),
            },
        );

        let artifact = store.artifact_path(package_id, version_hash);
        if let Err(e) = self.installer.install(package_id, &artifact, &manifest).await {
            warn!(package = %package_id, hash = %version_hash, error = %e, "Install failed");
            self.phases.insert(
                package_id.clone(),
                PackagePhase::AwaitingApproval {
                    version_hash: version_hash.to_string(),
                },
            );
            return Err(install_error(e));
        }

        let state = PackageState {
            package_id: package_id.clone(),
            installed_version_hash: version_hash.to_string(),
            verified,
            capabilities_approved: true,
            manifest_hash: Some(ManifestGate::manifest_hash(&manifest)),
            pending_update_hash: None,
        };
        {
            let mut tables = self.write_tables();
            tables.packages.insert(package_id.clone(), state.clone());
            tables.updates.clear_version(package_id, version_hash);
            if self.auto_update_on_install {
                tables.auto_update.insert(package_id.clone());
            }
        }
        self.phases.remove(package_id);
        // The host already runs this version; a stale state file is corrected by reset_store
        if let Err(e) = self.persist() {
            error!(package = %package_id, error = %e, "Installed but could not save store state");
        }

        let resolved = self.notifications.resolve(package_id);
        info!(package = %package_id, hash = %version_hash, verified, resolved, "Package installed");
        Ok(state)
    }

    pub async fn uninstall(&self, package_id: &PackageId) -> Result<UninstallOutcome> {
        let _guard = self.lock_package(package_id, "uninstall")?;
        if self.get_installed(package_id).is_none() {
            return Err(StoreError::NotInstalled(package_id.clone()));
        }

        self.phases.insert(package_id.clone(), PackagePhase::Uninstalling);
        match self.installer.uninstall(package_id).await {
            Ok(()) => {}
            Err(InstallError::NotInstalled(_)) => {
                warn!(package = %package_id, "Host no longer had the package, clearing local state");
            }
            Err(e) => {
                self.phases.remove(package_id);
                let e = install_error(e);
                self.notifications.emit(
                    Notification::new(
                        NotificationKind::Error,
                        format!("Uninstall of {} failed: {}", package_id, e),
                    )
                    .for_package(package_id, None),
                );
                return Err(e);
            }
        }

        {
            let mut tables = self.write_tables();
            tables.packages.remove(package_id);
            tables.auto_update.remove(package_id);
            tables.updates.clear_package(package_id);
        }
        let revoked = self.gate.revoke(package_id);
        self.phases.remove(package_id);
        self.persist()?;
        self.notifications.resolve(package_id);

        info!(package = %package_id, revoked, "Package uninstalled");
        self.notifications.emit(
            Notification::new(
                NotificationKind::Info,
                format!("Uninstalled {}; reload to drop its capabilities", package_id),
            )
            .for_package(package_id, None)
            .with_action(NotificationAction::ReloadHost),
        );

        Ok(UninstallOutcome {
            package_id: package_id.clone(),
            reload_required: true,
        })
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Subscribe or unsubscribe a package from auto-update
    pub async fn set_auto_update(
        &self,
        package_id: &PackageId,
        version_hash: &str,
        enabled: bool,
    ) -> Result<()> {
        check_hash(version_hash)?;
        let installed_here = self
            .get_installed(package_id)
            .is_some_and(|s| s.installed_version_hash == version_hash);
        if !installed_here {
            let listing = self.get_listing(package_id).await?;
            let listed = listing
                .properties()
                .is_some_and(|p| p.version_for_hash(version_hash).is_some());
            if !listed {
                return Err(StoreError::UnknownVersion {
                    package_id: package_id.clone(),
                    version_hash: version_hash.to_string(),
                });
            }
        }

        {
            let mut tables = self.write_tables();
            if enabled {
                tables.auto_update.insert(package_id.clone());
            } else {
                tables.auto_update.remove(package_id);
            }
        }
        self.registry.invalidate(package_id);
        self.persist()?;
        info!(package = %package_id, enabled, "Auto-update toggled");
        Ok(())
    }

    pub fn auto_update_subscriptions(&self) -> Vec<PackageId> {
        self.read_tables().auto_update.iter().cloned().collect()
    }

    pub fn get_updates(&self) -> Updates {
        self.read_tables().updates.clone()
    }

    /// Bring an installed package to its latest listed version without asking,
    /// when the approval policy allows it.
    ///
    /// Idempotent: a package already at latest, or busy with another operation,
    /// is left alone.
    pub async fn auto_update(&self, package_id: &PackageId) -> Result<AutoUpdateOutcome> {
        let _guard = match self.lock_package(package_id, "auto_update") {
            Ok(guard) => guard,
            Err(StoreError::Busy(_)) => return Ok(AutoUpdateOutcome::Busy),
            Err(e) => return Err(e),
        };
        let installed = self
            .get_installed(package_id)
            .ok_or_else(|| StoreError::NotInstalled(package_id.clone()))?;

        self.registry.invalidate(package_id);
        let listing = match self.registry.resolve(package_id).await {
            Ok(listing) => listing,
            Err(e) => {
                let e = registry_error(e);
                self.notifications.emit(
                    Notification::new(
                        NotificationKind::Failure(DownloadErrorKind::NoPackage),
                        format!("Auto-update of {} failed: {}", package_id, e),
                    )
                    .for_package(package_id, None)
                    .with_action(NotificationAction::RetryUpdate {
                        package_id: package_id.clone(),
                    })
                    .persistent(),
                );
                return Err(e);
            }
        };
        let Some(properties) = listing.properties() else {
            return Err(self.fail_auto_update(package_id, None, DownloadErrorKind::NoPackage));
        };
        let Some((version, version_hash)) = properties.latest().cloned() else {
            return Ok(AutoUpdateOutcome::UpToDate);
        };
        if !is_content_hash(&version_hash) {
            warn!(package = %package_id, hash = %version_hash, "Listing names a version hash that is not a digest");
            return Err(self.fail_auto_update(package_id, None, DownloadErrorKind::NoPackage));
        }
        if version_hash == installed.installed_version_hash {
            debug!(package = %package_id, version = %version, "Already at latest");
            return Ok(AutoUpdateOutcome::UpToDate);
        }

        info!(
            package = %package_id,
            from = %installed.installed_version_hash,
            to = %version_hash,
            version = %version,
            "Auto-updating"
        );

        if !self.downloads.store().has_artifact(package_id, &version_hash) {
            let candidates = properties.candidate_mirrors();
            match self.download_with_fallback(package_id, &version_hash, &candidates).await {
                Ok(()) => {}
                Err(TransferError::Failed(kind)) => {
                    return Err(self.fail_auto_update(package_id, Some(&version_hash), kind));
                }
                Err(e) => {
                    debug!(package = %package_id, error = %e, "Auto-update download interrupted");
                    return Ok(AutoUpdateOutcome::Busy);
                }
            }
        }

        match self.gate.carry_over(package_id, &version_hash, &installed) {
            Ok(CarryOver::Approved(_)) => {}
            Ok(CarryOver::NeedsReview { manifest_hash }) => {
                self.write_tables()
                    .updates
                    .set_pending_manifest(package_id, &version_hash, manifest_hash);
                self.phases.insert(
                    package_id.clone(),
                    PackagePhase::AwaitingApproval {
                        version_hash: version_hash.clone(),
                    },
                );
                self.persist()?;
                self.notifications.emit(
                    Notification::new(
                        NotificationKind::Update,
                        format!(
                            "{} {} requests different capabilities and needs approval",
                            package_id, version
                        ),
                    )
                    .for_package(package_id, Some(&version_hash))
                    .with_action(NotificationAction::ReviewManifest {
                        package_id: package_id.clone(),
                        version_hash: version_hash.clone(),
                    })
                    .persistent(),
                );
                return Ok(AutoUpdateOutcome::AwaitingApproval { version_hash });
            }
            Err(kind) => {
                self.write_tables()
                    .updates
                    .record_error(package_id, &version_hash, "manifest", kind.clone());
                return Err(self.fail_auto_update(package_id, Some(&version_hash), kind));
            }
        }

        match self.install_locked(package_id, &version_hash).await {
            Ok(_) => {
                self.notifications.emit(
                    Notification::new(
                        NotificationKind::Update,
                        format!("Updated {} to {}", package_id, version),
                    )
                    .for_package(package_id, Some(&version_hash)),
                );
                Ok(AutoUpdateOutcome::Updated { version_hash })
            }
            Err(e) => {
                let kind = match e {
                    StoreError::Download(kind) | StoreError::InstallFailed { kind, .. } => kind,
                    _ => DownloadErrorKind::VfsError,
                };
                self.write_tables()
                    .updates
                    .record_error(package_id, &version_hash, "installer", kind.clone());
                Err(self.fail_auto_update(package_id, Some(&version_hash), kind))
            }
        }
    }

    /// Operator-facing retry of a failed or pending update
    pub async fn retry_update(&self, package_id: &PackageId) -> Result<AutoUpdateOutcome> {
        self.auto_update(package_id).await
    }

    /// Try each candidate mirror in turn, never reusing one that failed.
    ///
    /// Only mirror-specific failures move on to the next mirror. Once every
    /// candidate has failed, the last mirror's error is returned.
    async fn download_with_fallback(
        &self,
        package_id: &PackageId,
        version_hash: &str,
        candidates: &[String],
    ) -> std::result::Result<(), TransferError> {
        let mut excluded: Vec<String> = Vec::new();
        let mut last = DownloadErrorKind::Offline;

        for attempt in 1..=self.max_attempts {
            let mirror = match self
                .mirrors
                .select_excluding(package_id, candidates, &excluded)
                .await
            {
                Ok(selection) => selection.mirror,
                Err(_) if !excluded.is_empty() => return Err(last.into()),
                Err(kind) => {
                    self.write_tables()
                        .updates
                        .record_error(package_id, version_hash, "mirrors", kind.clone());
                    return Err(kind.into());
                }
            };

            match self.downloads.download(package_id, version_hash, &mirror).await {
                Ok(_) => return Ok(()),
                Err(TransferError::Failed(kind)) => {
                    warn!(
                        package = %package_id,
                        mirror = %mirror,
                        attempt,
                        error = %kind,
                        "Download attempt failed"
                    );
                    self.write_tables()
                        .updates
                        .record_error(package_id, version_hash, &mirror, kind.clone());
                    if !kind.is_mirror_specific() {
                        return Err(kind.into());
                    }
                    excluded.push(mirror);
                    last = kind;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last.into())
    }

    /// Record a terminal auto-update failure and raise its persistent notification
    fn fail_auto_update(
        &self,
        package_id: &PackageId,
        version_hash: Option<&str>,
        kind: DownloadErrorKind,
    ) -> StoreError {
        {
            let mut tables = self.write_tables();
            if let Some(hash) = version_hash {
                if let Some(state) = tables.packages.get_mut(package_id) {
                    state.pending_update_hash = Some(hash.to_string());
                }
            }
        }
        if let Err(e) = self.persist() {
            error!(package = %package_id, error = %e, "Failed to persist update failure");
        }

        warn!(package = %package_id, hash = ?version_hash, error = %kind, "Auto-update failed");
        self.notifications.emit(
            Notification::new(
                NotificationKind::Failure(kind.clone()),
                format!("Auto-update of {} failed: {}", package_id, kind),
            )
            .for_package(package_id, version_hash)
            .with_action(NotificationAction::RetryUpdate {
                package_id: package_id.clone(),
            })
            .persistent(),
        );
        StoreError::Download(kind)
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    pub async fn package_phase(&self, package_id: &PackageId) -> PackagePhase {
        if let Some(phase) = self.phases.get(package_id).map(|p| p.value().clone()) {
            if matches!(
                phase,
                PackagePhase::Installing { .. } | PackagePhase::Uninstalling
            ) {
                return phase;
            }
        }
        if let Some(version_hash) = self.downloads.active().downloading(package_id) {
            return PackagePhase::Downloading { version_hash };
        }
        if let Some(phase) = self.phases.get(package_id).map(|p| p.value().clone()) {
            return phase;
        }

        let Some(installed) = self.get_installed(package_id) else {
            return PackagePhase::NotInstalled;
        };
        let update = match &installed.pending_update_hash {
            Some(hash) => UpdateStatus::UpdateFailed {
                version_hash: hash.clone(),
            },
            None => self.update_status(&installed).await,
        };
        PackagePhase::Installed {
            version_hash: installed.installed_version_hash,
            update,
        }
    }

    async fn update_status(&self, installed: &PackageState) -> UpdateStatus {
        let latest = match self.registry.resolve(&installed.package_id).await {
            Ok(listing) => listing.properties().and_then(|p| p.latest().cloned()),
            Err(_) => None,
        };
        match latest {
            Some((version, version_hash)) if version_hash != installed.installed_version_hash => {
                UpdateStatus::UpdateAvailable {
                    version,
                    version_hash,
                }
            }
            _ => UpdateStatus::UpToDate,
        }
    }

    // ------------------------------------------------------------------
    // Reset
    // ------------------------------------------------------------------

    /// Drop cached listings, reconcile installs with the host and re-index.
    ///
    /// Packages the host still reports installed are never dropped.
    pub async fn reset_store(&self, confirm: bool) -> Result<ResetSummary> {
        if !confirm {
            return Err(StoreError::ConfirmationRequired);
        }
        warn!("Resetting app store");
        self.registry.invalidate_all();

        let host = self.installer.installed().await.map_err(install_error)?;
        let mut summary = ResetSummary::default();
        {
            let mut tables = self.write_tables();
            let recorded: BTreeSet<PackageId> = tables.packages.keys().cloned().collect();

            for package in &host {
                match tables.packages.get_mut(&package.package_id) {
                    Some(state) => {
                        if state.installed_version_hash != package.version_hash {
                            warn!(
                                package = %package.package_id,
                                recorded = %state.installed_version_hash,
                                host = %package.version_hash,
                                "Host has a different version, taking the host's"
                            );
                            state.installed_version_hash = package.version_hash.clone();
                            state.capabilities_approved = false;
                            state.manifest_hash = None;
                        }
                        summary.kept.push(package.package_id.clone());
                    }
                    None => {
                        tables.packages.insert(
                            package.package_id.clone(),
                            PackageState {
                                package_id: package.package_id.clone(),
                                installed_version_hash: package.version_hash.clone(),
                                verified: true,
                                capabilities_approved: false,
                                manifest_hash: None,
                                pending_update_hash: None,
                            },
                        );
                        summary.adopted.push(package.package_id.clone());
                    }
                }
            }

            let on_host: BTreeSet<&PackageId> = host.iter().map(|p| &p.package_id).collect();
            for package_id in recorded {
                if !on_host.contains(&package_id) {
                    tables.packages.remove(&package_id);
                    tables.auto_update.remove(&package_id);
                    tables.updates.clear_package(&package_id);
                    summary.dropped.push(package_id);
                }
            }
        }
        for package_id in &summary.dropped {
            self.gate.revoke(package_id);
        }
        self.phases.retain(|package_id, _| self.in_flight.contains_key(package_id));
        self.persist()?;

        summary.listings = self.list_listings().await?.len();
        info!(
            kept = summary.kept.len(),
            adopted = summary.adopted.len(),
            dropped = summary.dropped.len(),
            listings = summary.listings,
            "App store re-indexed"
        );
        self.notifications.emit(Notification::new(
            NotificationKind::Info,
            format!("Store re-indexed: {} listings", summary.listings),
        ));
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    pub fn notifications(&self) -> &NotificationBus {
        &self.notifications
    }

    pub fn list_notifications(&self) -> Vec<Notification> {
        self.notifications.list()
    }

    pub fn dismiss_notification(&self, id: &str) -> std::result::Result<(), NotificationError> {
        self.notifications.dismiss(id)
    }

    pub fn subscribe_notifications(&self) -> broadcast::Receiver<BusEvent> {
        self.notifications.subscribe()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn candidates(&self, package_id: &PackageId) -> Result<Vec<String>> {
        let listing = self.get_listing(package_id).await?;
        let properties = listing
            .properties()
            .ok_or(StoreError::Download(DownloadErrorKind::NoPackage))?;
        Ok(properties.candidate_mirrors())
    }

    fn lock_package(&self, package_id: &PackageId, operation: &'static str) -> Result<PackageGuard<'_>> {
        match self.in_flight.entry(package_id.clone()) {
            Entry::Occupied(running) => {
                debug!(package = %package_id, running = *running.get(), operation, "Package busy");
                Err(StoreError::Busy(package_id.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(operation);
                Ok(PackageGuard {
                    in_flight: &self.in_flight,
                    package_id: package_id.clone(),
                })
            }
        }
    }

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self) -> Result<()> {
        let _serial = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = {
            let tables = self.read_tables();
            StoreState {
                packages: tables.packages.clone(),
                updates: tables.updates.clone(),
                auto_update: tables.auto_update.clone(),
                approvals: self.gate.approvals(),
            }
        };
        self.state_store.save(&snapshot).map_err(|e| {
            error!(error = %e, "Failed to save store state");
            StoreError::State(e.to_string())
        })
    }
}

/// Notification kind for a failed operator install
fn failure_kind(e: &StoreError) -> NotificationKind {
    match e {
        StoreError::Download(kind) => NotificationKind::Failure(kind.clone()),
        _ => NotificationKind::Error,
    }
}
