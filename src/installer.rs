//! Host installer
//!
//! The controller hands verified, approved artifacts to an [`Installer`].
//! [`FsInstaller`] unpacks them into `{data_dir}/packages/{package_id}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::digest::sha256_hex;
use crate::types::{CapabilityManifest, PackageId};

const PACKAGE_ARCHIVE: &str = "package.zip";
const PACKAGE_DRIVE: &str = "pkg";

/// What the host reports as installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub package_id: PackageId,
    pub version_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("package {0} is not installed")]
    NotInstalled(PackageId),

    #[error("bad package archive: {0}")]
    Archive(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("install worker failed: {0}")]
    Worker(String),
}

#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(
        &self,
        package_id: &PackageId,
        artifact_path: &Path,
        manifest: &CapabilityManifest,
    ) -> Result<(), InstallError>;

    async fn uninstall(&self, package_id: &PackageId) -> Result<(), InstallError>;

    async fn installed(&self) -> Result<Vec<InstalledPackage>, InstallError>;
}

pub struct FsInstaller {
    root: PathBuf,
}

impl FsInstaller {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("packages"),
        }
    }

    pub fn package_dir(&self, package_id: &PackageId) -> PathBuf {
        self.root.join(package_id.to_string())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> InstallError + '_ {
    move |source| InstallError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Replace `dir` with the archive's contents under `dir/pkg`
fn unpack(dir: &Path, bytes: &[u8]) -> Result<usize, InstallError> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| InstallError::Archive(e.to_string()))?;

    if dir.exists() {
        fs::remove_dir_all(dir).map_err(io_error(dir))?;
    }
    let drive = dir.join(PACKAGE_DRIVE);
    fs::create_dir_all(&drive).map_err(io_error(&drive))?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| InstallError::Archive(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(name = %entry.name(), "Skipping archive entry outside the package");
            continue;
        };
        let target = drive.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(io_error(&target))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        let mut out = fs::File::create(&target).map_err(io_error(&target))?;
        std::io::copy(&mut entry, &mut out).map_err(io_error(&target))?;
        written += 1;
    }

    let archive_copy = dir.join(PACKAGE_ARCHIVE);
    fs::write(&archive_copy, bytes).map_err(io_error(&archive_copy))?;
    Ok(written)
}

fn scan(root: &Path) -> Result<Vec<InstalledPackage>, InstallError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_error(root)(e)),
    };

    let mut installed = Vec::new();
    for entry in entries {
        let entry = entry.map_err(io_error(root))?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Ok(package_id) = name.parse::<PackageId>() else {
            debug!(dir = %name, "Ignoring non-package directory");
            continue;
        };
        let archive = entry.path().join(PACKAGE_ARCHIVE);
        match fs::read(&archive) {
            Ok(bytes) => installed.push(InstalledPackage {
                package_id,
                version_hash: sha256_hex(&bytes),
            }),
            Err(e) => warn!(package = %name, error = %e, "Installed package has no archive"),
        }
    }
    installed.sort_by(|a, b| a.package_id.cmp(&b.package_id));
    Ok(installed)
}

#[async_trait]
impl Installer for FsInstaller {
    async fn install(
        &self,
        package_id: &PackageId,
        artifact_path: &Path,
        manifest: &CapabilityManifest,
    ) -> Result<(), InstallError> {
        if !package_id.is_path_safe() {
            return Err(InstallError::Archive(format!(
                "package id {} cannot name a directory",
                package_id
            )));
        }
        let bytes = tokio::fs::read(artifact_path)
            .await
            .map_err(io_error(artifact_path))?;
        let dir = self.package_dir(package_id);

        let files = tokio::task::spawn_blocking(move || unpack(&dir, &bytes))
            .await
            .map_err(|e| InstallError::Worker(e.to_string()))??;

        info!(
            package = %package_id,
            hash = %manifest.version_hash,
            files,
            "Package installed"
        );
        Ok(())
    }

    async fn uninstall(&self, package_id: &PackageId) -> Result<(), InstallError> {
        let dir = self.package_dir(package_id);
        if !package_id.is_path_safe() || !dir.exists() {
            return Err(InstallError::NotInstalled(package_id.clone()));
        }
        tokio::fs::remove_dir_all(&dir).await.map_err(io_error(&dir))?;
        info!(package = %package_id, "Package removed");
        Ok(())
    }

    async fn installed(&self) -> Result<Vec<InstalledPackage>, InstallError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| InstallError::Worker(e.to_string()))?
    }
}
