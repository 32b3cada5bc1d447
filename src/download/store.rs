//! On-disk artifact store
//!
//! Layout under `{data_dir}/downloads`:
//!
//! ```text
//! {package_id}/
//!     .mirroring          present while we serve this package to peers
//!     {hash}.{n}.download partial transfer, one per download attempt
//!     {hash}.zip          verified artifact
//!     {hash}.json         manifest.json extracted from the artifact
//! ```

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::digest::is_content_hash;
use crate::error::DownloadErrorKind;
use crate::types::{DownloadArtifact, PackageId};

const MIRRORING_MARKER: &str = ".mirroring";
const MANIFEST_ENTRY: &str = "manifest.json";

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("downloads"),
        }
    }

    pub fn package_dir(&self, package_id: &PackageId) -> PathBuf {
        self.root.join(package_id.to_string())
    }

    pub fn artifact_path(&self, package_id: &PackageId, version_hash: &str) -> PathBuf {
        self.package_dir(package_id).join(format!("{}.zip", version_hash))
    }

    pub fn manifest_path(&self, package_id: &PackageId, version_hash: &str) -> PathBuf {
        self.package_dir(package_id).join(format!("{}.json", version_hash))
    }

    /// Partial file of one download attempt; attempts never share a file
    pub fn partial_path(&self, package_id: &PackageId, version_hash: &str, attempt: u64) -> PathBuf {
        self.package_dir(package_id)
            .join(format!("{}.{}.download", version_hash, attempt))
    }

    pub fn has_artifact(&self, package_id: &PackageId, version_hash: &str) -> bool {
        package_id.is_path_safe()
            && is_content_hash(version_hash)
            && self.artifact_path(package_id, version_hash).is_file()
    }

    pub fn ensure_package_dir(&self, package_id: &PackageId) -> Result<PathBuf, DownloadErrorKind> {
        if !package_id.is_path_safe() {
            warn!(package = %package_id, "Refusing package id that is not a single path component");
            return Err(DownloadErrorKind::NoPackage);
        }
        let dir = self.package_dir(package_id);
        fs::create_dir_all(&dir).map_err(|e| vfs_error(&dir, e))?;
        Ok(dir)
    }

    /// Promote a verified partial file to `{hash}.zip` and extract its manifest.
    ///
    /// A missing or unreadable manifest does not fail the commit; the artifact
    /// is kept and the manifest gate reports it when asked.
    pub fn commit(
        &self,
        package_id: &PackageId,
        version_hash: &str,
        partial: &Path,
    ) -> Result<DownloadArtifact, DownloadErrorKind> {
        check_hash(version_hash)?;
        let final_path = self.artifact_path(package_id, version_hash);
        fs::rename(partial, &final_path).map_err(|e| vfs_error(&final_path, e))?;
        self.finish_artifact(package_id, version_hash)
    }

    /// Store complete bytes as `{hash}.zip` (sideloading)
    pub fn write_artifact(
        &self,
        package_id: &PackageId,
        version_hash: &str,
        bytes: &[u8],
    ) -> Result<DownloadArtifact, DownloadErrorKind> {
        check_hash(version_hash)?;
        self.ensure_package_dir(package_id)?;
        let path = self.artifact_path(package_id, version_hash);
        fs::write(&path, bytes).map_err(|e| vfs_error(&path, e))?;
        self.finish_artifact(package_id, version_hash)
    }

    fn finish_artifact(
        &self,
        package_id: &PackageId,
        version_hash: &str,
    ) -> Result<DownloadArtifact, DownloadErrorKind> {
        let zip_path = self.artifact_path(package_id, version_hash);
        let size = fs::metadata(&zip_path)
            .map_err(|e| vfs_error(&zip_path, e))?
            .len();

        let manifest = match extract_manifest(&zip_path) {
            Ok(text) => {
                let json_path = self.manifest_path(package_id, version_hash);
                fs::write(&json_path, &text).map_err(|e| vfs_error(&json_path, e))?;
                text
            }
            Err(e) => {
                warn!(package = %package_id, hash = %version_hash, error = %e, "Artifact has no readable manifest");
                String::new()
            }
        };

        Ok(DownloadArtifact::File {
            name: format!("{}.zip", version_hash),
            size,
            manifest,
        })
    }

    /// Remove a partial transfer, ignoring a file that is already gone
    pub fn discard_partial(&self, partial: &Path) {
        if let Err(e) = fs::remove_file(partial) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %partial.display(), error = %e, "Failed to remove partial download");
            }
        }
    }

    /// Manifest text for a stored version
    pub fn read_manifest(
        &self,
        package_id: &PackageId,
        version_hash: &str,
    ) -> Result<String, DownloadErrorKind> {
        if !self.has_artifact(package_id, version_hash) {
            return Err(DownloadErrorKind::BlobNotFound);
        }
        let zip_path = self.artifact_path(package_id, version_hash);
        let json_path = self.manifest_path(package_id, version_hash);
        match fs::read_to_string(&json_path) {
            Ok(text) => Ok(text),
            Err(_) => {
                debug!(path = %zip_path.display(), "Manifest not cached, reading from artifact");
                extract_manifest(&zip_path)
            }
        }
    }

    /// One `Dir` per package that has a downloads directory
    pub fn list_dirs(&self) -> Result<Vec<DownloadArtifact>, DownloadErrorKind> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(vfs_error(&self.root, e)),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| vfs_error(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let mirroring = entry.path().join(MIRRORING_MARKER).exists();
            dirs.push(DownloadArtifact::Dir { name, mirroring });
        }
        dirs.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(dirs)
    }

    /// Every verified artifact stored for a package
    pub fn list_files(&self, package_id: &PackageId) -> Result<Vec<DownloadArtifact>, DownloadErrorKind> {
        if !package_id.is_path_safe() {
            return Err(DownloadErrorKind::NoPackage);
        }
        let dir = self.package_dir(package_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(vfs_error(&dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| vfs_error(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("zip") {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let manifest = fs::read_to_string(self.manifest_path(package_id, hash)).unwrap_or_default();
            files.push(DownloadArtifact::File {
                name: format!("{}.zip", hash),
                size,
                manifest,
            });
        }
        files.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(files)
    }

    /// Delete a stored version (zip and manifest); in-flight partials belong to their transfers
    pub fn remove(&self, package_id: &PackageId, version_hash: &str) -> Result<(), DownloadErrorKind> {
        if !self.has_artifact(package_id, version_hash) {
            return Err(DownloadErrorKind::FileNotFound);
        }
        let zip_path = self.artifact_path(package_id, version_hash);
        fs::remove_file(&zip_path).map_err(|e| vfs_error(&zip_path, e))?;
        let _ = fs::remove_file(self.manifest_path(package_id, version_hash));
        Ok(())
    }

    pub fn set_mirroring(&self, package_id: &PackageId, enabled: bool) -> Result<(), DownloadErrorKind> {
        if !package_id.is_path_safe() {
            return Err(DownloadErrorKind::NoPackage);
        }
        let marker = self.package_dir(package_id).join(MIRRORING_MARKER);
        if enabled {
            self.ensure_package_dir(package_id)?;
            fs::write(&marker, b"").map_err(|e| vfs_error(&marker, e))?;
        } else if marker.exists() {
            fs::remove_file(&marker).map_err(|e| vfs_error(&marker, e))?;
        }
        Ok(())
    }

    pub fn is_mirroring(&self, package_id: &PackageId) -> bool {
        package_id.is_path_safe() && self.package_dir(package_id).join(MIRRORING_MARKER).exists()
    }
}

/// Hashes become file names; reject anything that is not a hex digest
pub fn check_hash(version_hash: &str) -> Result<(), DownloadErrorKind> {
    if is_content_hash(version_hash) {
        Ok(())
    } else {
        Err(DownloadErrorKind::FileNotFound)
    }
}

fn vfs_error(path: &Path, e: std::io::Error) -> DownloadErrorKind {
    warn!(path = %path.display(), error = %e, "Artifact store I/O failed");
    DownloadErrorKind::VfsError
}

/// Read `manifest.json` out of a package zip
pub fn extract_manifest(zip_path: &Path) -> Result<String, DownloadErrorKind> {
    let bytes = fs::read(zip_path).map_err(|_| DownloadErrorKind::BlobNotFound)?;
    manifest_from_bytes(&bytes)
}

pub fn manifest_from_bytes(bytes: &[u8]) -> Result<String, DownloadErrorKind> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).map_err(|_| DownloadErrorKind::InvalidManifest)?;
    let mut entry = archive
        .by_name(MANIFEST_ENTRY)
        .map_err(|_| DownloadErrorKind::InvalidManifest)?;
    let mut text = String::new();
    entry
        .read_to_string(&mut text)
        .map_err(|_| DownloadErrorKind::InvalidManifest)?;
    Ok(text)
}
