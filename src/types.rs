//! Shared data model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::DownloadErrorKind;
use crate::version::latest_version;

/// Composite package identifier, written `package_name:publisher_node`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId {
    pub package_name: String,
    pub publisher_node: String,
}

impl PackageId {
    pub fn new(package_name: impl Into<String>, publisher_node: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            publisher_node: publisher_node.into(),
        }
    }

    pub fn package(&self) -> &str {
        &self.package_name
    }

    pub fn publisher(&self) -> &str {
        &self.publisher_node
    }

    /// Both parts are usable as a single path component
    pub fn is_path_safe(&self) -> bool {
        is_safe_part(&self.package_name)
            && is_safe_part(&self.publisher_node)
            && !self.package_name.contains(':')
            && !self.publisher_node.contains(':')
    }
}

fn is_safe_part(part: &str) -> bool {
    !part.is_empty()
        && !part.contains("..")
        && !part.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package_name, self.publisher_node)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid package id \"{0}\": expected package_name:publisher_node")]
pub struct ParsePackageIdError(pub String);

impl FromStr for PackageId {
    type Err = ParsePackageIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (package, publisher) = s
            .split_once(':')
            .ok_or_else(|| ParsePackageIdError(s.to_string()))?;
        let id = PackageId::new(package, publisher);
        if !id.is_path_safe() {
            return Err(ParsePackageIdError(s.to_string()));
        }
        Ok(id)
    }
}

impl TryFrom<String> for PackageId {
    type Error = ParsePackageIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PackageId> for String {
    fn from(id: PackageId) -> Self {
        id.to_string()
    }
}

/// A package as published on-chain, with its resolved metadata if available
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppListing {
    pub package_id: PackageId,
    /// Token-bound account that owns the package entry
    pub owning_account: String,
    pub metadata_uri: String,
    pub metadata_hash: String,
    /// `None` when metadata could not be fetched or verified
    pub metadata: Option<PackageMetadata>,
    #[serde(default)]
    pub auto_update: bool,
}

impl AppListing {
    pub fn properties(&self) -> Option<&PackageProperties> {
        self.metadata.as_ref().map(|m| &m.properties)
    }
}

/// ERC-721 style metadata document published at `metadata_uri`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub animation_url: Option<String>,
    pub properties: PackageProperties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageProperties {
    pub package_name: String,
    pub publisher: String,
    pub current_version: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    /// Authoritative version -> content hash table
    pub code_hashes: Vec<(String, String)>,
    #[serde(default)]
    pub license: Option<String>,
    #[serde(default)]
    pub screenshots: Option<Vec<String>>,
    #[serde(default)]
    pub wit_version: Option<u32>,
    #[serde(default)]
    pub dependencies: Option<Vec<String>>,
}

impl PackageProperties {
    /// Latest `(version, hash)` by semantic ordering
    pub fn latest(&self) -> Option<&(String, String)> {
        latest_version(&self.code_hashes)
    }

    pub fn version_for_hash(&self, hash: &str) -> Option<&str> {
        self.code_hashes
            .iter()
            .find(|(_, h)| h == hash)
            .map(|(v, _)| v.as_str())
    }

    /// Download candidates: listed mirrors, then the publisher, without duplicates
    pub fn candidate_mirrors(&self) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::with_capacity(self.mirrors.len() + 1);
        for node in self.mirrors.iter().chain(std::iter::once(&self.publisher)) {
            if !node.is_empty() && !candidates.contains(node) {
                candidates.push(node.clone());
            }
        }
        candidates
    }
}

/// Local record of an installed package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageState {
    pub package_id: PackageId,
    pub installed_version_hash: String,
    pub verified: bool,
    pub capabilities_approved: bool,
    /// Hash of the manifest the operator approved for the installed version
    #[serde(default)]
    pub manifest_hash: Option<String>,
    /// Set when an auto-update to this hash failed
    #[serde(default)]
    pub pending_update_hash: Option<String>,
}

/// An entry in the local downloads area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DownloadArtifact {
    Dir { name: String, mirroring: bool },
    File { name: String, size: u64, manifest: String },
}

impl DownloadArtifact {
    pub fn name(&self) -> &str {
        match self {
            DownloadArtifact::Dir { name, .. } | DownloadArtifact::File { name, .. } => name,
        }
    }
}

/// Result of probing one mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorProbeResult {
    pub node: String,
    pub is_online: bool,
    pub error: Option<String>,
}

/// The capability request document bundled with a package version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityManifest {
    pub package_id: PackageId,
    pub version_hash: String,
    pub manifest: String,
}

/// Identity of a download: `package_id:version_hash`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DownloadKey {
    pub package_id: PackageId,
    pub version_hash: String,
}

impl DownloadKey {
    pub fn new(package_id: PackageId, version_hash: impl Into<String>) -> Self {
        Self {
            package_id,
            version_hash: version_hash.into(),
        }
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.package_id, self.version_hash)
    }
}

/// Progress of an in-flight download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub mirror: String,
    pub downloaded: u64,
    pub total: Option<u64>,
}

/// Per-version update bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateInfo {
    /// `(source, error)` pairs, append-only
    pub errors: Vec<(String, DownloadErrorKind)>,
    /// Manifest hash that differed from the approved one
    pub pending_manifest_hash: Option<String>,
}

/// package_id -> version_hash -> update info
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Updates {
    pub package_updates: BTreeMap<PackageId, BTreeMap<String, UpdateInfo>>,
}

impl Updates {
    pub fn get(&self, package_id: &PackageId, version_hash: &str) -> Option<&UpdateInfo> {
        self.package_updates.get(package_id)?.get(version_hash)
    }

    fn entry(&mut self, package_id: &PackageId, version_hash: &str) -> &mut UpdateInfo {
        self.package_updates
            .entry(package_id.clone())
            .or_default()
            .entry(version_hash.to_string())
            .or_default()
    }

    pub fn record_error(
        &mut self,
        package_id: &PackageId,
        version_hash: &str,
        source: impl Into<String>,
        error: DownloadErrorKind,
    ) {
        self.entry(package_id, version_hash)
            .errors
            .push((source.into(), error));
    }

    pub fn set_pending_manifest(
        &mut self,
        package_id: &PackageId,
        version_hash: &str,
        manifest_hash: String,
    ) {
        self.entry(package_id, version_hash).pending_manifest_hash = Some(manifest_hash);
    }

    /// Drop one version's entry; removes the package key once empty
    pub fn clear_version(&mut self, package_id: &PackageId, version_hash: &str) {
        if let Some(versions) = self.package_updates.get_mut(package_id) {
            versions.remove(version_hash);
            if versions.is_empty() {
                self.package_updates.remove(package_id);
            }
        }
    }

    pub fn clear_package(&mut self, package_id: &PackageId) {
        self.package_updates.remove(package_id);
    }

    pub fn is_empty(&self) -> bool {
        self.package_updates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_id_round_trip() {
        let id: PackageId = "foo:alice.os".parse().unwrap();
        assert_eq!(id.package(), "foo");
        assert_eq!(id.publisher(), "alice.os");
        assert_eq!(id.to_string(), "foo:alice.os");
    }

    #[test]
    fn test_package_id_rejects_malformed() {
        assert!("foo".parse::<PackageId>().is_err());
        assert!(":alice.os".parse::<PackageId>().is_err());
        assert!("foo:".parse::<PackageId>().is_err());
        assert!("foo:alice.os:extra".parse::<PackageId>().is_err());
    }

    #[test]
    fn test_package_id_rejects_path_characters() {
        assert!("x:../../../escaped".parse::<PackageId>().is_err());
        assert!("../x:alice.os".parse::<PackageId>().is_err());
        assert!("foo:alice/os".parse::<PackageId>().is_err());
        assert!("foo:alice\\os".parse::<PackageId>().is_err());
        assert!("foo\n:alice.os".parse::<PackageId>().is_err());
        assert!(serde_json::from_str::<PackageId>(r#""x:..""#).is_err());
        assert!(!PackageId::new("..", "alice.os").is_path_safe());
        assert!("my-app_2:alice.os".parse::<PackageId>().is_ok());
    }

    #[test]
    fn test_package_id_as_json_map_key() {
        let mut updates = Updates::default();
        let id = PackageId::new("foo", "alice.os");
        updates.record_error(&id, "h2", "m1", DownloadErrorKind::Offline);

        let json = serde_json::to_string(&updates).unwrap();
        assert!(json.contains("\"foo:alice.os\""));

        let back: Updates = serde_json::from_str(&json).unwrap();
        assert_eq!(back, updates);
    }

    #[test]
    fn test_candidate_mirrors_appends_publisher_once() {
        let props = PackageProperties {
            package_name: "foo".to_string(),
            publisher: "alice.os".to_string(),
            current_version: "1.0.0".to_string(),
            mirrors: vec!["m1.os".to_string(), "alice.os".to_string(), "m1.os".to_string()],
            code_hashes: vec![],
            license: None,
            screenshots: None,
            wit_version: None,
            dependencies: None,
        };
        assert_eq!(props.candidate_mirrors(), vec!["m1.os", "alice.os"]);
    }

    #[test]
    fn test_updates_clear_version_drops_empty_package() {
        let mut updates = Updates::default();
        let id = PackageId::new("foo", "alice.os");
        updates.record_error(&id, "h2", "m1", DownloadErrorKind::Timeout);
        updates.set_pending_manifest(&id, "h3", "abc".to_string());

        updates.clear_version(&id, "h2");
        assert!(updates.get(&id, "h2").is_none());
        assert!(updates.get(&id, "h3").is_some());

        updates.clear_version(&id, "h3");
        assert!(updates.is_empty());
    }
}
