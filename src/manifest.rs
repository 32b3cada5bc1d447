//! Manifest and capability gate
//!
//! Installs need an approval for the exact `(package_id, version_hash)` pair,
//! bound to the hash of the manifest that was reviewed. Whether an approval
//! can carry over to a new version is decided by [`ApprovalPolicy`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::digest::sha256_hex;
use crate::download::ArtifactStore;
use crate::error::DownloadErrorKind;
use crate::types::{CapabilityManifest, DownloadKey, PackageId, PackageState};

/// When a new version may inherit the installed version's approval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Every version needs an operator approval
    ExactVersion,
    /// A byte-identical manifest keeps the previous approval
    #[default]
    ReuseIdenticalManifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApprovalReason {
    Operator,
    IdenticalManifest { previous_version_hash: String },
}

/// Audit entry for one approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub package_id: PackageId,
    pub version_hash: String,
    pub manifest_hash: String,
    pub approved_at: DateTime<Utc>,
    pub reason: ApprovalReason,
}

/// One process entry of `manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub process_name: String,
    #[serde(default)]
    pub process_wasm_path: Option<String>,
    #[serde(default)]
    pub request_capabilities: Vec<serde_json::Value>,
    #[serde(default)]
    pub grant_capabilities: Vec<serde_json::Value>,
    #[serde(default)]
    pub request_networking: bool,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub on_exit: Option<serde_json::Value>,
}

/// Parse and validate manifest text
pub fn parse_manifest(text: &str) -> Result<Vec<ManifestEntry>, DownloadErrorKind> {
    let entries: Vec<ManifestEntry> =
        serde_json::from_str(text).map_err(|_| DownloadErrorKind::InvalidManifest)?;
    if entries.iter().any(|e| e.process_name.trim().is_empty()) {
        return Err(DownloadErrorKind::InvalidManifest);
    }
    Ok(entries)
}

/// Outcome of checking whether a new version inherits approval
#[derive(Debug, Clone, PartialEq)]
pub enum CarryOver {
    Approved(ApprovalRecord),
    NeedsReview { manifest_hash: String },
}

pub struct ManifestGate {
    store: ArtifactStore,
    policy: ApprovalPolicy,
    approvals: DashMap<DownloadKey, ApprovalRecord>,
}

impl ManifestGate {
    pub fn new(store: ArtifactStore, policy: ApprovalPolicy) -> Self {
        Self {
            store,
            policy,
            approvals: DashMap::new(),
        }
    }

    pub fn fetch_manifest(
        &self,
        package_id: &PackageId,
        version_hash: &str,
    ) -> Result<CapabilityManifest, DownloadErrorKind> {
        let manifest = self.store.read_manifest(package_id, version_hash)?;
        parse_manifest(&manifest)?;
        Ok(CapabilityManifest {
            package_id: package_id.clone(),
            version_hash: version_hash.to_string(),
            manifest,
        })
    }

    pub fn manifest_hash(manifest: &CapabilityManifest) -> String {
        sha256_hex(manifest.manifest.as_bytes())
    }

    /// Operator approval of exactly this pair
    pub fn record_approval(
        &self,
        package_id: &PackageId,
        version_hash: &str,
    ) -> Result<ApprovalRecord, DownloadErrorKind> {
        let manifest = self.fetch_manifest(package_id, version_hash)?;
        let record = ApprovalRecord {
            package_id: package_id.clone(),
            version_hash: version_hash.to_string(),
            manifest_hash: Self::manifest_hash(&manifest),
            approved_at: Utc::now(),
            reason: ApprovalReason::Operator,
        };
        info!(package = %package_id, hash = %version_hash, "Capabilities approved");
        self.insert(record.clone());
        Ok(record)
    }

    pub fn approval(&self, package_id: &PackageId, version_hash: &str) -> Option<ApprovalRecord> {
        let key = DownloadKey::new(package_id.clone(), version_hash);
        self.approvals.get(&key).map(|r| r.value().clone())
    }

    /// An approval exists and still matches the manifest on disk
    pub fn is_approved(&self, package_id: &PackageId, version_hash: &str) -> bool {
        let Some(record) = self.approval(package_id, version_hash) else {
            return false;
        };
        match self.fetch_manifest(package_id, version_hash) {
            Ok(manifest) => Self::manifest_hash(&manifest) == record.manifest_hash,
            Err(_) => false,
        }
    }

    /// Decide whether `new_version_hash` inherits the installed approval
    pub fn carry_over(
        &self,
        package_id: &PackageId,
        new_version_hash: &str,
        installed: &PackageState,
    ) -> Result<CarryOver, DownloadErrorKind> {
        let manifest = self.fetch_manifest(package_id, new_version_hash)?;
        let manifest_hash = Self::manifest_hash(&manifest);

        if let Some(existing) = self.approval(package_id, new_version_hash) {
            if existing.manifest_hash == manifest_hash {
                return Ok(CarryOver::Approved(existing));
            }
        }

        let identical = installed.capabilities_approved
            && installed.manifest_hash.as_deref() == Some(manifest_hash.as_str());
        if self.policy == ApprovalPolicy::ReuseIdenticalManifest && identical {
            let record = ApprovalRecord {
                package_id: package_id.clone(),
                version_hash: new_version_hash.to_string(),
                manifest_hash,
                approved_at: Utc::now(),
                reason: ApprovalReason::IdenticalManifest {
                    previous_version_hash: installed.installed_version_hash.clone(),
                },
            };
            info!(
                package = %package_id,
                hash = %new_version_hash,
                previous = %installed.installed_version_hash,
                "Manifest unchanged, approval carried over"
            );
            self.insert(record.clone());
            return Ok(CarryOver::Approved(record));
        }

        debug!(package = %package_id, hash = %new_version_hash, "Manifest needs review");
        Ok(CarryOver::NeedsReview { manifest_hash })
    }

    /// Drop every approval for a package, returning how many were removed
    pub fn revoke(&self, package_id: &PackageId) -> usize {
        let before = self.approvals.len();
        self.approvals.retain(|key, _| &key.package_id != package_id);
        before - self.approvals.len()
    }

    pub fn approvals(&self) -> Vec<ApprovalRecord> {
        let mut records: Vec<ApprovalRecord> =
            self.approvals.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| {
            (&a.package_id, &a.version_hash).cmp(&(&b.package_id, &b.version_hash))
        });
        records
    }

    /// Load persisted approvals
    pub fn restore(&self, records: Vec<ApprovalRecord>) {
        for record in records {
            self.insert(record);
        }
    }

    fn insert(&self, record: ApprovalRecord) {
        let key = DownloadKey::new(record.package_id.clone(), record.version_hash.clone());
        self.approvals.insert(key, record);
    }
}
