//! In-memory fakes of the store's trait seams
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use elohim_app_store::config::Config;
use elohim_app_store::controller::StoreComponents;
use elohim_app_store::digest::sha256_hex;
use elohim_app_store::download::{ArtifactStream, ArtifactTransport};
use elohim_app_store::installer::{InstallError, InstalledPackage, Installer};
use elohim_app_store::manifest::ApprovalPolicy;
use elohim_app_store::mirror::MirrorProber;
use elohim_app_store::notifications::NotificationKind;
use elohim_app_store::registry::{ChainSource, ListingRecord, RegistryError};
use elohim_app_store::types::{CapabilityManifest, MirrorProbeResult, PackageId};
use elohim_app_store::{AppStore, DownloadErrorKind};

pub const MANIFEST_V1: &str = r#"[{"process_name":"foo","request_networking":true}]"#;
pub const MANIFEST_V2: &str =
    r#"[{"process_name":"foo","request_networking":true,"request_capabilities":["net:distro:sys"]}]"#;

pub fn foo() -> PackageId {
    PackageId::new("foo", "alice.os")
}

/// A package zip carrying `manifest` plus some filler so versions differ
pub fn package_zip(manifest: &str, filler: &str) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    writer.start_file("manifest.json", options).unwrap();
    writer.write_all(manifest.as_bytes()).unwrap();
    writer.start_file("foo/foo.wasm", options).unwrap();
    writer.write_all(filler.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

// ----------------------------------------------------------------------
// Chain
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct FakeChain {
    records: Mutex<BTreeMap<PackageId, ListingRecord>>,
    documents: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FakeChain {
    pub fn publish(&self, package_id: &PackageId, code_hashes: &[(String, String)], mirrors: &[&str]) {
        let current_version = code_hashes
            .last()
            .map(|(v, _)| v.clone())
            .unwrap_or_default();
        let document = serde_json::to_vec(&serde_json::json!({
            "name": package_id.package(),
            "properties": {
                "package_name": package_id.package(),
                "publisher": package_id.publisher(),
                "current_version": current_version,
                "mirrors": mirrors,
                "code_hashes": code_hashes,
            }
        }))
        .unwrap();

        let uri = format!("https://meta.example/{}.json", package_id);
        let record = ListingRecord {
            package_id: package_id.clone(),
            owning_account: "0xtba".to_string(),
            metadata_uri: uri.clone(),
            metadata_hash: format!("0x{}", sha256_hex(&document)),
        };
        self.documents.lock().unwrap().insert(uri, document);
        self.records.lock().unwrap().insert(package_id.clone(), record);
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn listing_record(
        &self,
        package_id: &PackageId,
    ) -> Result<Option<ListingRecord>, RegistryError> {
        Ok(self.records.lock().unwrap().get(package_id).cloned())
    }

    async fn known_packages(&self) -> Result<Vec<PackageId>, RegistryError> {
        Ok(self.records.lock().unwrap().keys().cloned().collect())
    }

    async fn fetch_metadata(&self, uri: &str) -> Result<Vec<u8>, RegistryError> {
        self.documents
            .lock()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| RegistryError::Metadata(format!("{} not found", uri)))
    }
}

// ----------------------------------------------------------------------
// Mirrors
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct FakeProber {
    online: Mutex<BTreeSet<String>>,
    delays: Mutex<BTreeMap<String, Duration>>,
}

impl FakeProber {
    pub fn set_online(&self, node: &str, online: bool) {
        let mut nodes = self.online.lock().unwrap();
        if online {
            nodes.insert(node.to_string());
        } else {
            nodes.remove(node);
        }
    }

    pub fn set_delay(&self, node: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(node.to_string(), delay);
    }
}

#[async_trait]
impl MirrorProber for FakeProber {
    async fn probe(&self, node: &str) -> MirrorProbeResult {
        let delay = self.delays.lock().unwrap().get(node).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        MirrorProbeResult {
            node: node.to_string(),
            is_online: self.online.lock().unwrap().contains(node),
            error: None,
        }
    }
}

// ----------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct FakeTransport {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    corrupt: Mutex<BTreeSet<String>>,
    fetches: Mutex<Vec<String>>,
    chunk_delay: Mutex<Duration>,
}

impl FakeTransport {
    pub fn serve(&self, bytes: &[u8]) -> String {
        let hash = sha256_hex(bytes);
        self.blobs.lock().unwrap().insert(hash.clone(), bytes.to_vec());
        hash
    }

    /// `node` serves content with one byte flipped
    pub fn corrupt(&self, node: &str) {
        self.corrupt.lock().unwrap().insert(node.to_string());
    }

    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.chunk_delay.lock().unwrap() = delay;
    }

    pub fn fetches_from(&self, node: &str) -> usize {
        self.fetches.lock().unwrap().iter().filter(|n| *n == node).count()
    }
}

#[async_trait]
impl ArtifactTransport for FakeTransport {
    async fn fetch(
        &self,
        mirror: &str,
        _package_id: &PackageId,
        version_hash: &str,
    ) -> Result<ArtifactStream, DownloadErrorKind> {
        self.fetches.lock().unwrap().push(mirror.to_string());
        let mut bytes = self
            .blobs
            .lock()
            .unwrap()
            .get(version_hash)
            .cloned()
            .ok_or(DownloadErrorKind::FileNotFound)?;
        if self.corrupt.lock().unwrap().contains(mirror) {
            if let Some(last) = bytes.last_mut() {
                *last ^= 0xff;
            }
        }

        let delay = *self.chunk_delay.lock().unwrap();
        let total = bytes.len() as u64;
        let chunks: Vec<Bytes> = bytes.chunks(64).map(Bytes::copy_from_slice).collect();
        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, DownloadErrorKind>(chunk)
        });
        Ok(ArtifactStream {
            total: Some(total),
            chunks: stream.boxed(),
        })
    }
}

// ----------------------------------------------------------------------
// Installer
// ----------------------------------------------------------------------

#[derive(Default)]
pub struct FakeInstaller {
    installed: Mutex<BTreeMap<PackageId, String>>,
    fail: AtomicBool,
}

impl FakeInstaller {
    pub fn fail_installs(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Simulate the host gaining or losing a package behind the store's back
    pub fn set_host_package(&self, package_id: &PackageId, version_hash: Option<&str>) {
        let mut installed = self.installed.lock().unwrap();
        match version_hash {
            Some(hash) => {
                installed.insert(package_id.clone(), hash.to_string());
            }
            None => {
                installed.remove(package_id);
            }
        }
    }

    pub fn host_version(&self, package_id: &PackageId) -> Option<String> {
        self.installed.lock().unwrap().get(package_id).cloned()
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(
        &self,
        package_id: &PackageId,
        artifact_path: &Path,
        manifest: &CapabilityManifest,
    ) -> Result<(), InstallError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(InstallError::Worker("host refused the package".to_string()));
        }
        assert!(artifact_path.is_file(), "installer got a missing artifact");
        self.set_host_package(package_id, Some(&manifest.version_hash));
        Ok(())
    }

    async fn uninstall(&self, package_id: &PackageId) -> Result<(), InstallError> {
        match self.installed.lock().unwrap().remove(package_id) {
            Some(_) => Ok(()),
            None => Err(InstallError::NotInstalled(package_id.clone())),
        }
    }

    async fn installed(&self) -> Result<Vec<InstalledPackage>, InstallError> {
        Ok(self
            .installed
            .lock()
            .unwrap()
            .iter()
            .map(|(package_id, version_hash)| InstalledPackage {
                package_id: package_id.clone(),
                version_hash: version_hash.clone(),
            })
            .collect())
    }
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

pub struct Harness {
    pub temp: TempDir,
    pub config: Config,
    pub chain: Arc<FakeChain>,
    pub prober: Arc<FakeProber>,
    pub transport: Arc<FakeTransport>,
    pub installer: Arc<FakeInstaller>,
    pub store: Arc<AppStore>,
}

impl Harness {
    pub fn new(policy: ApprovalPolicy) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.node.id = "bob.os".to_string();
        config.node.data_dir = temp.path().to_path_buf();
        config.mirrors.probe_timeout_ms = 500;
        config.downloads.chunk_timeout_secs = 5;
        config.updates.approval_policy = policy;

        let chain = Arc::new(FakeChain::default());
        let prober = Arc::new(FakeProber::default());
        let transport = Arc::new(FakeTransport::default());
        let installer = Arc::new(FakeInstaller::default());
        let store = Arc::new(AppStore::new(&config, Self::components(&chain, &prober, &transport, &installer)).unwrap());

        Self {
            temp,
            config,
            chain,
            prober,
            transport,
            installer,
            store,
        }
    }

    fn components(
        chain: &Arc<FakeChain>,
        prober: &Arc<FakeProber>,
        transport: &Arc<FakeTransport>,
        installer: &Arc<FakeInstaller>,
    ) -> StoreComponents {
        StoreComponents {
            chain: chain.clone(),
            prober: prober.clone(),
            transport: transport.clone(),
            installer: installer.clone(),
        }
    }

    /// A second store over the same data directory and fakes
    pub fn reopen(&self) -> AppStore {
        AppStore::new(
            &self.config,
            Self::components(&self.chain, &self.prober, &self.transport, &self.installer),
        )
        .unwrap()
    }

    /// Publish versions of `package_id`, served by the transport; returns their hashes
    pub fn publish(&self, package_id: &PackageId, versions: &[(&str, Vec<u8>)], mirrors: &[&str]) -> Vec<String> {
        let code_hashes: Vec<(String, String)> = versions
            .iter()
            .map(|(version, bytes)| (version.to_string(), self.transport.serve(bytes)))
            .collect();
        self.chain.publish(package_id, &code_hashes, mirrors);
        code_hashes.into_iter().map(|(_, hash)| hash).collect()
    }

    /// Download `version_hash` from `mirror` and wait for it to land
    pub async fn download(&self, package_id: &PackageId, version_hash: &str, mirror: &str) {
        self.store.start_download(package_id, version_hash, mirror).unwrap();
        let store = self.store.clone();
        let version_hash = version_hash.to_string();
        // The Download notification is emitted once the artifact is committed
        wait_until(move || {
            store.list_notifications().iter().any(|n| {
                n.kind == NotificationKind::Download
                    && n.metadata.as_ref().and_then(|m| m.version_hash.as_deref())
                        == Some(version_hash.as_str())
            })
        })
        .await;
    }

    /// Download, approve and install one version
    pub async fn install(&self, package_id: &PackageId, version_hash: &str, mirror: &str) {
        self.download(package_id, version_hash, mirror).await;
        self.store.approve(package_id, version_hash).unwrap();
        self.store.install(package_id, version_hash).await.unwrap();
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
