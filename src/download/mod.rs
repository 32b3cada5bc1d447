//! Download manager
//!
//! Transfers one artifact from one mirror, verifies it against the published
//! content hash and commits it to the [`ArtifactStore`]. Retrying against
//! other mirrors is the controller's job; nothing here retries.
//!
//! In-flight transfers live in [`ActiveDownloads`], keyed by
//! `package_id:version_hash`. Registration is an atomic check-and-insert, so
//! a second request for the same key is rejected instead of racing the first.

pub mod store;
pub mod transport;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::digest::{hashes_match, sha256_hex};
use crate::error::DownloadErrorKind;
use crate::types::{DownloadArtifact, DownloadKey, DownloadProgress, PackageId};

use store::check_hash;
pub use store::ArtifactStore;
pub use transport::{ArtifactStream, ArtifactTransport, HttpArtifactTransport};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransferError {
    #[error("download {0} is already in progress")]
    Duplicate(String),

    #[error(transparent)]
    Failed(#[from] DownloadErrorKind),

    /// Cleared while in flight; not a failure and never reported
    #[error("download {0} was abandoned")]
    Abandoned(String),
}

/// Pushed to download subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        key: String,
        mirror: String,
    },
    Progress {
        key: String,
        downloaded: u64,
        total: Option<u64>,
    },
    Completed {
        key: String,
        artifact: DownloadArtifact,
    },
    Failed {
        key: String,
        mirror: String,
        error: DownloadErrorKind,
    },
}

struct ActiveEntry {
    progress: DownloadProgress,
    generation: u64,
}

/// Proof of a successful registration in [`ActiveDownloads`]
#[derive(Debug, Clone)]
pub struct DownloadTicket {
    pub key: DownloadKey,
    pub mirror: String,
    generation: u64,
    attempt: u64,
}

impl DownloadTicket {
    /// Unique within this process; names the ticket's partial file
    pub fn attempt(&self) -> u64 {
        self.attempt
    }
}

/// Table of in-flight downloads
#[derive(Default)]
pub struct ActiveDownloads {
    entries: DashMap<DownloadKey, ActiveEntry>,
    /// Bumped by `clear_all`; tickets from an older generation are abandoned
    generation: AtomicU64,
    attempts: AtomicU64,
}

impl ActiveDownloads {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_register(&self, key: DownloadKey, mirror: &str) -> Result<DownloadTicket, TransferError> {
        let generation = self.generation.load(Ordering::SeqCst);
        match self.entries.entry(key.clone()) {
            Entry::Occupied(_) => Err(TransferError::Duplicate(key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(ActiveEntry {
                    progress: DownloadProgress {
                        mirror: mirror.to_string(),
                        downloaded: 0,
                        total: None,
                    },
                    generation,
                });
                Ok(DownloadTicket {
                    key,
                    mirror: mirror.to_string(),
                    generation,
                    attempt: self.attempts.fetch_add(1, Ordering::SeqCst) + 1,
                })
            }
        }
    }

    /// Record progress; returns false if the ticket was abandoned
    pub fn update(&self, ticket: &DownloadTicket, downloaded: u64, total: Option<u64>) -> bool {
        let Some(mut entry) = self.entries.get_mut(&ticket.key) else {
            return false;
        };
        if entry.generation != ticket.generation {
            return false;
        }
        if downloaded > entry.progress.downloaded {
            entry.progress.downloaded = downloaded;
        }
        if total.is_some() {
            entry.progress.total = total;
        }
        true
    }

    /// Remove the ticket's entry; returns false if it was already abandoned
    pub fn finish(&self, ticket: &DownloadTicket) -> bool {
        self.entries
            .remove_if(&ticket.key, |_, entry| entry.generation == ticket.generation)
            .is_some()
    }

    /// Abandon every in-flight download, returning how many were dropped
    pub fn clear_all(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    /// Version hash of an in-flight download for `package_id`, if any
    pub fn downloading(&self, package_id: &PackageId) -> Option<String> {
        self.entries
            .iter()
            .find(|e| &e.key().package_id == package_id)
            .map(|e| e.key().version_hash.clone())
    }

    /// `package_id:version_hash` -> progress
    pub fn snapshot(&self) -> BTreeMap<String, DownloadProgress> {
        self.entries
            .iter()
            .map(|e| (e.key().to_string(), e.value().progress.clone()))
            .collect()
    }
}

pub struct DownloadManager {
    store: ArtifactStore,
    transport: Arc<dyn ArtifactTransport>,
    active: ActiveDownloads,
    events: broadcast::Sender<DownloadEvent>,
    chunk_timeout: Duration,
}

impl DownloadManager {
    pub fn new(store: ArtifactStore, transport: Arc<dyn ArtifactTransport>, chunk_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            transport,
            active: ActiveDownloads::new(),
            events,
            chunk_timeout,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn active(&self) -> &ActiveDownloads {
        &self.active
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Register a download without starting the transfer
    pub fn begin(
        &self,
        package_id: &PackageId,
        version_hash: &str,
        mirror: &str,
    ) -> Result<DownloadTicket, TransferError> {
        let key = DownloadKey::new(package_id.clone(), version_hash);
        let ticket = self.active.try_register(key, mirror)?;
        info!(key = %ticket.key, mirror = %mirror, "Download started");
        self.send(DownloadEvent::Started {
            key: ticket.key.to_string(),
            mirror: mirror.to_string(),
        });
        Ok(ticket)
    }

    /// Run a registered transfer to completion
    pub async fn run(&self, ticket: DownloadTicket) -> Result<DownloadArtifact, TransferError> {
        let key = ticket.key.to_string();
        let package_id = &ticket.key.package_id;
        let version_hash = &ticket.key.version_hash;
        let partial = self
            .store
            .partial_path(package_id, version_hash, ticket.attempt);

        let kind = match self.transfer(&ticket, &partial).await {
            Ok(()) => match self.store.commit(package_id, version_hash, &partial) {
                Ok(artifact) => {
                    info!(key = %key, "Download complete");
                    self.send(DownloadEvent::Completed {
                        key,
                        artifact: artifact.clone(),
                    });
                    return Ok(artifact);
                }
                // Already out of the active table
                Err(kind) => kind,
            },
            Err(TransferError::Failed(kind)) => {
                if !self.active.finish(&ticket) {
                    self.store.discard_partial(&partial);
                    return Err(TransferError::Abandoned(key));
                }
                kind
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Download abandoned");
                self.store.discard_partial(&partial);
                return Err(e);
            }
        };

        self.store.discard_partial(&partial);
        warn!(key = %key, mirror = %ticket.mirror, error = %kind, "Download failed");
        self.send(DownloadEvent::Failed {
            key,
            mirror: ticket.mirror.clone(),
            error: kind.clone(),
        });
        Err(TransferError::Failed(kind))
    }

    /// Register and run in one step
    pub async fn download(
        &self,
        package_id: &PackageId,
        version_hash: &str,
        mirror: &str,
    ) -> Result<DownloadArtifact, TransferError> {
        let ticket = self.begin(package_id, version_hash, mirror)?;
        self.run(ticket).await
    }

    /// Stream, hash and verify into the partial file, leaving the active table on success
    async fn transfer(&self, ticket: &DownloadTicket, partial: &Path) -> Result<(), TransferError> {
        let package_id = &ticket.key.package_id;
        let version_hash = &ticket.key.version_hash;
        let abandoned = || TransferError::Abandoned(ticket.key.to_string());

        check_hash(version_hash)?;
        let mut stream = self
            .transport
            .fetch(&ticket.mirror, package_id, version_hash)
            .await?;

        self.store.ensure_package_dir(package_id)?;
        let mut file = create_partial(partial).await?;

        let total = stream.total;
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;

        if !self.active.update(ticket, 0, total) {
            return Err(abandoned());
        }

        loop {
            let next = tokio::time::timeout(self.chunk_timeout, stream.chunks.next())
                .await
                .map_err(|_| DownloadErrorKind::Timeout)?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            file.write_all(&chunk)
                .await
                .map_err(|_| DownloadErrorKind::VfsError)?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;

            if !self.active.update(ticket, downloaded, total) {
                return Err(abandoned());
            }
            self.send(DownloadEvent::Progress {
                key: ticket.key.to_string(),
                downloaded,
                total,
            });
        }

        file.flush().await.map_err(|_| DownloadErrorKind::VfsError)?;
        drop(file);

        let actual = format!("{:x}", hasher.finalize());
        if !hashes_match(&actual, version_hash) {
            return Err(DownloadErrorKind::HashMismatch {
                desired: version_hash.clone(),
                actual,
            }
            .into());
        }

        // Last chance to observe an abandon before the artifact becomes visible
        if !self.active.finish(ticket) {
            return Err(abandoned());
        }
        Ok(())
    }

    /// Abandon every in-flight download
    pub fn clear_active(&self) -> usize {
        let dropped = self.active.clear_all();
        if dropped > 0 {
            info!("Cleared {} active downloads", dropped);
        }
        dropped
    }

    pub fn active_downloads(&self) -> BTreeMap<String, DownloadProgress> {
        self.active.snapshot()
    }

    /// Store local bytes under their own content hash
    pub fn add_local(
        &self,
        package_id: &PackageId,
        bytes: &[u8],
    ) -> Result<(String, DownloadArtifact), DownloadErrorKind> {
        let version_hash = sha256_hex(bytes);
        let artifact = self.store.write_artifact(package_id, &version_hash, bytes)?;
        info!(package = %package_id, hash = %version_hash, "Sideloaded package");
        Ok((version_hash, artifact))
    }

    /// Directory listing when `package_id` is `None`, otherwise that package's files
    pub fn list_downloads(
        &self,
        package_id: Option<&PackageId>,
    ) -> Result<Vec<DownloadArtifact>, DownloadErrorKind> {
        match package_id {
            Some(package_id) => self.store.list_files(package_id),
            None => self.store.list_dirs(),
        }
    }

    pub fn remove_download(&self, package_id: &PackageId, version_hash: &str) -> Result<(), DownloadErrorKind> {
        self.store.remove(package_id, version_hash)
    }

    pub fn set_mirroring(&self, package_id: &PackageId, enabled: bool) -> Result<(), DownloadErrorKind> {
        self.store.set_mirroring(package_id, enabled)?;
        info!(package = %package_id, enabled, "Mirroring updated");
        Ok(())
    }

    fn send(&self, event: DownloadEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Open a fresh partial file; a file already at the path is left over from a previous process
async fn create_partial(partial: &Path) -> Result<tokio::fs::File, DownloadErrorKind> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    match options.open(partial).await {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            debug!(path = %partial.display(), "Replacing leftover partial file");
            tokio::fs::remove_file(partial)
                .await
                .map_err(|_| DownloadErrorKind::VfsError)?;
            options
                .open(partial)
                .await
                .map_err(|_| DownloadErrorKind::VfsError)
        }
        Err(_) => Err(DownloadErrorKind::VfsError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io::{Cursor, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn package_zip() -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("manifest.json", SimpleFileOptions::default())
            .unwrap();
        writer
            .write_all(br#"[{"process_name":"foo"}]"#)
            .unwrap();
        writer.finish().unwrap().into_inner()
    }

    /// Serves fixed bytes in small chunks, optionally pausing between them
    struct ChunkedTransport {
        bytes: Vec<u8>,
        delay: Duration,
    }

    #[async_trait]
    impl ArtifactTransport for ChunkedTransport {
        async fn fetch(
            &self,
            _mirror: &str,
            _package_id: &PackageId,
            _version_hash: &str,
        ) -> Result<ArtifactStream, DownloadErrorKind> {
            let delay = self.delay;
            let chunks: Vec<Bytes> = self
                .bytes
                .chunks(16)
                .map(Bytes::copy_from_slice)
                .collect();
            let stream = futures::stream::iter(chunks).then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, DownloadErrorKind>(chunk)
            });
            Ok(ArtifactStream {
                total: Some(self.bytes.len() as u64),
                chunks: stream.boxed(),
            })
        }
    }

    /// First fetch sends one chunk, stalls, then sends garbage; later fetches serve `bytes`
    struct StallingTransport {
        bytes: Vec<u8>,
        stall: Duration,
        fetches: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ArtifactTransport for StallingTransport {
        async fn fetch(
            &self,
            _mirror: &str,
            _package_id: &PackageId,
            _version_hash: &str,
        ) -> Result<ArtifactStream, DownloadErrorKind> {
            let total = Some(self.bytes.len() as u64);
            if self.fetches.fetch_add(1, Ordering::SeqCst) > 0 {
                let chunks = vec![Ok(Bytes::from(self.bytes.clone()))];
                return Ok(ArtifactStream {
                    total,
                    chunks: futures::stream::iter(chunks).boxed(),
                });
            }
            let stall = self.stall;
            let head = Bytes::copy_from_slice(&self.bytes[..16]);
            let steps = vec![(Duration::ZERO, head), (stall, Bytes::from(vec![0xAA; 64]))];
            let stream = futures::stream::iter(steps).then(|(delay, chunk)| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, DownloadErrorKind>(chunk)
            });
            Ok(ArtifactStream {
                total,
                chunks: stream.boxed(),
            })
        }
    }

    fn foo() -> PackageId {
        PackageId::new("foo", "alice.os")
    }

    fn partial_files(manager: &DownloadManager) -> Vec<std::path::PathBuf> {
        let dir = manager.store().package_dir(&foo());
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "download"))
            .collect()
    }

    fn manager(temp: &TempDir, bytes: Vec<u8>, delay: Duration) -> DownloadManager {
        DownloadManager::new(
            ArtifactStore::new(temp.path()),
            Arc::new(ChunkedTransport { bytes, delay }),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_download_verifies_and_commits() {
        let temp = TempDir::new().unwrap();
        let bytes = package_zip();
        let hash = sha256_hex(&bytes);
        let manager = manager(&temp, bytes.clone(), Duration::ZERO);
        let mut events = manager.subscribe();

        let artifact = manager.download(&foo(), &hash, "m1").await.unwrap();
        assert_eq!(artifact.name(), format!("{}.zip", hash));
        assert!(manager.store().has_artifact(&foo(), &hash));
        assert!(partial_files(&manager).is_empty());
        assert!(manager.active_downloads().is_empty());

        assert!(matches!(events.recv().await.unwrap(), DownloadEvent::Started { .. }));
        let mut last = events.recv().await.unwrap();
        while let DownloadEvent::Progress { .. } = last {
            last = events.recv().await.unwrap();
        }
        assert!(matches!(last, DownloadEvent::Completed { .. }));
    }

    #[tokio::test]
    async fn test_hash_mismatch_discards_partial() {
        let temp = TempDir::new().unwrap();
        let bytes = package_zip();
        let actual = sha256_hex(&bytes);
        let manager = manager(&temp, bytes, Duration::ZERO);

        let result = manager.download(&foo(), "ffff", "m1").await;
        assert_eq!(
            result,
            Err(TransferError::Failed(DownloadErrorKind::HashMismatch {
                desired: "ffff".to_string(),
                actual,
            }))
        );
        assert!(partial_files(&manager).is_empty());
        assert!(!manager.store().has_artifact(&foo(), "ffff"));
        assert!(manager.active_downloads().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, package_zip(), Duration::ZERO);

        let _ticket = manager.begin(&foo(), "h1", "m1").unwrap();
        assert_eq!(
            manager.begin(&foo(), "h1", "m2").unwrap_err(),
            TransferError::Duplicate("foo:alice.os:h1".to_string())
        );
        assert!(manager.begin(&foo(), "h2", "m1").is_ok());
    }

    #[tokio::test]
    async fn test_clear_active_abandons_silently() {
        let temp = TempDir::new().unwrap();
        let bytes = package_zip();
        let hash = sha256_hex(&bytes);
        let manager = Arc::new(manager(&temp, bytes, Duration::from_millis(20)));
        let mut events = manager.subscribe();

        let ticket = manager.begin(&foo(), &hash, "m1").unwrap();
        let runner = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.run(ticket).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.clear_active(), 1);

        let result = runner.await.unwrap();
        assert!(matches!(result, Err(TransferError::Abandoned(_))));
        assert!(!manager.store().has_artifact(&foo(), &hash));
        assert!(partial_files(&manager).is_empty());

        while let Ok(event) = events.try_recv() {
            assert!(!matches!(
                event,
                DownloadEvent::Failed { .. } | DownloadEvent::Completed { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_stale_transfer_cannot_touch_restarted_download() {
        let temp = TempDir::new().unwrap();
        let bytes = package_zip();
        let hash = sha256_hex(&bytes);
        let manager = Arc::new(DownloadManager::new(
            ArtifactStore::new(temp.path()),
            Arc::new(StallingTransport {
                bytes,
                stall: Duration::from_millis(300),
                fetches: Default::default(),
            }),
            Duration::from_secs(5),
        ));

        let stale = manager.begin(&foo(), &hash, "m1").unwrap();
        let stale_runner = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.run(stale).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.clear_active(), 1);
        let fresh = manager.begin(&foo(), &hash, "m1").unwrap();
        manager.run(fresh).await.unwrap();

        let result = stale_runner.await.unwrap();
        assert!(matches!(result, Err(TransferError::Abandoned(_))));

        let stored = std::fs::read(manager.store().artifact_path(&foo(), &hash)).unwrap();
        assert_eq!(sha256_hex(&stored), hash);
        assert!(partial_files(&manager).is_empty());
    }

    #[tokio::test]
    async fn test_transfer_rejects_hash_that_is_not_a_digest() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, package_zip(), Duration::ZERO);

        let result = manager.download(&foo(), "../../escaped", "m1").await;
        assert_eq!(result, Err(TransferError::Failed(DownloadErrorKind::FileNotFound)));
        assert!(!temp.path().join("escaped.zip").exists());
        assert!(manager.active_downloads().is_empty());
    }

    #[test]
    fn test_attempts_are_unique() {
        let active = ActiveDownloads::new();
        let first = active
            .try_register(DownloadKey::new(foo(), "a1"), "m1")
            .unwrap();
        active.clear_all();
        let second = active
            .try_register(DownloadKey::new(foo(), "a1"), "m1")
            .unwrap();
        assert_ne!(first.attempt(), second.attempt());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let active = ActiveDownloads::new();
        let ticket = active
            .try_register(DownloadKey::new(foo(), "h1"), "m1")
            .unwrap();

        assert!(active.update(&ticket, 100, Some(400)));
        assert!(active.update(&ticket, 50, None));
        let progress = active.snapshot().remove("foo:alice.os:h1").unwrap();
        assert_eq!(progress.downloaded, 100);
        assert_eq!(progress.total, Some(400));

        active.clear_all();
        assert!(!active.update(&ticket, 200, None));
        assert!(!active.finish(&ticket));
    }

    #[test]
    fn test_sideload_uses_content_hash() {
        let temp = TempDir::new().unwrap();
        let bytes = package_zip();
        let manager = manager(&temp, Vec::new(), Duration::ZERO);

        let (hash, _) = manager.add_local(&foo(), &bytes).unwrap();
        assert_eq!(hash, sha256_hex(&bytes));
        assert_eq!(manager.list_downloads(Some(&foo())).unwrap().len(), 1);
    }
}
