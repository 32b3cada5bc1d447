//! Fetching artifacts from mirrors

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::error::DownloadErrorKind;
use crate::mirror::NodeDirectory;
use crate::types::PackageId;

/// An open transfer: announced size plus a chunk stream
pub struct ArtifactStream {
    pub total: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, DownloadErrorKind>>,
}

#[async_trait]
pub trait ArtifactTransport: Send + Sync {
    /// Open `{version_hash}.zip` for `package_id` on `mirror`
    async fn fetch(
        &self,
        mirror: &str,
        package_id: &PackageId,
        version_hash: &str,
    ) -> Result<ArtifactStream, DownloadErrorKind>;
}

/// Pulls artifacts from `GET {mirror}/api/downloads/{package_id}/{hash}.zip`
pub struct HttpArtifactTransport {
    client: reqwest::Client,
    directory: NodeDirectory,
}

impl HttpArtifactTransport {
    pub fn new(directory: NodeDirectory) -> Self {
        Self {
            client: reqwest::Client::new(),
            directory,
        }
    }
}

fn classify(e: &reqwest::Error) -> DownloadErrorKind {
    if e.is_timeout() {
        DownloadErrorKind::Timeout
    } else {
        DownloadErrorKind::HttpClientError
    }
}

#[async_trait]
impl ArtifactTransport for HttpArtifactTransport {
    async fn fetch(
        &self,
        mirror: &str,
        package_id: &PackageId,
        version_hash: &str,
    ) -> Result<ArtifactStream, DownloadErrorKind> {
        let url = format!(
            "{}/api/downloads/{}/{}.zip",
            self.directory.url_for(mirror),
            package_id,
            version_hash
        );
        debug!(url = %url, "Requesting artifact");

        let response = self.client.get(&url).send().await.map_err(|e| classify(&e))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => return Err(DownloadErrorKind::FileNotFound),
            reqwest::StatusCode::FORBIDDEN => return Err(DownloadErrorKind::NotMirroring),
            status if !status.is_success() => return Err(DownloadErrorKind::HttpClientError),
            _ => {}
        }

        let total = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| classify(&e)))
            .boxed();
        Ok(ArtifactStream { total, chunks })
    }
}
