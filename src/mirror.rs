//! Mirror selection
//!
//! Probes every candidate concurrently and picks the first one, in candidate
//! order, that reported online. Completion order never matters, so the same
//! probe results always give the same mirror. Selections are not cached: a
//! mirror can drop between attempts, so every attempt re-selects.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::MirrorConfig;
use crate::error::DownloadErrorKind;
use crate::types::{MirrorProbeResult, PackageId};

/// Liveness check for one node
#[async_trait]
pub trait MirrorProber: Send + Sync {
    async fn probe(&self, node: &str) -> MirrorProbeResult;
}

/// Outcome of a successful selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorSelection {
    pub mirror: String,
    pub probes: Vec<MirrorProbeResult>,
}

pub struct MirrorSelector {
    prober: Arc<dyn MirrorProber>,
    probe_timeout: Duration,
}

impl MirrorSelector {
    pub fn new(prober: Arc<dyn MirrorProber>, probe_timeout: Duration) -> Self {
        Self {
            prober,
            probe_timeout,
        }
    }

    /// Probe all candidates concurrently; results come back in candidate order
    pub async fn probe_all(&self, candidates: &[String]) -> Vec<MirrorProbeResult> {
        let probes = candidates.iter().map(|node| async move {
            match tokio::time::timeout(self.probe_timeout, self.prober.probe(node)).await {
                Ok(result) => result,
                Err(_) => MirrorProbeResult {
                    node: node.clone(),
                    is_online: false,
                    error: Some("probe timed out".to_string()),
                },
            }
        });
        join_all(probes).await
    }

    /// Select a mirror for `package_id` from `candidates`
    pub async fn select(
        &self,
        package_id: &PackageId,
        candidates: &[String],
    ) -> Result<MirrorSelection, DownloadErrorKind> {
        self.select_excluding(package_id, candidates, &[]).await
    }

    /// Select a mirror, skipping nodes that already failed this download
    pub async fn select_excluding(
        &self,
        package_id: &PackageId,
        candidates: &[String],
        excluded: &[String],
    ) -> Result<MirrorSelection, DownloadErrorKind> {
        let remaining: Vec<String> = candidates
            .iter()
            .filter(|c| !excluded.contains(c))
            .cloned()
            .collect();

        if remaining.is_empty() {
            warn!(package = %package_id, "No mirror candidates left");
            return Err(DownloadErrorKind::Offline);
        }

        let probes = self.probe_all(&remaining).await;
        for probe in &probes {
            if let Some(error) = &probe.error {
                debug!(package = %package_id, node = %probe.node, error = %error, "Mirror probe error");
            }
        }

        match probes.iter().find(|p| p.is_online) {
            Some(winner) => {
                info!(package = %package_id, mirror = %winner.node, "Selected mirror");
                Ok(MirrorSelection {
                    mirror: winner.node.clone(),
                    probes: probes.clone(),
                })
            }
            None => {
                warn!(
                    package = %package_id,
                    candidates = remaining.len(),
                    "No mirror online"
                );
                Err(DownloadErrorKind::Offline)
            }
        }
    }
}

/// Maps node names to the base URL their app store answers on
#[derive(Debug, Clone)]
pub struct NodeDirectory {
    url_template: String,
    overrides: BTreeMap<String, String>,
}

impl NodeDirectory {
    pub fn new(url_template: impl Into<String>, overrides: BTreeMap<String, String>) -> Self {
        Self {
            url_template: url_template.into(),
            overrides,
        }
    }

    pub fn from_config(config: &MirrorConfig) -> Self {
        Self::new(config.url_template.clone(), config.nodes.clone())
    }

    pub fn url_for(&self, node: &str) -> String {
        let url = match self.overrides.get(node) {
            Some(url) => url.clone(),
            None => self.url_template.replace("{node}", node),
        };
        url.trim_end_matches('/').to_string()
    }
}

/// Probes `GET {node}/health`
pub struct HttpMirrorProber {
    client: reqwest::Client,
    directory: NodeDirectory,
    timeout: Duration,
}

impl HttpMirrorProber {
    pub fn new(directory: NodeDirectory, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            directory,
            timeout,
        }
    }
}

#[async_trait]
impl MirrorProber for HttpMirrorProber {
    async fn probe(&self, node: &str) -> MirrorProbeResult {
        let url = format!("{}/health", self.directory.url_for(node));
        match self.client.get(&url).timeout(self.timeout).send().await {
            Ok(response) if response.status().is_success() => MirrorProbeResult {
                node: node.to_string(),
                is_online: true,
                error: None,
            },
            Ok(response) => MirrorProbeResult {
                node: node.to_string(),
                is_online: false,
                error: Some(format!("HTTP {}", response.status())),
            },
            // Unreachable is plain offline, not an error
            Err(e) => {
                debug!(node = %node, error = %e, "Mirror unreachable");
                MirrorProbeResult {
                    node: node.to_string(),
                    is_online: false,
                    error: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Online nodes answer after their configured delay
    struct DelayedProber {
        online: Vec<(&'static str, u64)>,
        failing: Vec<&'static str>,
    }

    #[async_trait]
    impl MirrorProber for DelayedProber {
        async fn probe(&self, node: &str) -> MirrorProbeResult {
            if self.failing.contains(&node) {
                return MirrorProbeResult {
                    node: node.to_string(),
                    is_online: false,
                    error: Some("boom".to_string()),
                };
            }
            match self.online.iter().find(|(n, _)| *n == node) {
                Some((_, delay_ms)) => {
                    tokio::time::sleep(Duration::from_millis(*delay_ms)).await;
                    MirrorProbeResult {
                        node: node.to_string(),
                        is_online: true,
                        error: None,
                    }
                }
                None => MirrorProbeResult {
                    node: node.to_string(),
                    is_online: false,
                    error: None,
                },
            }
        }
    }

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn pkg() -> PackageId {
        PackageId::new("foo", "alice.os")
    }

    #[tokio::test]
    async fn test_selects_first_online_in_candidate_order() {
        // m3 answers long before m2, m2 still wins
        let prober = DelayedProber {
            online: vec![("m2", 80), ("m3", 1)],
            failing: vec![],
        };
        let selector = MirrorSelector::new(Arc::new(prober), Duration::from_secs(2));

        let selection = selector
            .select(&pkg(), &nodes(&["m1", "m2", "m3"]))
            .await
            .unwrap();
        assert_eq!(selection.mirror, "m2");
        assert_eq!(selection.probes.len(), 3);
        assert!(!selection.probes[0].is_online);
    }

    #[tokio::test]
    async fn test_erroring_candidate_does_not_disqualify_others() {
        let prober = DelayedProber {
            online: vec![("m2", 0)],
            failing: vec!["m1"],
        };
        let selector = MirrorSelector::new(Arc::new(prober), Duration::from_secs(1));

        let selection = selector.select(&pkg(), &nodes(&["m1", "m2"])).await.unwrap();
        assert_eq!(selection.mirror, "m2");
        assert_eq!(selection.probes[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_all_offline_or_slow_is_offline() {
        let prober = DelayedProber {
            online: vec![("slow", 5_000)],
            failing: vec![],
        };
        let selector = MirrorSelector::new(Arc::new(prober), Duration::from_millis(50));

        let result = selector.select(&pkg(), &nodes(&["m1", "slow"])).await;
        assert_eq!(result, Err(DownloadErrorKind::Offline));
    }

    #[tokio::test]
    async fn test_excluded_mirrors_are_skipped() {
        let prober = DelayedProber {
            online: vec![("m1", 0), ("m2", 0)],
            failing: vec![],
        };
        let selector = MirrorSelector::new(Arc::new(prober), Duration::from_secs(1));

        let selection = selector
            .select_excluding(&pkg(), &nodes(&["m1", "m2"]), &nodes(&["m1"]))
            .await
            .unwrap();
        assert_eq!(selection.mirror, "m2");

        let none_left = selector
            .select_excluding(&pkg(), &nodes(&["m1"]), &nodes(&["m1"]))
            .await;
        assert_eq!(none_left, Err(DownloadErrorKind::Offline));
    }

    #[test]
    fn test_node_directory_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("local.os".to_string(), "http://127.0.0.1:9000/".to_string());
        let directory = NodeDirectory::new("https://{node}", overrides);

        assert_eq!(directory.url_for("alice.os"), "https://alice.os");
        assert_eq!(directory.url_for("local.os"), "http://127.0.0.1:9000");
    }
}
