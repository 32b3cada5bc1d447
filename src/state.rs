//! Persisted store state
//!
//! Everything the controller must remember across restarts lives in one JSON
//! document, rewritten atomically (temp file, then rename) after each change.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::manifest::ApprovalRecord;
use crate::types::{PackageId, PackageState, Updates};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub packages: BTreeMap<PackageId, PackageState>,
    #[serde(default)]
    pub updates: Updates,
    #[serde(default)]
    pub auto_update: BTreeSet<PackageId>,
    #[serde(default)]
    pub approvals: Vec<ApprovalRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt state file: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load saved state; a missing file is an empty store
    pub fn load(&self) -> Result<StoreState, StateError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No saved state, starting empty");
                return Ok(StoreState::default());
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, state: &StoreState) -> Result<(), StateError> {
        let io_err = |source: std::io::Error| StateError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!(path = %self.path.display(), packages = state.packages.len(), "State saved");
        Ok(())
    }
}
