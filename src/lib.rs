//! elohim-app-store: package distribution and install engine for Elohim nodes
//!
//! Tracks the on-chain registry of installable packages, finds peer mirrors
//! serving their content, downloads and verifies artifacts against the
//! published content hash, gates installs behind capability review and keeps
//! per-package update state (including silent auto-update).
//!
//! ```text
//! Controller ──► Registry ──► Mirror Selector ──► Download Manager ──► Manifest Gate ──► Installer
//!     │                                                                                   │
//!     └──────────────────────────────► Notification Bus ◄──────────────────────────────────┘
//! ```
//!
//! The [`controller::AppStore`] owns every table; front ends drive it through
//! [`api::StoreRequest`] or the HTTP routes in [`api`].

pub mod api;
pub mod config;
pub mod controller;
pub mod digest;
pub mod download;
pub mod error;
pub mod installer;
pub mod manifest;
pub mod mirror;
pub mod notifications;
pub mod registry;
pub mod state;
pub mod types;
pub mod version;

pub use controller::AppStore;
pub use error::{DownloadErrorKind, StoreError};
pub use types::PackageId;
