//! Notification bus
//!
//! Append-only, de-duplicated feed of user-facing events. Notifications are
//! never edited after creation; the only mutation is removal. Persistent
//! notifications describe unresolved problems (a failed auto-update, an
//! update waiting on approval) and cannot be dismissed: the controller removes
//! them with [`NotificationBus::resolve`] once the package installs cleanly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::DownloadErrorKind;
use crate::types::PackageId;

const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Non-persistent notifications kept before the oldest is dropped
const DEFAULT_TRANSIENT_LIMIT: usize = 200;

/// What a notification is about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Error,
    Success,
    Warning,
    Info,
    Download,
    Install,
    Update,
    /// A classified download/install failure
    Failure(DownloadErrorKind),
}

/// Package context attached to a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMetadata {
    pub package_id: PackageId,
    pub version_hash: Option<String>,
}

/// An action a front end can offer next to a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NotificationAction {
    /// Review the manifest and approve it, then install
    ReviewManifest {
        package_id: PackageId,
        version_hash: String,
    },
    /// Re-run the update flow
    RetryUpdate { package_id: PackageId },
    /// Reload the host so capability grants are re-read
    ReloadHost,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<NotificationMetadata>,
    pub actions: Option<Vec<NotificationAction>>,
    pub persistent: bool,
}

impl Notification {
    /// Start a notification; the bus assigns id and timestamp on emit
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            metadata: None,
            actions: None,
            persistent: false,
        }
    }

    pub fn for_package(mut self, package_id: &PackageId, version_hash: Option<&str>) -> Self {
        self.metadata = Some(NotificationMetadata {
            package_id: package_id.clone(),
            version_hash: version_hash.map(str::to_string),
        });
        self
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.actions.get_or_insert_with(Vec::new).push(action);
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn package_id(&self) -> Option<&PackageId> {
        self.metadata.as_ref().map(|m| &m.package_id)
    }

    fn same_event(&self, other: &Notification) -> bool {
        self.kind == other.kind
            && self.message == other.message
            && self.metadata == other.metadata
            && self.persistent == other.persistent
    }
}

/// Pushed to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    Emitted(Notification),
    Removed { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotificationError {
    #[error("notification {0} not found")]
    NotFound(String),

    #[error("notification {0} is persistent and can only be cleared by resolving it")]
    Persistent(String),
}

/// The bus itself; cheap to share behind an `Arc`
pub struct NotificationBus {
    /// Oldest first
    entries: Mutex<Vec<Notification>>,
    events: broadcast::Sender<BusEvent>,
    transient_limit: usize,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::with_transient_limit(DEFAULT_TRANSIENT_LIMIT)
    }

    /// Persistent notifications are never evicted and do not count towards `limit`
    pub fn with_transient_limit(limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: Mutex::new(Vec::new()),
            events,
            transient_limit: limit.max(1),
        }
    }

    /// Append a notification, returning its id.
    ///
    /// If an identical notification is still live, nothing is appended and the
    /// live id is returned.
    pub fn emit(&self, mut notification: Notification) -> String {
        let (emitted, evicted) = {
            let mut entries = self.lock();
            if let Some(existing) = entries.iter().find(|n| n.same_event(&notification)) {
                debug!(id = %existing.id, "Duplicate notification suppressed");
                return existing.id.clone();
            }
            notification.id = uuid::Uuid::new_v4().to_string();
            notification.timestamp = Utc::now();
            entries.push(notification.clone());
            (notification, self.evict_transient(&mut entries))
        };

        debug!(id = %emitted.id, kind = ?emitted.kind, "Notification emitted");
        // No subscribers is fine
        let _ = self.events.send(BusEvent::Emitted(emitted.clone()));
        for id in evicted {
            let _ = self.events.send(BusEvent::Removed { id });
        }
        emitted.id
    }

    /// Drop the oldest non-persistent entries beyond the limit
    fn evict_transient(&self, entries: &mut Vec<Notification>) -> Vec<String> {
        let transient = entries.iter().filter(|n| !n.persistent).count();
        let mut excess = transient.saturating_sub(self.transient_limit);
        let mut evicted = Vec::new();
        entries.retain(|n| {
            if excess > 0 && !n.persistent {
                excess -= 1;
                evicted.push(n.id.clone());
                return false;
            }
            true
        });
        evicted
    }

    /// Dismiss a non-persistent notification
    pub fn dismiss(&self, id: &str) -> Result<(), NotificationError> {
        {
            let mut entries = self.lock();
            let index = entries
                .iter()
                .position(|n| n.id == id)
                .ok_or_else(|| NotificationError::NotFound(id.to_string()))?;
            if entries[index].persistent {
                return Err(NotificationError::Persistent(id.to_string()));
            }
            entries.remove(index);
        }
        let _ = self.events.send(BusEvent::Removed { id: id.to_string() });
        Ok(())
    }

    /// Remove every persistent notification about `package_id`.
    ///
    /// Called by the controller when the resolving event (a successful install
    /// or an uninstall) happens. Returns how many were removed.
    pub fn resolve(&self, package_id: &PackageId) -> usize {
        let removed: Vec<String> = {
            let mut entries = self.lock();
            let mut removed = Vec::new();
            entries.retain(|n| {
                let resolves = n.persistent && n.package_id() == Some(package_id);
                if resolves {
                    removed.push(n.id.clone());
                }
                !resolves
            });
            removed
        };

        for id in &removed {
            let _ = self.events.send(BusEvent::Removed { id: id.clone() });
        }
        removed.len()
    }

    /// All live notifications, most recent first
    pub fn list(&self) -> Vec<Notification> {
        let entries = self.lock();
        entries.iter().rev().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        // A poisoned feed is still a valid list of notifications
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foo() -> PackageId {
        PackageId::new("foo", "alice.os")
    }

    #[test]
    fn test_list_is_most_recent_first() {
        let bus = NotificationBus::new();
        let first = bus.emit(Notification::new(NotificationKind::Info, "first"));
        let second = bus.emit(Notification::new(NotificationKind::Info, "second"));

        let ids: Vec<String> = bus.list().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![second, first]);
    }

    #[test]
    fn test_duplicates_are_suppressed() {
        let bus = NotificationBus::new();
        let a = bus.emit(Notification::new(NotificationKind::Warning, "disk low"));
        let b = bus.emit(Notification::new(NotificationKind::Warning, "disk low"));
        assert_eq!(a, b);
        assert_eq!(bus.list().len(), 1);
    }

    #[test]
    fn test_dismiss_non_persistent() {
        let bus = NotificationBus::new();
        let id = bus.emit(Notification::new(NotificationKind::Success, "installed"));
        bus.dismiss(&id).unwrap();
        assert!(bus.list().is_empty());
        assert_eq!(
            bus.dismiss(&id),
            Err(NotificationError::NotFound(id.clone()))
        );
    }

    #[test]
    fn test_persistent_cannot_be_dismissed_only_resolved() {
        let bus = NotificationBus::new();
        let id = bus.emit(
            Notification::new(
                NotificationKind::Failure(DownloadErrorKind::Offline),
                "auto-update failed",
            )
            .for_package(&foo(), Some("h2"))
            .persistent(),
        );

        assert_eq!(bus.dismiss(&id), Err(NotificationError::Persistent(id.clone())));
        assert_eq!(bus.list().len(), 1);

        assert_eq!(bus.resolve(&PackageId::new("bar", "alice.os")), 0);
        assert_eq!(bus.resolve(&foo()), 1);
        assert!(bus.list().is_empty());
    }

    #[test]
    fn test_resolve_leaves_non_persistent_entries() {
        let bus = NotificationBus::new();
        bus.emit(Notification::new(NotificationKind::Download, "downloaded").for_package(&foo(), None));
        bus.emit(
            Notification::new(NotificationKind::Update, "needs approval")
                .for_package(&foo(), None)
                .persistent(),
        );
        assert_eq!(bus.resolve(&foo()), 1);
        assert_eq!(bus.list().len(), 1);
        assert_eq!(bus.list()[0].kind, NotificationKind::Download);
    }

    #[tokio::test]
    async fn test_subscribers_see_emit_and_remove() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe();

        let id = bus.emit(Notification::new(NotificationKind::Info, "hello"));
        bus.dismiss(&id).unwrap();

        match rx.recv().await.unwrap() {
            BusEvent::Emitted(n) => assert_eq!(n.id, id),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            BusEvent::Removed { id: removed } => assert_eq!(removed, id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_oldest_transient_entries_are_evicted() {
        let bus = NotificationBus::with_transient_limit(3);
        let mut rx = bus.subscribe();
        let pinned = bus.emit(
            Notification::new(NotificationKind::Update, "needs approval")
                .for_package(&foo(), None)
                .persistent(),
        );
        let ids: Vec<String> = (0..10)
            .map(|i| bus.emit(Notification::new(NotificationKind::Info, format!("event {}", i))))
            .collect();

        let listed: Vec<String> = bus.list().into_iter().map(|n| n.id).collect();
        assert_eq!(
            listed,
            vec![ids[9].clone(), ids[8].clone(), ids[7].clone(), pinned.clone()]
        );

        let mut removed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BusEvent::Removed { id } = event {
                removed.push(id);
            }
        }
        assert_eq!(removed, ids[..7].to_vec());
    }
}
