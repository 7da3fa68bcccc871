//! Per-owner-kind controller bookkeeping
//!
//! Each owner kind handled by the automation engine has an entry holding the
//! handle dependent watches are registered through, the flags that govern
//! dependent watching, and the two sets of child kinds already watched.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use kube::core::GroupVersionKind;
use tokio::sync::mpsc;

use crate::discovery::parse_group_version;
use crate::watches::{ControllerHandle, QueueController, ReconcileRequest};
use crate::{Error, Result};

/// Lookup of controller entries by owner kind
pub trait ControllerMap: Send + Sync {
    fn get(&self, owner: &GroupVersionKind) -> Option<Arc<ControllerEntry>>;
}

/// Child kinds a controller already watches under one strategy.
///
/// `insert` is an atomic insert-if-absent, so concurrent registrations of
/// the same child kind cannot both win.
#[derive(Debug, Default)]
pub struct WatchSet {
    kinds: DashSet<GroupVersionKind>,
}

impl WatchSet {
    /// True when the kind was not yet present
    pub fn insert(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.insert(gvk.clone())
    }

    pub fn remove(&self, gvk: &GroupVersionKind) {
        self.kinds.remove(gvk);
    }

    pub fn contains(&self, gvk: &GroupVersionKind) -> bool {
        self.kinds.contains(gvk)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

/// Controller state for one owner kind
pub struct ControllerEntry {
    /// Registration mechanism for dependent watches
    pub controller: Arc<dyn ControllerHandle>,
    /// Children watched through their owner references
    pub owner_watches: WatchSet,
    /// Children watched through the primary resource annotations
    pub annotation_watches: WatchSet,
    pub watch_dependent_resources: bool,
    pub watch_cluster_scoped_resources: bool,
    /// Child kinds never to watch or cache
    pub blacklist: HashSet<GroupVersionKind>,
}

impl ControllerEntry {
    pub fn new(controller: Arc<dyn ControllerHandle>) -> Self {
        Self {
            controller,
            owner_watches: WatchSet::default(),
            annotation_watches: WatchSet::default(),
            watch_dependent_resources: true,
            watch_cluster_scoped_resources: false,
            blacklist: HashSet::new(),
        }
    }

    pub fn with_watch_dependent_resources(mut self, enabled: bool) -> Self {
        self.watch_dependent_resources = enabled;
        self
    }

    pub fn with_watch_cluster_scoped_resources(mut self, enabled: bool) -> Self {
        self.watch_cluster_scoped_resources = enabled;
        self
    }

    pub fn with_blacklist(mut self, blacklist: impl IntoIterator<Item = GroupVersionKind>) -> Self {
        self.blacklist = blacklist.into_iter().collect();
        self
    }

    pub fn is_blacklisted(&self, gvk: &GroupVersionKind) -> bool {
        self.blacklist.contains(gvk)
    }
}

/// [`ControllerMap`] held in memory and filled by the engine at startup
#[derive(Default)]
pub struct InMemoryControllerMap {
    entries: DashMap<GroupVersionKind, Arc<ControllerEntry>>,
}

impl InMemoryControllerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, owner: GroupVersionKind, entry: ControllerEntry) -> Arc<ControllerEntry> {
        let entry = Arc::new(entry);
        self.entries.insert(owner, entry.clone());
        entry
    }

    /// One entry per owner kind, all enqueueing onto `queue`
    pub fn queue_backed(
        owners: impl IntoIterator<Item = GroupVersionKind>,
        queue: mpsc::UnboundedSender<ReconcileRequest>,
    ) -> Self {
        let map = Self::new();
        let controller: Arc<dyn ControllerHandle> = Arc::new(QueueController::new(queue));
        for owner in owners {
            map.insert(owner, ControllerEntry::new(controller.clone()));
        }
        map
    }

    pub fn remove(&self, owner: &GroupVersionKind) -> Option<Arc<ControllerEntry>> {
        self.entries.remove(owner).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ControllerMap for InMemoryControllerMap {
    fn get(&self, owner: &GroupVersionKind) -> Option<Arc<ControllerEntry>> {
        self.entries.get(owner).map(|entry| entry.value().clone())
    }
}

/// Parse a comma separated list of owner kinds.
///
/// Each kind is `group/version/Kind`, or `version/Kind` for the core group.
pub fn parse_owner_kinds(value: &str) -> Result<Vec<GroupVersionKind>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (group_version, kind) = item
                .rsplit_once('/')
                .filter(|(gv, kind)| !gv.is_empty() && !kind.is_empty())
                .ok_or_else(|| Error::ConfigError(format!("invalid owner kind: {}", item)))?;
            let (group, version) = parse_group_version(group_version);
            Ok(GroupVersionKind::gvk(&group, &version, kind))
        })
        .collect()
}
