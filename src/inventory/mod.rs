//! Inventory / Cache Manager: a pool of per-GVK watchers feeding a
//! keyed object store, with a cheap snapshot handle for readers.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};

use crate::crd::{SyncConfigSpec, SyncProcess, SyncedGvk};
use crate::matcher::GroupVersionKind;

/// `(GVK, namespace, name)` — the storage key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub gvk: GroupVersionKind,
    pub namespace: Option<String>,
    pub name: String,
}

fn gvk_sort_key(gvk: &GroupVersionKind) -> (String, String, String) {
    (gvk.group.clone(), gvk.version.clone(), gvk.kind.clone())
}

impl PartialOrd for GroupVersionKind {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for GroupVersionKind {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        gvk_sort_key(self).cmp(&gvk_sort_key(other))
    }
}

/// A change event a watcher source produces: an ordered stream of
/// added/modified/deleted objects.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(ObjectKey),
    /// Marks the end of a watcher's initial list.
    InitialListComplete,
}

/// Internal store: a concurrent map keyed by `(GVK, namespace, name)`.
/// `DashMap` gives per-shard locking so writes to distinct keys never
/// contend, matching the "writes within a single event are serialized,
/// concurrent reads see at-least-one-event-ago state" requirement.
#[derive(Default)]
struct Store {
    objects: DashMap<ObjectKey, Value>,
}

/// A cheap, reference-counted read-only view over the current inventory
/// state (`Snapshot() -> SnapshotHandle`). Cloning is an `Arc` bump, not
/// a defensive copy.
#[derive(Clone)]
pub struct Snapshot {
    store: Arc<Store>,
}

impl Snapshot {
    fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// An empty snapshot, useful for evaluation paths that don't consult
    /// reference data (e.g. unit tests, or constraints with no referential
    /// lookups).
    pub fn empty() -> Self {
        Self { store: Arc::new(Store::default()) }
    }

    /// Lazy, finite iterator over every object of a given kind. May skip an
    /// object modified during iteration but never yields a value
    /// inconsistent with itself.
    pub fn list(&self, gvk: &GroupVersionKind) -> impl Iterator<Item = Value> + '_ {
        let gvk = gvk.clone();
        self.store
            .objects
            .iter()
            .filter(move |entry| entry.key().gvk == gvk)
            .map(|entry| entry.value().clone())
            .collect::<Vec<_>>()
            .into_iter()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Value> {
        self.store.objects.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.store.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.objects.is_empty()
    }
}

/// Process tags and namespace rules excluding an object from being stored
/// or surfaced for a given purpose.
#[derive(Debug, Clone, Default)]
struct ExclusionRules {
    excluded_namespaces: Vec<String>,
    excluded_processes: Vec<SyncProcess>,
}

impl ExclusionRules {
    fn excludes(&self, namespace: Option<&str>, process: SyncProcess) -> bool {
        if let Some(ns) = namespace
            && self.excluded_namespaces.iter().any(|p| crate::matcher::glob_match(p, ns))
        {
            return true;
        }
        self.excluded_processes
            .iter()
            .any(|p| *p == process || *p == SyncProcess::Star)
    }
}

/// The Cache Manager itself: owns the store plus the set of currently-synced
/// GVKs. Per-GVK watcher tasks are spawned by the caller (typically a
/// command entrypoint) and feed events in through `apply_event`; this type
/// holds no tokio handles of its own so it stays trivially testable.
pub struct Inventory {
    store: Arc<Store>,
    synced: DashMap<GroupVersionKind, ()>,
    exclusion: parking_lot::RwLock<ExclusionRules>,
}

impl Default for Inventory {
    fn default() -> Self {
        Self::new()
    }
}

impl Inventory {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Store::default()),
            synced: DashMap::new(),
            exclusion: parking_lot::RwLock::new(ExclusionRules::default()),
        }
    }

    /// Computes the add/remove diff against the currently-synced GVK set
    /// and updates exclusion rules. Never signals removal of a GVK an
    /// active Constraint still references — that check is the caller's
    /// responsibility (the constraint client owns that knowledge); this
    /// just reports the diff for the caller to act on.
    pub fn update_sync(&self, config: &SyncConfigSpec) -> SyncDiff {
        let wanted: Vec<GroupVersionKind> = config
            .sync_only
            .iter()
            .map(|g: &SyncedGvk| GroupVersionKind {
                group: g.group.clone(),
                version: g.version.clone(),
                kind: g.kind.clone(),
            })
            .collect();

        let mut to_add = Vec::new();
        for gvk in &wanted {
            if !self.synced.contains_key(gvk) {
                to_add.push(gvk.clone());
            }
        }
        let mut to_remove = Vec::new();
        for entry in self.synced.iter() {
            if !wanted.contains(entry.key()) {
                to_remove.push(entry.key().clone());
            }
        }

        for gvk in &to_add {
            self.synced.insert(gvk.clone(), ());
        }
        for gvk in &to_remove {
            self.synced.remove(gvk);
        }

        *self.exclusion.write() = ExclusionRules {
            excluded_namespaces: config.excluded_namespaces.clone(),
            excluded_processes: config.excluded_processes.clone(),
        };

        info!(added = to_add.len(), removed = to_remove.len(), "inventory sync config updated");
        SyncDiff { to_add, to_remove }
    }

    pub fn is_excluded(&self, namespace: Option<&str>, process: SyncProcess) -> bool {
        self.exclusion.read().excludes(namespace, process)
    }

    /// Applies one watcher event for `gvk` to the store. Objects
    /// from excluded namespaces are never stored: callers should
    /// check `is_excluded` before constructing the event's object, but this
    /// also re-checks on the stored object's own namespace as a backstop.
    pub fn apply_event(&self, gvk: &GroupVersionKind, event: WatchEvent) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let key = object_key(gvk, &obj);
                let namespace = key.namespace.as_deref();
                if self.is_excluded(namespace, SyncProcess::Sync) {
                    debug!(?key, "skipping excluded object");
                    return;
                }
                self.store.objects.insert(key, obj);
            }
            WatchEvent::Deleted(key) => {
                self.store.objects.remove(&key);
            }
            WatchEvent::InitialListComplete => {}
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(Arc::clone(&self.store))
    }

    pub fn synced_kinds(&self) -> Vec<GroupVersionKind> {
        self.synced.iter().map(|e| e.key().clone()).collect()
    }
}

/// The result of reconciling a sync configuration.
#[derive(Debug, Clone, Default)]
pub struct SyncDiff {
    pub to_add: Vec<GroupVersionKind>,
    pub to_remove: Vec<GroupVersionKind>,
}

fn object_key(gvk: &GroupVersionKind, obj: &Value) -> ObjectKey {
    let namespace = obj
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let name = obj
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ObjectKey { gvk: gvk.clone(), namespace, name }
}

/// Builds the `expected` counter map for the readiness tracker: one
/// entry per synced GVK plus every kind referenced by a Constraint's match.
pub fn expected_kinds(
    synced: &[GroupVersionKind],
    constraint_kinds: impl Iterator<Item = GroupVersionKind>,
) -> BTreeMap<GroupVersionKind, u32> {
    let mut expected: BTreeMap<GroupVersionKind, u32> =
        synced.iter().cloned().map(|k| (k, 1)).collect();
    for k in constraint_kinds {
        expected.entry(k).or_insert(1);
    }
    expected
}

impl std::fmt::Debug for Inventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inventory")
            .field("synced_kinds", &self.synced_kinds().len())
            .field("objects", &self.store.objects.len())
            .finish()
    }
}
