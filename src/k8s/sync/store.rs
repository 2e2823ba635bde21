use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use k8s_openapi::serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::k8s::resource::{QualifiedName, Resource};

/// Everything one subscription's consumers read: the keyed snapshots plus
/// load/error/filter/selection state. Snapshots handed out are clones whose
/// resources are `Arc`-shared, so they are never mutated behind a reader's
/// back.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub data: HashMap<QualifiedName, Arc<Resource>>,
    pub loaded: bool,
    pub load_error: Option<String>,
    pub filters: HashMap<String, Value>,
    pub selected: Option<QualifiedName>,
}

/// Full cache state: one entry per subscription key.
pub type CacheMap = HashMap<String, CacheEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// One `{type, object}` event off the live watch stream.
#[derive(Debug, Clone)]
pub struct WatchEventItem {
    pub kind: WatchEventKind,
    pub object: Arc<Resource>,
}

impl WatchEventItem {
    /// Parse a decoded watch frame. Events of unknown type are logged and
    /// dropped here so new server event kinds never break the reducer.
    #[must_use]
    pub fn from_frame(frame: &Value) -> Option<Self> {
        let kind = match frame.get("type").and_then(Value::as_str) {
            Some("ADDED") => WatchEventKind::Added,
            Some("MODIFIED") => WatchEventKind::Modified,
            Some("DELETED") => WatchEventKind::Deleted,
            Some(other) => {
                debug!(event_type = other, "ignoring watch event of unknown type");
                return None;
            }
            None => {
                warn!("discarding watch frame without a type field");
                return None;
            }
        };
        let object = frame.get("object").cloned()?;
        match k8s_openapi::serde_json::from_value::<Resource>(object) {
            Ok(resource) => Some(Self {
                kind,
                object: Arc::new(resource),
            }),
            Err(e) => {
                warn!(error = %e, "discarding watch event with undecodable object");
                None
            }
        }
    }
}

/// State transitions, keyed by subscription key.
#[derive(Debug, Clone)]
pub enum Action {
    /// Ensure an entry exists; a repeat subscribe is a no-op.
    BeginWatch { id: String },
    /// Remove the entry entirely.
    EndWatch { id: String },
    /// Set one named filter value; allowed at any load state.
    SetFilter {
        id: String,
        name: String,
        value: Value,
    },
    /// Mark (or clear) the consumer-selected row.
    Select {
        id: String,
        name: Option<QualifiedName>,
    },
    /// Reconciliation with a settled full list: upsert everything in
    /// `resources`, evict everything else.
    ListLoaded {
        id: String,
        resources: Vec<Arc<Resource>>,
    },
    /// Upsert a batch without evicting; used for intermediate pages and
    /// catch-up batches.
    BulkAdd {
        id: String,
        resources: Vec<Arc<Resource>>,
    },
    /// Apply live watch events in arrival order.
    WatchEvents {
        id: String,
        events: Vec<WatchEventItem>,
    },
    /// The watch connection reached open.
    Opened { id: String },
    /// A list run or the transport failed; data is deliberately kept.
    Errored { id: String, error: String },
}

/// Insert `incoming` unless the cached object is at least as recent.
/// Losing updates are dropped without touching the map, which also makes
/// replaying a duplicated event (after a reconnect, say) a no-op.
fn upsert_recent(data: &mut HashMap<QualifiedName, Arc<Resource>>, incoming: Arc<Resource>) {
    let qualified = incoming.qualified_name();
    match data.get(&qualified) {
        Some(current) if !incoming.more_recent_than(current) => {
            debug!(name = %qualified, "dropping stale update");
        }
        _ => {
            data.insert(qualified, incoming);
        }
    }
}

/// Pure transition function over the whole cache. Every action except
/// `BeginWatch` is a no-op for an absent entry; that is the guard that
/// keeps results landing after an unsubscribe from resurrecting state.
#[must_use]
pub fn reduce(mut state: CacheMap, action: Action) -> CacheMap {
    match action {
        Action::BeginWatch { id } => {
            state.entry(id).or_default();
        }
        Action::EndWatch { id } => {
            state.remove(&id);
        }
        Action::SetFilter { id, name, value } => {
            if let Some(entry) = state.get_mut(&id) {
                entry.filters.insert(name, value);
            }
        }
        Action::Select { id, name } => {
            if let Some(entry) = state.get_mut(&id) {
                entry.selected = name;
            }
        }
        Action::ListLoaded { id, resources } => {
            if let Some(entry) = state.get_mut(&id) {
                let mut next: HashMap<QualifiedName, Arc<Resource>> =
                    HashMap::with_capacity(resources.len());
                for incoming in resources {
                    let qualified = incoming.qualified_name();
                    match entry.data.get(&qualified) {
                        // A concurrently-arrived watch event may have left a
                        // newer snapshot than the list run saw; keep it.
                        Some(current) if !incoming.more_recent_than(current) => {
                            next.insert(qualified, Arc::clone(current));
                        }
                        _ => {
                            next.insert(qualified, incoming);
                        }
                    }
                }
                for (qualified, evicted) in &entry.data {
                    if !next.contains_key(qualified)
                        && evicted.metadata.deletion_timestamp.is_none()
                    {
                        // Assumed index drift; the next reconciliation
                        // self-heals, so this is a warning, not an error.
                        warn!(name = %qualified, "evicting object with no deletion timestamp");
                    }
                }
                entry.data = next;
                entry.loaded = true;
                entry.load_error = None;
            }
        }
        Action::BulkAdd { id, resources } => {
            if let Some(entry) = state.get_mut(&id) {
                for incoming in resources {
                    upsert_recent(&mut entry.data, incoming);
                }
            }
        }
        Action::WatchEvents { id, events } => {
            if let Some(entry) = state.get_mut(&id) {
                for event in events {
                    match event.kind {
                        WatchEventKind::Added | WatchEventKind::Modified => {
                            upsert_recent(&mut entry.data, event.object);
                        }
                        WatchEventKind::Deleted => {
                            entry.data.remove(&event.object.qualified_name());
                        }
                    }
                }
            }
        }
        Action::Opened { id } => {
            if let Some(entry) = state.get_mut(&id) {
                entry.loaded = true;
                entry.load_error = None;
            }
        }
        Action::Errored { id, error } => {
            if let Some(entry) = state.get_mut(&id) {
                // Stale data stays visible; consumers render the error
                // alongside it instead of a blank list.
                entry.load_error = Some(error);
            }
        }
    }
    state
}

// A poisoned lock means a dispatching task panicked; recover the guard.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-writer wrapper around the reducer. All mutation funnels through
/// [`dispatch`](Self::dispatch); readers take entry clones and can await the
/// epoch channel to learn that anything changed.
#[derive(Debug)]
pub struct SyncStore {
    state: Mutex<CacheMap>,
    epoch: watch::Sender<u64>,
}

impl Default for SyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore {
    #[must_use]
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            state: Mutex::new(CacheMap::new()),
            epoch,
        }
    }

    pub fn dispatch(&self, action: Action) {
        {
            let mut guard = lock(&self.state);
            let state = std::mem::take(&mut *guard);
            *guard = reduce(state, action);
        }
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Snapshot of one entry; `None` once unsubscribed (or never begun).
    #[must_use]
    pub fn entry(&self, id: &str) -> Option<CacheEntry> {
        lock(&self.state).get(id).cloned()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        lock(&self.state).contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.state).is_empty()
    }

    /// Receiver that observes a counter bumped on every dispatch.
    #[must_use]
    pub fn changed(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::serde_json::{from_value, json};

    const ID: &str = "Pod--ns1----l:--f:--250";

    fn pod(name: &str, rv: &str) -> Arc<Resource> {
        pod_with_uid(name, &format!("uid-{name}"), rv, "2024-01-01T00:00:00Z")
    }

    fn pod_with_uid(name: &str, uid: &str, rv: &str, created: &str) -> Arc<Resource> {
        Arc::new(
            from_value(json!({
                "kind": "Pod",
                "metadata": {
                    "name": name,
                    "namespace": "ns1",
                    "uid": uid,
                    "resourceVersion": rv,
                    "creationTimestamp": created,
                },
            }))
            .unwrap(),
        )
    }

    fn begun() -> CacheMap {
        reduce(CacheMap::new(), Action::BeginWatch { id: ID.into() })
    }

    fn names(state: &CacheMap) -> Vec<String> {
        let mut names: Vec<String> = state[ID].data.keys().map(ToString::to_string).collect();
        names.sort();
        names
    }

    #[test]
    fn begin_watch_is_idempotent() {
        let state = begun();
        let state = reduce(
            state,
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod("a", "1")],
            },
        );
        let again = reduce(state.clone(), Action::BeginWatch { id: ID.into() });
        assert_eq!(names(&again), names(&state));
        assert!(!again[ID].loaded);
    }

    #[test]
    fn end_watch_removes_the_entry() {
        let state = reduce(begun(), Action::EndWatch { id: ID.into() });
        assert!(state.is_empty());
    }

    #[test]
    fn actions_on_an_absent_entry_are_no_ops() {
        let state = reduce(
            CacheMap::new(),
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod("a", "1")],
            },
        );
        assert!(state.is_empty());
        let state = reduce(
            CacheMap::new(),
            Action::Errored {
                id: ID.into(),
                error: "late".into(),
            },
        );
        assert!(state.is_empty());
    }

    #[test]
    fn list_loaded_replaces_and_marks_loaded() {
        let state = reduce(
            begun(),
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod("a", "1"), pod("b", "2")],
            },
        );
        let state = reduce(
            state,
            Action::ListLoaded {
                id: ID.into(),
                resources: vec![pod("b", "3"), pod("c", "1")],
            },
        );
        assert_eq!(names(&state), vec!["ns1/b", "ns1/c"]);
        assert!(state[ID].loaded);
        assert!(state[ID].load_error.is_none());
    }

    #[test]
    fn list_loaded_keeps_newer_cached_snapshots() {
        // A watch event raced ahead of the list run; reconciliation must not
        // roll the object back.
        let state = reduce(
            begun(),
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod("a", "9")],
            },
        );
        let state = reduce(
            state,
            Action::ListLoaded {
                id: ID.into(),
                resources: vec![pod("a", "4")],
            },
        );
        let entry = &state[ID];
        let cached = entry.data.values().next().unwrap();
        assert_eq!(cached.resource_version(), 9);
    }

    #[test]
    fn empty_list_loaded_is_a_valid_terminal_state() {
        let state = reduce(
            begun(),
            Action::ListLoaded {
                id: ID.into(),
                resources: vec![],
            },
        );
        assert!(state[ID].loaded);
        assert!(state[ID].data.is_empty());
    }

    #[test]
    fn bulk_add_never_evicts() {
        let state = reduce(
            begun(),
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod("a", "1")],
            },
        );
        let state = reduce(
            state,
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod("b", "1")],
            },
        );
        assert_eq!(names(&state), vec!["ns1/a", "ns1/b"]);
        assert!(!state[ID].loaded);
    }

    #[test]
    fn resource_versions_are_monotonic_under_mixed_updates() {
        let mut state = begun();
        let versions = ["3", "1", "5", "2", "4"];
        for rv in versions {
            state = reduce(
                state,
                Action::BulkAdd {
                    id: ID.into(),
                    resources: vec![pod_with_uid("a", "u1", rv, "2024-01-01T00:00:00Z")],
                },
            );
            let cached = state[ID].data.values().next().unwrap().resource_version();
            assert!(cached >= rv.parse().unwrap());
        }
        let cached = state[ID].data.values().next().unwrap();
        assert_eq!(cached.resource_version(), 5);
    }

    #[test]
    fn uid_reuse_prefers_later_creation() {
        let state = reduce(
            begun(),
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod_with_uid("a", "u1", "500", "2024-01-01T00:00:00Z")],
            },
        );
        let state = reduce(
            state,
            Action::WatchEvents {
                id: ID.into(),
                events: vec![WatchEventItem {
                    kind: WatchEventKind::Added,
                    object: pod_with_uid("a", "u2", "7", "2024-06-01T00:00:00Z"),
                }],
            },
        );
        let cached = state[ID].data.values().next().unwrap();
        assert_eq!(cached.metadata.uid.as_deref(), Some("u2"));
    }

    #[test]
    fn stale_watch_event_is_dropped() {
        let state = reduce(
            begun(),
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod_with_uid("a", "u1", "5", "2024-01-01T00:00:00Z")],
            },
        );
        let next = reduce(
            state.clone(),
            Action::WatchEvents {
                id: ID.into(),
                events: vec![WatchEventItem {
                    kind: WatchEventKind::Modified,
                    object: pod_with_uid("a", "u1", "3", "2024-01-01T00:00:00Z"),
                }],
            },
        );
        let cached = next[ID].data.values().next().unwrap();
        assert_eq!(cached.resource_version(), 5);
    }

    #[test]
    fn delete_event_removes_unconditionally() {
        let state = reduce(
            begun(),
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod("a", "5"), pod("b", "5")],
            },
        );
        // The delete notification carries an older snapshot of the object;
        // removal must not be subject to the recency rule.
        let state = reduce(
            state,
            Action::WatchEvents {
                id: ID.into(),
                events: vec![WatchEventItem {
                    kind: WatchEventKind::Deleted,
                    object: pod("a", "2"),
                }],
            },
        );
        assert_eq!(names(&state), vec!["ns1/b"]);
    }

    #[test]
    fn reapplying_events_is_idempotent() {
        let events = vec![
            WatchEventItem {
                kind: WatchEventKind::Added,
                object: pod("a", "4"),
            },
            WatchEventItem {
                kind: WatchEventKind::Deleted,
                object: pod("b", "1"),
            },
        ];
        let state = reduce(
            begun(),
            Action::BulkAdd {
                id: ID.into(),
                resources: vec![pod("b", "1")],
            },
        );
        let once = reduce(
            state,
            Action::WatchEvents {
                id: ID.into(),
                events: events.clone(),
            },
        );
        let twice = reduce(
            once.clone(),
            Action::WatchEvents {
                id: ID.into(),
                events,
            },
        );
        assert_eq!(names(&once), names(&twice));
        assert_eq!(once[ID].loaded, twice[ID].loaded);
    }

    #[test]
    fn errored_keeps_data_and_loaded_flag() {
        let state = reduce(
            begun(),
            Action::ListLoaded {
                id: ID.into(),
                resources: vec![pod("a", "1")],
            },
        );
        let state = reduce(
            state,
            Action::Errored {
                id: ID.into(),
                error: "connection reset".into(),
            },
        );
        let entry = &state[ID];
        assert!(entry.loaded);
        assert_eq!(entry.load_error.as_deref(), Some("connection reset"));
        assert_eq!(entry.data.len(), 1);
    }

    #[test]
    fn opened_marks_loaded_and_clears_error() {
        let state = reduce(
            begun(),
            Action::Errored {
                id: ID.into(),
                error: "boom".into(),
            },
        );
        let state = reduce(state, Action::Opened { id: ID.into() });
        assert!(state[ID].loaded);
        assert!(state[ID].load_error.is_none());
    }

    #[test]
    fn filters_and_selection_are_independent_of_load_state() {
        let state = reduce(
            begun(),
            Action::SetFilter {
                id: ID.into(),
                name: "phase".into(),
                value: json!("Running"),
            },
        );
        let state = reduce(
            state,
            Action::Select {
                id: ID.into(),
                name: Some(QualifiedName::namespaced("ns1", "a")),
            },
        );
        let entry = &state[ID];
        assert!(!entry.loaded);
        assert_eq!(entry.filters["phase"], json!("Running"));
        assert_eq!(entry.selected, Some(QualifiedName::namespaced("ns1", "a")));
    }

    #[test]
    fn unknown_frame_types_are_ignored() {
        assert!(WatchEventItem::from_frame(&json!({
            "type": "BOOKMARK",
            "object": {"metadata": {"resourceVersion": "12"}},
        }))
        .is_none());
        assert!(WatchEventItem::from_frame(&json!({"object": {}})).is_none());
        assert!(
            WatchEventItem::from_frame(&json!({
                "type": "ADDED",
                "object": {"metadata": {"name": "a"}},
            }))
            .is_some()
        );
    }

    #[tokio::test]
    async fn store_dispatch_bumps_the_epoch() {
        let store = SyncStore::new();
        let mut changed = store.changed();
        store.dispatch(Action::BeginWatch { id: ID.into() });
        changed.changed().await.unwrap();
        assert!(store.contains(ID));
        assert!(store.entry(ID).is_some());
        store.dispatch(Action::EndWatch { id: ID.into() });
        assert!(store.entry(ID).is_none());
    }
}
