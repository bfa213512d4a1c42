//! Presence: "who is online" for a channel.
//!
//! A [`Presence`] listens on its channel for a full-state event
//! (`presence_state`) and incremental diffs (`presence_diff`) and maintains
//! a map of key -> [`PresenceEntry`]. Each entry holds one [`PresenceMeta`]
//! per connection; metas are identified by `phx_ref`.
//!
//! A full sync never re-announces metas whose refs are already known, so a
//! reconnect that replays the same server state fires no join events.
//!
//! State is mutated under one lock per event; join/leave/sync observers run
//! after the lock is released, in the order the changes were applied.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channel::Channel;
use crate::constants::{PRESENCE_DIFF_EVENT, PRESENCE_STATE_EVENT};
use crate::observers::{lock, ObserverId, Observers};

/// One connection of a presence key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    /// Unique per-connection ref.
    pub phx_ref: String,
    /// Ref this meta replaced, for updated presences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phx_ref_prev: Option<String>,
    /// Application fields (`online_at`, `device`, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// All connections of one key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// Connection metas, oldest first.
    pub metas: Vec<PresenceMeta>,
}

impl PresenceEntry {
    fn refs(&self) -> HashSet<&str> {
        self.metas.iter().map(|meta| meta.phx_ref.as_str()).collect()
    }
}

/// Presence state keyed by logical identity.
pub type PresenceState = BTreeMap<String, PresenceEntry>;

/// Incremental update from the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Keys gaining connections.
    #[serde(default)]
    pub joins: PresenceState,
    /// Keys losing connections.
    #[serde(default)]
    pub leaves: PresenceState,
}

/// A key gained connections.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceJoin {
    /// Presence key.
    pub key: String,
    /// Entry before the join; `None` if the key was offline.
    pub previous: Option<PresenceEntry>,
    /// Only the metas that were added.
    pub joined: PresenceEntry,
}

/// A key lost connections.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceLeave {
    /// Presence key.
    pub key: String,
    /// Entry before the leave.
    pub previous: PresenceEntry,
    /// The leaving entry as reported.
    pub left: PresenceEntry,
}

/// One change produced by a sync or diff.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    /// See [`PresenceJoin`].
    Join(PresenceJoin),
    /// See [`PresenceLeave`].
    Leave(PresenceLeave),
}

/// Merge `incoming` into the entry for `key`, keeping only metas with unseen
/// refs. Returns the join to report, if anything was added.
fn merge_join(state: &mut PresenceState, key: String, incoming: PresenceEntry) -> Option<PresenceJoin> {
    match state.get_mut(&key) {
        None => {
            if incoming.metas.is_empty() {
                return None;
            }
            state.insert(key.clone(), incoming.clone());
            Some(PresenceJoin {
                key,
                previous: None,
                joined: incoming,
            })
        }
        Some(existing) => {
            let known = existing.refs();
            let added: Vec<PresenceMeta> = incoming
                .metas
                .into_iter()
                .filter(|meta| !known.contains(meta.phx_ref.as_str()))
                .collect();
            if added.is_empty() {
                return None;
            }
            let previous = existing.clone();
            existing.metas.extend(added.iter().cloned());
            Some(PresenceJoin {
                key,
                previous: Some(previous),
                joined: PresenceEntry { metas: added },
            })
        }
    }
}

/// Replace local state with the server's full state.
///
/// New keys join, known keys join only with metas whose refs are new, and
/// keys the server no longer lists leave.
pub fn sync_state(state: &mut PresenceState, server: PresenceState) -> Vec<PresenceChange> {
    let mut changes = Vec::new();

    let removed: Vec<String> = state
        .keys()
        .filter(|key| !server.contains_key(*key))
        .cloned()
        .collect();

    let (fresh, known): (Vec<_>, Vec<_>) = server
        .into_iter()
        .partition(|(key, _)| !state.contains_key(key));
    for (key, entry) in fresh.into_iter().chain(known) {
        if let Some(join) = merge_join(state, key, entry) {
            changes.push(PresenceChange::Join(join));
        }
    }

    for key in removed {
        if let Some(entry) = state.remove(&key) {
            changes.push(PresenceChange::Leave(PresenceLeave {
                key,
                previous: entry.clone(),
                left: entry,
            }));
        }
    }

    changes
}

/// Apply an incremental diff: joins first, then leaves.
///
/// A leave removes only the metas whose refs it lists; the key disappears
/// once its last meta is gone. Leaves for unknown keys are ignored.
pub fn sync_diff(state: &mut PresenceState, diff: PresenceDiff) -> Vec<PresenceChange> {
    let mut changes = Vec::new();

    for (key, entry) in diff.joins {
        if let Some(join) = merge_join(state, key, entry) {
            changes.push(PresenceChange::Join(join));
        }
    }

    for (key, left) in diff.leaves {
        let Some(existing) = state.get_mut(&key) else {
            log::debug!("[Presence] Leave for unknown key {}", key);
            continue;
        };
        let previous = existing.clone();
        let leaving = left.refs();
        existing
            .metas
            .retain(|meta| !leaving.contains(meta.phx_ref.as_str()));
        if existing.metas.is_empty() {
            state.remove(&key);
        }
        changes.push(PresenceChange::Leave(PresenceLeave {
            key,
            previous,
            left,
        }));
    }

    changes
}

struct PresenceInner {
    state: Mutex<PresenceState>,
    joins: Observers<PresenceJoin>,
    leaves: Observers<PresenceLeave>,
    syncs: Observers<PresenceState>,
}

impl PresenceInner {
    fn apply(&self, mutate: impl FnOnce(&mut PresenceState) -> Vec<PresenceChange>) {
        let (changes, snapshot) = {
            let mut state = lock(&self.state);
            let changes = mutate(&mut state);
            (changes, state.clone())
        };

        for change in &changes {
            match change {
                PresenceChange::Join(join) => {
                    log::debug!("[Presence] Join {} (+{})", join.key, join.joined.metas.len());
                    self.joins.notify(join);
                }
                PresenceChange::Leave(leave) => {
                    log::debug!("[Presence] Leave {} (-{})", leave.key, leave.left.metas.len());
                    self.leaves.notify(leave);
                }
            }
        }
        self.syncs.notify(&snapshot);
    }

    fn handle_state(&self, payload: &Value) {
        match serde_json::from_value::<PresenceState>(payload.clone()) {
            Ok(server) => self.apply(|state| sync_state(state, server)),
            Err(e) => log::warn!("[Presence] Ignoring malformed state: {}", e),
        }
    }

    fn handle_diff(&self, payload: &Value) {
        match serde_json::from_value::<PresenceDiff>(payload.clone()) {
            Ok(diff) => self.apply(|state| sync_diff(state, diff)),
            Err(e) => log::warn!("[Presence] Ignoring malformed diff: {}", e),
        }
    }
}

/// Event names a [`Presence`] listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvents {
    /// Full-state event name.
    pub state: String,
    /// Diff event name.
    pub diff: String,
}

impl Default for PresenceEvents {
    fn default() -> Self {
        Self {
            state: PRESENCE_STATE_EVENT.to_string(),
            diff: PRESENCE_DIFF_EVENT.to_string(),
        }
    }
}

/// Presence tracker bound to one channel.
///
/// Dropping it (or calling [`Presence::dispose`]) unregisters its channel
/// callbacks.
pub struct Presence {
    inner: Arc<PresenceInner>,
    channel: Channel,
    events: PresenceEvents,
    bindings: Mutex<Option<(ObserverId, ObserverId)>>,
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presence")
            .field("topic", &self.channel.topic())
            .field("events", &self.events)
            .field("keys", &lock(&self.inner.state).len())
            .finish()
    }
}

impl Presence {
    /// Track presence on `channel` using the default event names.
    pub fn new(channel: &Channel) -> Self {
        Self::with_events(channel, PresenceEvents::default())
    }

    /// Track presence on `channel` using custom event names.
    pub fn with_events(channel: &Channel, events: PresenceEvents) -> Self {
        let inner = Arc::new(PresenceInner {
            state: Mutex::new(PresenceState::new()),
            joins: Observers::new("presence_join"),
            leaves: Observers::new("presence_leave"),
            syncs: Observers::new("presence_sync"),
        });

        let on_state = Arc::clone(&inner);
        let state_id = channel.on(&events.state, move |payload| on_state.handle_state(payload));
        let on_diff = Arc::clone(&inner);
        let diff_id = channel.on(&events.diff, move |payload| on_diff.handle_diff(payload));

        Self {
            inner,
            channel: channel.clone(),
            events,
            bindings: Mutex::new(Some((state_id, diff_id))),
        }
    }

    /// Observe keys gaining connections.
    pub fn on_join(&self, callback: impl Fn(&PresenceJoin) + Send + Sync + 'static) -> ObserverId {
        self.inner.joins.register(callback)
    }

    /// Observe keys losing connections.
    pub fn on_leave(&self, callback: impl Fn(&PresenceLeave) + Send + Sync + 'static) -> ObserverId {
        self.inner.leaves.register(callback)
    }

    /// Observe the full state after every sync or diff.
    pub fn on_sync(&self, callback: impl Fn(&PresenceState) + Send + Sync + 'static) -> ObserverId {
        self.inner.syncs.register(callback)
    }

    /// Remove a join, leave or sync observer.
    pub fn off(&self, id: ObserverId) -> bool {
        self.inner.joins.unregister(id)
            || self.inner.leaves.unregister(id)
            || self.inner.syncs.unregister(id)
    }

    /// Keys with at least one connection, sorted.
    pub fn online_keys(&self) -> Vec<String> {
        lock(&self.inner.state).keys().cloned().collect()
    }

    /// Number of connections for `key` (0 if offline).
    pub fn connection_count(&self, key: &str) -> usize {
        lock(&self.inner.state)
            .get(key)
            .map_or(0, |entry| entry.metas.len())
    }

    /// Entry for `key`, if online.
    pub fn get(&self, key: &str) -> Option<PresenceEntry> {
        lock(&self.inner.state).get(key).cloned()
    }

    /// Snapshot of the whole state.
    pub fn list(&self) -> PresenceState {
        lock(&self.inner.state).clone()
    }

    /// Map every entry through `chooser`, in key order.
    pub fn list_by<T>(&self, mut chooser: impl FnMut(&str, &PresenceEntry) -> T) -> Vec<T> {
        lock(&self.inner.state)
            .iter()
            .map(|(key, entry)| chooser(key.as_str(), entry))
            .collect()
    }

    /// Channel this tracker is bound to.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Stop listening on the channel. Further presence events are ignored;
    /// the last state remains readable.
    pub fn dispose(&self) {
        if let Some((state_id, diff_id)) = lock(&self.bindings).take() {
            self.channel.off(&self.events.state, state_id);
            self.channel.off(&self.events.diff, diff_id);
            log::debug!("[Presence] Disposed for {}", self.channel.topic());
        }
    }
}

impl Drop for Presence {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(phx_ref: &str) -> PresenceMeta {
        PresenceMeta {
            phx_ref: phx_ref.to_string(),
            phx_ref_prev: None,
            fields: Map::new(),
        }
    }

    fn entry(refs: &[&str]) -> PresenceEntry {
        PresenceEntry {
            metas: refs.iter().map(|r| meta(r)).collect(),
        }
    }

    fn state(entries: &[(&str, &[&str])]) -> PresenceState {
        entries
            .iter()
            .map(|(key, refs)| ((*key).to_string(), entry(refs)))
            .collect()
    }

    fn keys_of(changes: &[PresenceChange]) -> Vec<String> {
        changes
            .iter()
            .map(|change| match change {
                PresenceChange::Join(j) => format!("+{}", j.key),
                PresenceChange::Leave(l) => format!("-{}", l.key),
            })
            .collect()
    }

    #[test]
    fn test_sync_from_empty_joins_everyone() {
        let mut local = PresenceState::new();
        let changes = sync_state(&mut local, state(&[("a", &["1"]), ("b", &["2", "3"])]));
        assert_eq!(keys_of(&changes), vec!["+a", "+b"]);
        assert_eq!(local["b"].metas.len(), 2);
        assert!(matches!(&changes[0], PresenceChange::Join(j) if j.previous.is_none()));
    }

    #[test]
    fn test_sync_replaces_membership() {
        let mut local = state(&[("a", &["1"]), ("b", &["2"])]);
        let changes = sync_state(&mut local, state(&[("b", &["2"]), ("c", &["3"])]));

        assert_eq!(keys_of(&changes), vec!["+c", "-a"]);
        let PresenceChange::Leave(leave) = &changes[1] else {
            panic!("expected leave");
        };
        assert_eq!(leave.previous, entry(&["1"]));
        assert_eq!(leave.left, entry(&["1"]));
        assert_eq!(local, state(&[("b", &["2"]), ("c", &["3"])]));
    }

    #[test]
    fn test_sync_replay_is_silent() {
        let server = state(&[("a", &["1", "2"])]);
        let mut local = server.clone();
        assert!(sync_state(&mut local, server.clone()).is_empty());
        assert_eq!(local, server);
    }

    #[test]
    fn test_sync_reports_only_new_metas() {
        let mut local = state(&[("a", &["1"])]);
        let changes = sync_state(&mut local, state(&[("a", &["1", "2"])]));

        let [PresenceChange::Join(join)] = changes.as_slice() else {
            panic!("expected one join, got {changes:?}");
        };
        assert_eq!(join.previous, Some(entry(&["1"])));
        assert_eq!(join.joined, entry(&["2"]));
        assert_eq!(local["a"], entry(&["1", "2"]));
    }

    #[test]
    fn test_diff_join_then_leave_leaves_no_trace() {
        let mut local = PresenceState::new();
        let joined = sync_diff(
            &mut local,
            PresenceDiff {
                joins: state(&[("a", &["m1"])]),
                leaves: PresenceState::new(),
            },
        );
        assert_eq!(keys_of(&joined), vec!["+a"]);

        let left = sync_diff(
            &mut local,
            PresenceDiff {
                joins: PresenceState::new(),
                leaves: state(&[("a", &["m1"])]),
            },
        );
        let [PresenceChange::Leave(leave)] = left.as_slice() else {
            panic!("expected one leave, got {left:?}");
        };
        assert_eq!(leave.left, entry(&["m1"]));
        assert_eq!(leave.previous, entry(&["m1"]));
        assert!(local.is_empty());
    }

    #[test]
    fn test_diff_partial_leave_keeps_key() {
        let mut local = state(&[("a", &["1", "2"])]);
        let changes = sync_diff(
            &mut local,
            PresenceDiff {
                joins: PresenceState::new(),
                leaves: state(&[("a", &["1"])]),
            },
        );
        assert_eq!(keys_of(&changes), vec!["-a"]);
        assert_eq!(local["a"], entry(&["2"]));
    }

    #[test]
    fn test_diff_leave_for_unknown_key_is_skipped() {
        let mut local = PresenceState::new();
        let changes = sync_diff(
            &mut local,
            PresenceDiff {
                joins: PresenceState::new(),
                leaves: state(&[("ghost", &["1"])]),
            },
        );
        assert!(changes.is_empty());
    }

    #[test]
    fn test_meta_keeps_application_fields() {
        let parsed: PresenceState = serde_json::from_value(json!({
            "alice": {"metas": [{"phx_ref": "F1", "online_at": 42, "device": "ios"}]}
        }))
        .unwrap();
        let meta = &parsed["alice"].metas[0];
        assert_eq!(meta.phx_ref, "F1");
        assert_eq!(meta.fields["online_at"], json!(42));
        assert_eq!(meta.fields["device"], json!("ios"));
        assert!(!meta.fields.contains_key("phx_ref"));
    }

    #[test]
    fn test_diff_payload_defaults_missing_sides() {
        let diff: PresenceDiff =
            serde_json::from_value(json!({"joins": {"a": {"metas": [{"phx_ref": "1"}]}}})).unwrap();
        assert!(diff.leaves.is_empty());
        assert_eq!(diff.joins["a"], entry(&["1"]));
    }

    #[test]
    fn test_apply_notifies_after_mutation() {
        let inner = Arc::new(PresenceInner {
            state: Mutex::new(PresenceState::new()),
            joins: Observers::new("j"),
            leaves: Observers::new("l"),
            syncs: Observers::new("s"),
        });
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (s, i) = (Arc::clone(&seen), Arc::clone(&inner));
        inner.joins.register(move |join| {
            // State lock is free inside callbacks.
            let count = i.state.lock().unwrap().len();
            s.lock().unwrap().push(format!("join {} ({count})", join.key));
        });
        let s = Arc::clone(&seen);
        inner
            .syncs
            .register(move |state| s.lock().unwrap().push(format!("sync {}", state.len())));

        inner.handle_state(&json!({"a": {"metas": [{"phx_ref": "1"}]}}));
        inner.handle_state(&json!("garbage"));

        assert_eq!(*seen.lock().unwrap(), vec!["join a (1)", "sync 1"]);
    }
}
