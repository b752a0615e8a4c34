//! Presence store: who is in the room and what they have published.
//!
//! ## Data flow
//!
//! ```text
//! SessionManager::publish_local()        Transport awareness `change`
//!       │                                         │
//!       ▼                                         ▼
//! PresenceStore::merge_local()        PresenceStore::replace_remote()
//!       │                                         │
//!       └──────────────► rebuild ◄────────────────┘
//!                           │  version += 1
//!                           ▼
//!                   PresenceSnapshot (immutable, Arc-shared)
//!                           │
//!              ┌────────────┴────────────┐
//!              ▼                         ▼
//!      on_change handlers          watch::Receiver
//!      (notify(), serialized)      (under the write lock)
//! ```
//!
//! Each change produces a brand-new snapshot; consumers never see one
//! mutate. Notifications may coalesce, but they are delivered in version
//! order and the last one always carries the latest state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use tokio::sync::watch;

use crate::transport::{ClientId, FieldMap};

/// Presence field carrying a participant's identity.
pub const USER_FIELD: &str = "user";
/// Presence field carrying a participant's pointer position.
pub const CURSOR_FIELD: &str = "cursor";

// ───────────────────────────────────────────────────────────────────
// Participant state
// ───────────────────────────────────────────────────────────────────

/// Identity published under the `user` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: ClientId,
    pub name: String,
    pub color: String,
}

/// Ephemeral pointer coordinates published under the `cursor` field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// One peer's published state, with the fields this crate understands
/// parsed out.
///
/// A field that is missing or malformed is `None`; the raw value stays in
/// [`fields`](Self::fields).
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ClientId,
    pub user: Option<User>,
    pub cursor: Option<CursorPosition>,
    pub fields: FieldMap,
}

impl Participant {
    pub fn from_fields(id: ClientId, fields: FieldMap) -> Self {
        let user = fields
            .get(USER_FIELD)
            .and_then(|v| serde_json::from_value::<User>(v.clone()).ok())
            .filter(|u| !u.name.is_empty());
        let cursor = fields
            .get(CURSOR_FIELD)
            .and_then(|v| serde_json::from_value::<CursorPosition>(v.clone()).ok());
        Self { id, user, cursor, fields }
    }
}

// ───────────────────────────────────────────────────────────────────
// Snapshot
// ───────────────────────────────────────────────────────────────────

/// Immutable view of every participant at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceSnapshot {
    peers: Arc<BTreeMap<ClientId, Participant>>,
    local_id: Option<ClientId>,
}

impl PresenceSnapshot {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: ClientId) -> Option<&Participant> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.peers.contains_key(&id)
    }

    /// Participants ordered by client id.
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.peers.values()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.peers.keys().copied().collect()
    }

    /// Client id of the local participant, once bound to a transport.
    pub fn local_id(&self) -> Option<ClientId> {
        self.local_id
    }

    pub fn local(&self) -> Option<&Participant> {
        self.local_id.and_then(|id| self.peers.get(&id))
    }

    /// Users of every participant that published a valid `user` field,
    /// local participant included.
    pub fn collaborators(&self) -> Vec<User> {
        self.peers.values().filter_map(|p| p.user.clone()).collect()
    }

    /// [`collaborators`](Self::collaborators) without the local participant.
    pub fn remote_collaborators(&self) -> Vec<User> {
        self.peers
            .values()
            .filter(|p| Some(p.id) != self.local_id)
            .filter_map(|p| p.user.clone())
            .collect()
    }

    /// Last known cursor of every remote participant that published one.
    pub fn cursors(&self) -> BTreeMap<ClientId, CursorPosition> {
        self.peers
            .values()
            .filter(|p| Some(p.id) != self.local_id)
            .filter_map(|p| p.cursor.map(|c| (p.id, c)))
            .collect()
    }
}

// ───────────────────────────────────────────────────────────────────
// Change subscriptions
// ───────────────────────────────────────────────────────────────────

type Handler = Arc<dyn Fn(&PresenceSnapshot) + Send + Sync>;

#[derive(Default)]
struct HandlerTable {
    next_id: u64,
    handlers: BTreeMap<u64, Handler>,
}

/// Registration returned by [`PresenceStore::on_change`].
///
/// The handler stays registered until [`unsubscribe`](Self::unsubscribe)
/// is called or the subscription is dropped.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    id: u64,
    table: Weak<Mutex<HandlerTable>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            lock(&table).handlers.remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Mutable store contents. Only reachable inside [`PresenceStore::update`].
#[derive(Default)]
struct StoreState {
    local_id: Option<ClientId>,
    local: FieldMap,
    remote: HashMap<ClientId, FieldMap>,
    snapshot: PresenceSnapshot,
    /// Bumped on every snapshot change.
    version: u64,
}

impl StoreState {
    /// Rebuild the snapshot; returns whether it changed.
    fn rebuild(&mut self) -> bool {
        let mut peers: BTreeMap<ClientId, Participant> = self
            .remote
            .iter()
            .filter(|(id, fields)| Some(**id) != self.local_id && !fields.is_empty())
            .map(|(id, fields)| (*id, Participant::from_fields(*id, fields.clone())))
            .collect();
        if let Some(id) = self.local_id {
            if !self.local.is_empty() {
                peers.insert(id, Participant::from_fields(id, self.local.clone()));
            }
        }

        let next = PresenceSnapshot {
            peers: Arc::new(peers),
            local_id: self.local_id,
        };
        if next == self.snapshot {
            return false;
        }
        self.snapshot = next;
        self.version += 1;
        true
    }
}

/// Handler dispatch bookkeeping.
#[derive(Default)]
struct Delivery {
    /// Latest snapshot version handed to handlers.
    delivered: u64,
    /// Some thread is running handlers.
    dispatching: bool,
}

/// Mapping from client id to published presence state.
///
/// Pure in-memory structure owned by a session: the session forwards local
/// fields to its transport, feeds remote states back in, and notifies once
/// its own locks are released. Everyone else reads.
pub struct PresenceStore {
    state: RwLock<StoreState>,
    handlers: Arc<Mutex<HandlerTable>>,
    watch_tx: watch::Sender<PresenceSnapshot>,
    delivery: Mutex<Delivery>,
}

impl PresenceStore {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(PresenceSnapshot::default());
        Self {
            state: RwLock::new(StoreState::default()),
            handlers: Arc::new(Mutex::new(HandlerTable::default())),
            watch_tx,
            delivery: Mutex::new(Delivery::default()),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> PresenceSnapshot {
        self.read().snapshot.clone()
    }

    /// Merged local fields, whether or not a transport is bound.
    pub fn local_fields(&self) -> FieldMap {
        self.read().local.clone()
    }

    /// Register a handler called after every change.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PresenceSnapshot) + Send + Sync + 'static,
    {
        let mut table = lock(&self.handlers);
        let id = table.next_id;
        table.next_id += 1;
        table.handlers.insert(id, Arc::new(handler));
        Subscription {
            id,
            table: Arc::downgrade(&self.handlers),
        }
    }

    /// Async observer; only the latest snapshot is retained.
    pub fn watch(&self) -> watch::Receiver<PresenceSnapshot> {
        self.watch_tx.subscribe()
    }

    pub fn handler_count(&self) -> usize {
        lock(&self.handlers).handlers.len()
    }

    // ─── Session-side mutators ──────────────────────────────────────
    //
    // None of these notify. Each returns whether the snapshot changed; the
    // caller follows up with `notify()` once its own locks are released.

    /// Bind the local participant to `id` on a fresh transport.
    pub(crate) fn bind_local(
        &self,
        id: ClientId,
        local: FieldMap,
        remote: HashMap<ClientId, FieldMap>,
    ) -> bool {
        self.update(|s| {
            s.local_id = Some(id);
            s.local = local;
            s.remote = remote;
        })
    }

    /// Merge `fields` into the local participant's state.
    pub(crate) fn merge_local(&self, fields: FieldMap) -> bool {
        self.update(|s| s.local.extend(fields))
    }

    /// Replace the mirror of remote states wholesale.
    pub(crate) fn replace_remote(&self, remote: HashMap<ClientId, FieldMap>) -> bool {
        self.update(|s| s.remote = remote)
    }

    /// Forget every remote peer.
    pub(crate) fn clear_remote(&self) -> bool {
        self.update(|s| s.remote.clear())
    }

    /// Forget everything, local participant included.
    pub(crate) fn clear(&self) -> bool {
        self.update(|s| {
            s.local.clear();
            s.local_id = None;
            s.remote.clear();
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` and rebuild. A changed snapshot gets a new version and is
    /// published to watchers before the write lock is released, so watchers
    /// observe versions in order.
    fn update(&self, f: impl FnOnce(&mut StoreState)) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
        if !state.rebuild() {
            return false;
        }
        self.watch_tx.send_replace(state.snapshot.clone());
        true
    }

    /// Run the change handlers for every version not yet delivered.
    ///
    /// Only one thread dispatches at a time. A caller that finds dispatch
    /// in progress returns at once; the dispatching thread re-reads the
    /// store after each round, so the last round always carries the latest
    /// snapshot and no handler ever sees an older one after a newer one.
    pub(crate) fn notify(&self) {
        let mut delivery = lock(&self.delivery);
        if delivery.dispatching {
            return;
        }
        delivery.dispatching = true;
        loop {
            let (version, snapshot) = {
                let state = self.read();
                (state.version, state.snapshot.clone())
            };
            if version <= delivery.delivered {
                break;
            }
            delivery.delivered = version;
            drop(delivery);

            let handlers: Vec<Handler> = lock(&self.handlers).handlers.values().cloned().collect();
            for handler in handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(&snapshot))).is_err() {
                    log::error!("presence change handler panicked");
                }
            }
            delivery = lock(&self.delivery);
        }
        delivery.dispatching = false;
    }
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only access to a session's [`PresenceStore`].
#[derive(Clone)]
pub struct PresenceView {
    store: Arc<PresenceStore>,
}

impl PresenceView {
    pub(crate) fn new(store: Arc<PresenceStore>) -> Self {
        Self { store }
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.store.snapshot()
    }

    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PresenceSnapshot) + Send + Sync + 'static,
    {
        self.store.on_change(handler)
    }

    pub fn watch(&self) -> watch::Receiver<PresenceSnapshot> {
        self.store.watch()
    }
}

// ===================================================================
// Tests
// ===================================================================
