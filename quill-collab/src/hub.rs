//! In-process room hub: a [`Connector`] whose peers live in one process.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!             ├── Room (id) ── Document ── members: ClientId → {fields, sink}
//! Session B ──┘                  │
//!                                ├── join: full-state exchange, then Synced
//!                                ├── local edit: merged into Document, DocumentUpdate to the others
//!                                └── field write: AwarenessChanged to every member
//! ```
//!
//! A joining member's full state is merged into the room document and the
//! room's state back into the member. From then on every local commit on a
//! member document is relayed as a delta, so content seeded after `Synced`
//! still reaches peers that join later. Faults can be injected per client
//! with [`LocalHub::disconnect`], [`LocalHub::resync`] and [`LocalHub::fail`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use yrs::Subscription;

use crate::document::Document;
use crate::error::TransportError;
use crate::presence::lock;
use crate::transport::{
    ClientId, ConnectRequest, Connector, EventSink, FieldMap, Transport, TransportEvent,
};

/// Hub counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Transports constructed, including rejected ones.
    pub connects: u64,
    /// Joins refused because the room was full.
    pub rejected: u64,
    pub events_sent: u64,
    pub active_rooms: usize,
}

/// Lock-free counters, read via [`LocalHub::stats`].
#[derive(Default)]
struct AtomicHubStats {
    connects: AtomicU64,
    rejected: AtomicU64,
    events_sent: AtomicU64,
}

struct Member {
    fields: FieldMap,
    sink: EventSink,
    /// Relay of the member's local document commits; dropped on leave.
    _updates: Subscription,
}

/// One room: authoritative document plus its members.
struct Room {
    document: Document,
    members: HashMap<ClientId, Member>,
}

impl Room {
    fn new() -> Self {
        Self {
            document: Document::new(),
            members: HashMap::new(),
        }
    }

    fn broadcast(&self, event: &TransportEvent, stats: &AtomicHubStats) {
        for member in self.members.values() {
            if member.sink.emit(event.clone()) {
                stats.events_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Merge `update` into the room document and forward it to every
    /// member except `origin`.
    fn merge_and_forward(&self, origin: ClientId, update: &[u8], stats: &AtomicHubStats) {
        if let Err(e) = self.document.apply_update(update) {
            log::warn!("dropping document update from client {origin}: {e}");
            return;
        }
        let event = TransportEvent::DocumentUpdate(update.to_vec());
        for (id, member) in &self.members {
            if *id != origin && member.sink.emit(event.clone()) {
                stats.events_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

struct HubInner {
    rooms: Mutex<HashMap<String, Room>>,
    next_client: AtomicU64,
    available: AtomicBool,
    stats: AtomicHubStats,
}

impl HubInner {
    fn send_to(&self, client: ClientId, event: TransportEvent) -> bool {
        let rooms = lock(&self.rooms);
        let Some(member) = rooms.values().find_map(|r| r.members.get(&client)) else {
            return false;
        };
        let sent = member.sink.emit(event);
        if sent {
            self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Relay a local commit made on `origin`'s document.
    ///
    /// Runs inside that document's commit, so it never locks a member
    /// document while holding `rooms`.
    fn relay(&self, room: &str, origin: ClientId, update: &[u8]) {
        let rooms = lock(&self.rooms);
        let Some(room) = rooms.get(room) else { return };
        if room.members.contains_key(&origin) {
            log::trace!("relaying {} byte update from client {origin}", update.len());
            room.merge_and_forward(origin, update, &self.stats);
        }
    }
}

/// Process-local rooms shared by every session built on a clone of this hub.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                rooms: Mutex::new(HashMap::new()),
                next_client: AtomicU64::new(1),
                available: AtomicBool::new(true),
                stats: AtomicHubStats::default(),
            }),
        }
    }

    /// While unavailable, every `connect` fails at construction.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Report `ConnectionClosed` to one client.
    pub fn disconnect(&self, client: ClientId) -> bool {
        self.inner.send_to(client, TransportEvent::ConnectionClosed)
    }

    /// Report `Synced` to one client.
    pub fn resync(&self, client: ClientId) -> bool {
        self.inner.send_to(client, TransportEvent::Synced)
    }

    /// Report a connection error to one client.
    pub fn fail(&self, client: ClientId, reason: &str) -> bool {
        self.inner
            .send_to(client, TransportEvent::ConnectionError(reason.to_string()))
    }

    pub fn room_count(&self) -> usize {
        lock(&self.inner.rooms).len()
    }

    pub fn member_count(&self, room: &str) -> usize {
        lock(&self.inner.rooms)
            .get(room)
            .map_or(0, |r| r.members.len())
    }

    /// The room's authoritative document, while the room has members.
    pub fn document(&self, room: &str) -> Option<Document> {
        lock(&self.inner.rooms).get(room).map(|r| r.document.clone())
    }

    pub fn stats(&self) -> HubStats {
        let stats = &self.inner.stats;
        HubStats {
            connects: stats.connects.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            events_sent: stats.events_sent.load(Ordering::Relaxed),
            active_rooms: self.room_count(),
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for LocalHub {
    type Transport = HubTransport;

    fn connect(
        &self,
        request: ConnectRequest<'_>,
        events: EventSink,
    ) -> Result<HubTransport, TransportError> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable("hub is offline".to_string()));
        }
        request.config.validate()?;

        let client_id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        let stats = &self.inner.stats;
        stats.connects.fetch_add(1, Ordering::Relaxed);

        let room_name = request.room.to_string();
        let updates = request.document.observe_local_updates({
            let hub = Arc::downgrade(&self.inner);
            let room = room_name.clone();
            move |update| {
                if let Some(hub) = hub.upgrade() {
                    hub.relay(&room, client_id, update);
                }
            }
        })?;

        {
            let mut rooms = lock(&self.inner.rooms);
            let room = rooms.entry(room_name.clone()).or_insert_with(Room::new);
            if room.members.len() >= request.config.max_conns {
                log::warn!("room {room_name} is full, refusing client {client_id}");
                stats.rejected.fetch_add(1, Ordering::Relaxed);
                if events.emit(TransportEvent::ConnectionError("room is full".to_string())) {
                    stats.events_sent.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(HubTransport::detached(self.inner.clone(), request.room, client_id));
            }
            room.members.insert(
                client_id,
                Member {
                    fields: FieldMap::new(),
                    sink: events.clone(),
                    _updates: updates,
                },
            );
            log::debug!(
                "client {client_id} joined room {room_name} ({} members)",
                room.members.len()
            );
        }

        // Commits from here on are relayed; everything earlier is in this
        // snapshot. Member documents are never locked under `rooms`.
        let local_state = (!request.document.is_empty()).then(|| request.document.encode_state());
        let room_state = lock(&self.inner.rooms).get(&room_name).map(|room| {
            if let Some(state) = &local_state {
                room.merge_and_forward(client_id, state, stats);
            }
            room.document.encode_state()
        });
        if let Some(Err(e)) = room_state.map(|state| request.document.apply_update(&state)) {
            log::warn!("room {room_name}: client {client_id} rejected room state: {e}");
        }

        if events.emit(TransportEvent::Synced) {
            stats.events_sent.fetch_add(1, Ordering::Relaxed);
        }

        Ok(HubTransport {
            hub: self.inner.clone(),
            room: room_name,
            client_id,
            joined: true,
        })
    }
}

/// A membership in one [`LocalHub`] room.
pub struct HubTransport {
    hub: Arc<HubInner>,
    room: String,
    client_id: ClientId,
    joined: bool,
}

impl HubTransport {
    /// A transport that never made it into its room.
    fn detached(hub: Arc<HubInner>, room: &str, client_id: ClientId) -> Self {
        Self {
            hub,
            room: room.to_string(),
            client_id,
            joined: false,
        }
    }
}

impl Transport for HubTransport {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn set_local_state_field(&mut self, key: &str, value: Value) {
        if !self.joined {
            return;
        }
        let mut rooms = lock(&self.hub.rooms);
        let Some(room) = rooms.get_mut(&self.room) else { return };
        let Some(member) = room.members.get_mut(&self.client_id) else { return };

        let first = member.fields.is_empty();
        if member.fields.get(key) == Some(&value) {
            return;
        }
        member.fields.insert(key.to_string(), value);

        let event = if first {
            TransportEvent::added(self.client_id)
        } else {
            TransportEvent::updated(self.client_id)
        };
        room.broadcast(&event, &self.hub.stats);
    }

    fn states(&self) -> HashMap<ClientId, FieldMap> {
        if !self.joined {
            return HashMap::new();
        }
        lock(&self.hub.rooms)
            .get(&self.room)
            .map(|room| {
                room.members
                    .iter()
                    .filter(|(_, m)| !m.fields.is_empty())
                    .map(|(id, m)| (*id, m.fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn destroy(&mut self) {
        if !self.joined {
            return;
        }
        self.joined = false;

        let mut rooms = lock(&self.hub.rooms);
        let Some(room) = rooms.get_mut(&self.room) else { return };
        let Some(member) = room.members.remove(&self.client_id) else { return };

        if !member.fields.is_empty() {
            room.broadcast(&TransportEvent::removed(self.client_id), &self.hub.stats);
        }
        log::debug!(
            "client {} left room {} ({} members)",
            self.client_id,
            self.room,
            room.members.len()
        );
        if room.members.is_empty() {
            rooms.remove(&self.room);
        }
    }
}

impl Drop for HubTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::document::DEFAULT_FRAGMENT;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn join(
        hub: &LocalHub,
        room: &str,
        document: &Document,
        config: &SessionConfig,
    ) -> (HubTransport, UnboundedReceiver<TransportEvent>) {
        let (sink, rx) = EventSink::channel();
        let request = ConnectRequest { room, document, config };
        (hub.connect(request, sink).unwrap(), rx)
    }

    #[test]
    fn test_join_emits_synced() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let (t, mut rx) = join(&hub, "r", &Document::new(), &config);
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Synced);
        assert_eq!(hub.member_count("r"), 1);
        assert_eq!(hub.room_count(), 1);
        assert!(t.states().is_empty());
    }

    #[test]
    fn test_client_ids_are_unique() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let (a, _ra) = join(&hub, "r", &Document::new(), &config);
        let (b, _rb) = join(&hub, "r", &Document::new(), &config);
        assert_ne!(a.client_id(), b.client_id());
    }

    #[test]
    fn test_field_write_reaches_every_member() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let (mut a, mut ra) = join(&hub, "r", &Document::new(), &config);
        let (b, mut rb) = join(&hub, "r", &Document::new(), &config);
        ra.try_recv().unwrap();
        rb.try_recv().unwrap();

        a.set_local_state_field("cursor", json!({ "x": 10.0, "y": 20.0 }));
        assert_eq!(rb.try_recv().unwrap(), TransportEvent::added(a.client_id()));
        assert_eq!(ra.try_recv().unwrap(), TransportEvent::added(a.client_id()));

        let states = b.states();
        assert_eq!(states.len(), 1);
        assert_eq!(states[&a.client_id()]["cursor"], json!({ "x": 10.0, "y": 20.0 }));

        a.set_local_state_field("cursor", json!({ "x": 11.0, "y": 20.0 }));
        assert_eq!(rb.try_recv().unwrap(), TransportEvent::updated(a.client_id()));

        // Same value again is not an update.
        a.set_local_state_field("cursor", json!({ "x": 11.0, "y": 20.0 }));
        ra.try_recv().unwrap();
        assert!(ra.try_recv().is_err());
    }

    #[test]
    fn test_destroy_removes_member_and_notifies() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let (mut a, _ra) = join(&hub, "r", &Document::new(), &config);
        let (_b, mut rb) = join(&hub, "r", &Document::new(), &config);
        a.set_local_state_field("user", json!({ "name": "a" }));
        while rb.try_recv().is_ok() {}

        a.destroy();
        a.destroy();
        assert_eq!(rb.try_recv().unwrap(), TransportEvent::removed(a.client_id()));
        assert!(rb.try_recv().is_err());
        assert_eq!(hub.member_count("r"), 1);
    }

    #[test]
    fn test_empty_room_is_removed() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        {
            let (_t, _rx) = join(&hub, "r", &Document::new(), &config);
            assert_eq!(hub.room_count(), 1);
        }
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn test_full_room_rejects_join() {
        let hub = LocalHub::new();
        let config = SessionConfig {
            max_conns: 1,
            ..SessionConfig::default()
        };
        let (_a, _ra) = join(&hub, "r", &Document::new(), &config);
        let (mut b, mut rb) = join(&hub, "r", &Document::new(), &config);

        assert_eq!(
            rb.try_recv().unwrap(),
            TransportEvent::ConnectionError("room is full".into())
        );
        b.set_local_state_field("user", json!({}));
        assert!(b.states().is_empty());
        assert_eq!(hub.member_count("r"), 1);
        assert_eq!(hub.stats().rejected, 1);
    }

    #[test]
    fn test_join_exchanges_document_state() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let alice = Document::new();
        alice.initialize_if_empty(DEFAULT_FRAGMENT, "Start collaborating!");
        let (_a, _ra) = join(&hub, "r", &alice, &config);

        let bob = Document::new();
        let (_b, _rb) = join(&hub, "r", &bob, &config);
        assert!(bob.has_content(DEFAULT_FRAGMENT));
        assert!(!bob.initialize_if_empty(DEFAULT_FRAGMENT, "Start collaborating!"));
        assert_eq!(
            bob.to_xml_string(DEFAULT_FRAGMENT),
            alice.to_xml_string(DEFAULT_FRAGMENT)
        );
        assert!(hub.document("r").unwrap().has_content(DEFAULT_FRAGMENT));
    }

    #[test]
    fn test_seed_after_join_reaches_later_member() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let alice = Document::new();
        let (_a, _ra) = join(&hub, "r", &alice, &config);
        assert!(alice.initialize_if_empty(DEFAULT_FRAGMENT, "Start collaborating!"));
        assert!(hub.document("r").unwrap().has_content(DEFAULT_FRAGMENT));

        let bob = Document::new();
        let (_b, _rb) = join(&hub, "r", &bob, &config);
        assert!(!bob.initialize_if_empty(DEFAULT_FRAGMENT, "Start collaborating!"));
        assert_eq!(
            bob.to_xml_string(DEFAULT_FRAGMENT),
            alice.to_xml_string(DEFAULT_FRAGMENT)
        );
    }

    #[test]
    fn test_live_edit_is_forwarded_to_other_members() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let (alice, bob) = (Document::new(), Document::new());
        let (_a, mut ra) = join(&hub, "r", &alice, &config);
        let (_b, mut rb) = join(&hub, "r", &bob, &config);
        ra.try_recv().unwrap();
        rb.try_recv().unwrap();

        alice.initialize_if_empty(DEFAULT_FRAGMENT, "hello");
        let Ok(TransportEvent::DocumentUpdate(update)) = rb.try_recv() else {
            panic!("expected a document update");
        };
        assert!(ra.try_recv().is_err());

        bob.apply_update(&update).unwrap();
        assert_eq!(
            bob.to_xml_string(DEFAULT_FRAGMENT),
            alice.to_xml_string(DEFAULT_FRAGMENT)
        );
        // Merging a relayed update is not itself relayed.
        assert!(ra.try_recv().is_err());
        assert!(rb.try_recv().is_err());
    }

    #[test]
    fn test_joiner_content_is_forwarded_to_members() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let (_a, mut ra) = join(&hub, "r", &Document::new(), &config);
        ra.try_recv().unwrap();

        let offline = Document::new();
        offline.initialize_if_empty(DEFAULT_FRAGMENT, "written offline");
        let (_b, _rb) = join(&hub, "r", &offline, &config);
        assert!(matches!(ra.try_recv(), Ok(TransportEvent::DocumentUpdate(_))));
        assert!(hub.document("r").unwrap().has_content(DEFAULT_FRAGMENT));
    }

    #[test]
    fn test_departed_member_edits_are_not_relayed() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let alice = Document::new();
        let (mut a, _ra) = join(&hub, "r", &alice, &config);
        let (_b, mut rb) = join(&hub, "r", &Document::new(), &config);
        rb.try_recv().unwrap();

        a.destroy();
        alice.initialize_if_empty(DEFAULT_FRAGMENT, "after leaving");
        assert!(rb.try_recv().is_err());
        assert!(!hub.document("r").unwrap().has_content(DEFAULT_FRAGMENT));
    }

    #[test]
    fn test_offline_hub_fails_construction() {
        let hub = LocalHub::new();
        hub.set_available(false);
        let (sink, _rx) = EventSink::channel();
        let config = SessionConfig::default();
        let doc = Document::new();
        let request = ConnectRequest { room: "r", document: &doc, config: &config };
        assert!(matches!(
            hub.connect(request, sink),
            Err(TransportError::Unavailable(_))
        ));
        assert_eq!(hub.stats().connects, 0);
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let hub = LocalHub::new();
        let (sink, _rx) = EventSink::channel();
        let config = SessionConfig {
            signaling: Vec::new(),
            ..SessionConfig::default()
        };
        let doc = Document::new();
        let request = ConnectRequest { room: "r", document: &doc, config: &config };
        assert!(matches!(
            hub.connect(request, sink),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_fault_injection_targets_one_client() {
        let hub = LocalHub::new();
        let config = SessionConfig::default();
        let (a, mut ra) = join(&hub, "r", &Document::new(), &config);
        let (_b, mut rb) = join(&hub, "r", &Document::new(), &config);
        ra.try_recv().unwrap();
        rb.try_recv().unwrap();

        assert!(hub.fail(a.client_id(), "ice failed"));
        assert!(hub.disconnect(a.client_id()));
        assert_eq!(
            ra.try_recv().unwrap(),
            TransportEvent::ConnectionError("ice failed".into())
        );
        assert_eq!(ra.try_recv().unwrap(), TransportEvent::ConnectionClosed);
        assert!(rb.try_recv().is_err());
        assert!(!hub.fail(9999, "nobody"));
    }
}
