//! Session connection manager.
//!
//! Owns one transport at a time, mirrors its awareness states into the
//! [`PresenceStore`], and reconnects with linear backoff.
//!
//! ## State machine
//!
//! ```text
//!            enter()
//!   Idle ───────────────► Connecting ──── synced ────► Synced
//!    ▲                     │  ▲  ▲                       │
//!    │                     │  │  └── error, attempts ◄───┤
//!    │ leave()             │  │      remaining (backoff) │
//!    │ (from any state)    │  └──────── synced ──┐       │ closed
//!    │                     │ closed              │       ▼
//!    │                     └──────────────► Disconnected ◄┘
//!    │
//!    │          error, attempts exhausted
//!    └──────── Errored(reason) ◄──── (also: bad config, construction failure)
//! ```
//!
//! Transport events are handled on a pump task. Handlers never propagate
//! failures back into the transport: every failure becomes a state change.
//! Events carry the connection generation they were produced under, so a
//! replaced or released transport can never move the session.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::color::ColorAssigner;
use crate::config::SessionConfig;
use crate::cursor::CursorChannel;
use crate::document::Document;
use crate::error::{ConfigError, SessionError, TransportError};
use crate::presence::{lock, PresenceStore, PresenceView, USER_FIELD};
use crate::transport::{
    ClientId, ConnectRequest, Connector, EventSink, FieldMap, Transport, TransportEvent,
};

/// Reason reported once the retry bound is reached.
pub const RETRIES_EXHAUSTED: &str = "Failed to connect after multiple attempts";

/// Observable session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Synced,
    Disconnected,
    /// Terminal until the next `enter()`.
    Errored(String),
}

impl SessionState {
    pub fn is_synced(&self) -> bool {
        matches!(self, SessionState::Synced)
    }

    /// Human-readable reason, if errored.
    pub fn error(&self) -> Option<&str> {
        match self {
            SessionState::Errored(reason) => Some(reason),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Synced => write!(f, "synced"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Errored(reason) => write!(f, "errored: {reason}"),
        }
    }
}

/// Who the local user is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub name: String,
    /// Palette color to use instead of a random one.
    pub color: Option<String>,
}

impl LocalIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), color: None }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }
}

/// Local presence publishing, type-erased over the connector.
pub(crate) trait Publish: Send + Sync {
    fn publish(&self, fields: FieldMap) -> bool;
}

struct Inner<T> {
    state: SessionState,
    /// Reconnects scheduled since the last `enter()`.
    attempts: u32,
    /// Bumped on every transport open/release and on `enter`/`leave`.
    generation: u64,
    room: Option<String>,
    name: String,
    color: String,
    runtime: Option<Handle>,
    transport: Option<T>,
    pump: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct Shared<C: Connector> {
    connector: C,
    document: Document,
    config: SessionConfig,
    colors: ColorAssigner,
    presence: Arc<PresenceStore>,
    state_tx: watch::Sender<SessionState>,
    inner: Mutex<Inner<C::Transport>>,
}

impl<C: Connector> Shared<C> {
    fn set_state(&self, inner: &mut Inner<C::Transport>, next: SessionState) {
        if inner.state == next {
            return;
        }
        log::debug!(
            "session {}: {} -> {}",
            inner.room.as_deref().unwrap_or("-"),
            inner.state,
            next
        );
        inner.state = next.clone();
        self.state_tx.send_replace(next);
    }

    /// Construct a transport, start its event pump and publish the local
    /// identity. Returns whether presence changed.
    fn open_transport(
        self: &Arc<Self>,
        inner: &mut Inner<C::Transport>,
    ) -> Result<bool, TransportError> {
        let (Some(room), Some(runtime)) = (inner.room.clone(), inner.runtime.clone()) else {
            return Ok(false);
        };
        inner.generation += 1;
        let generation = inner.generation;

        let (sink, mut rx) = EventSink::channel();
        let request = ConnectRequest {
            room: &room,
            document: &self.document,
            config: &self.config,
        };
        let mut transport = self.connector.connect(request, sink)?;
        let client_id = transport.client_id();

        let mut fields = self.presence.local_fields();
        fields.insert(
            USER_FIELD.to_string(),
            json!({ "id": client_id, "name": inner.name, "color": inner.color }),
        );
        for (key, value) in &fields {
            transport.set_local_state_field(key, value.clone());
        }
        let states = transport.states();
        inner.transport = Some(transport);

        let weak = Arc::downgrade(self);
        inner.pump = Some(runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.handle_event(generation, event);
            }
        }));

        log::info!("joined room {room} as client {client_id}");
        Ok(self.presence.bind_local(client_id, fields, states))
    }

    /// Destroy the current transport, if any. Returns whether presence
    /// changed.
    fn release_transport(&self, inner: &mut Inner<C::Transport>) -> bool {
        inner.generation += 1;
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        if let Some(mut transport) = inner.transport.take() {
            log::debug!("releasing transport for client {}", transport.client_id());
            transport.destroy();
        }
        self.presence.clear_remote()
    }

    fn handle_event(self: &Arc<Self>, generation: u64, event: TransportEvent) {
        let changed = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation || inner.transport.is_none() {
                log::trace!("dropping stale transport event {event:?}");
                return;
            }
            match event {
                TransportEvent::Synced => {
                    if matches!(inner.state, SessionState::Connecting | SessionState::Disconnected) {
                        self.set_state(&mut inner, SessionState::Synced);
                    }
                    false
                }
                TransportEvent::ConnectionClosed => {
                    if matches!(inner.state, SessionState::Connecting | SessionState::Synced) {
                        self.set_state(&mut inner, SessionState::Disconnected);
                    }
                    false
                }
                TransportEvent::ConnectionError(reason) => {
                    self.on_connection_error(&mut inner, &reason)
                }
                TransportEvent::AwarenessChanged { .. } => {
                    let states = inner
                        .transport
                        .as_ref()
                        .map(|t| t.states())
                        .unwrap_or_default();
                    self.presence.replace_remote(states)
                }
                TransportEvent::DocumentUpdate(update) => {
                    if let Err(e) = self.document.apply_update(&update) {
                        log::warn!("dropping document update from peer: {e}");
                    }
                    false
                }
            }
        };
        if changed {
            self.presence.notify();
        }
    }

    fn on_connection_error(self: &Arc<Self>, inner: &mut Inner<C::Transport>, reason: &str) -> bool {
        let policy = self.config.retry;
        let changed = self.release_transport(inner);

        if inner.attempts < policy.max_reconnects() {
            inner.attempts += 1;
            let delay = policy.delay_for(inner.attempts);
            log::warn!(
                "connection error: {reason}; reconnect attempt {} in {delay:?}",
                inner.attempts
            );
            self.set_state(inner, SessionState::Connecting);
            self.schedule_retry(inner, delay);
        } else {
            log::error!(
                "connection error: {reason}; giving up after {} reconnect(s)",
                inner.attempts
            );
            self.set_state(inner, SessionState::Errored(RETRIES_EXHAUSTED.to_string()));
        }
        changed
    }

    fn schedule_retry(self: &Arc<Self>, inner: &mut Inner<C::Transport>, delay: Duration) {
        let Some(runtime) = inner.runtime.clone() else { return };
        let generation = inner.generation;
        let weak = Arc::downgrade(self);
        inner.retry = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.reconnect(generation);
            }
        }));
    }

    fn reconnect(self: &Arc<Self>, generation: u64) {
        let changed = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation
                || inner.state != SessionState::Connecting
                || inner.transport.is_some()
            {
                return;
            }
            inner.retry = None;
            log::info!("reconnecting, attempt {}", inner.attempts);
            match self.open_transport(&mut inner) {
                Ok(changed) => changed,
                Err(e) => {
                    log::error!("transport construction failed: {e}");
                    self.set_state(&mut inner, SessionState::Errored(e.to_string()));
                    false
                }
            }
        };
        if changed {
            self.presence.notify();
        }
    }

    fn leave(&self) {
        let changed = {
            let mut inner = lock(&self.inner);
            if inner.state == SessionState::Idle && inner.room.is_none() {
                return;
            }
            if let Some(retry) = inner.retry.take() {
                retry.abort();
            }
            let released = self.release_transport(&mut inner);
            if let Some(room) = inner.room.take() {
                log::info!("left room {room}");
            }
            inner.runtime = None;
            self.set_state(&mut inner, SessionState::Idle);
            let cleared = self.presence.clear();
            released || cleared
        };
        if changed {
            self.presence.notify();
        }
    }
}

impl<C: Connector> Publish for Shared<C> {
    fn publish(&self, fields: FieldMap) -> bool {
        let changed = {
            let mut inner = lock(&self.inner);
            if inner.room.is_none() || matches!(inner.state, SessionState::Errored(_)) {
                log::debug!("ignoring presence publish outside a session");
                return false;
            }
            if let Some(transport) = inner.transport.as_mut() {
                for (key, value) in &fields {
                    transport.set_local_state_field(key, value.clone());
                }
            }
            self.presence.merge_local(fields)
        };
        if changed {
            self.presence.notify();
        }
        true
    }
}

fn validate(room: &str, identity: &LocalIdentity, config: &SessionConfig) -> Result<(), ConfigError> {
    if room.trim().is_empty() {
        return Err(ConfigError::EmptyRoom);
    }
    if identity.name.trim().is_empty() {
        return Err(ConfigError::EmptyName);
    }
    config.validate()
}

/// Lifecycle owner of one collaboration session.
///
/// Dropping the manager leaves the session.
pub struct SessionManager<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> SessionManager<C> {
    pub fn new(connector: C, document: Document, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                connector,
                document,
                config,
                colors: ColorAssigner::default(),
                presence: Arc::new(PresenceStore::new()),
                state_tx,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    attempts: 0,
                    generation: 0,
                    room: None,
                    name: String::new(),
                    color: String::new(),
                    runtime: None,
                    transport: None,
                    pump: None,
                    retry: None,
                }),
            }),
        }
    }

    /// Join `room` as `identity`, leaving any current session first.
    ///
    /// Configuration and construction failures are not retried: they move
    /// the session to [`SessionState::Errored`] and are also returned here.
    /// Must be called from within a tokio runtime.
    pub fn enter(&self, room: &str, identity: LocalIdentity) -> Result<(), SessionError> {
        self.leave();
        let shared = &self.shared;

        let changed = {
            let mut inner = lock(&shared.inner);
            inner.generation += 1;
            inner.attempts = 0;

            if let Err(e) = validate(room, &identity, &shared.config) {
                log::error!("cannot enter room {room:?}: {e}");
                shared.set_state(&mut inner, SessionState::Errored(e.to_string()));
                return Err(e.into());
            }
            let runtime = match Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    let e = SessionError::NoRuntime;
                    log::error!("cannot enter room {room}: {e}");
                    shared.set_state(&mut inner, SessionState::Errored(e.to_string()));
                    return Err(e);
                }
            };

            inner.room = Some(room.to_string());
            inner.color = identity.color.unwrap_or_else(|| shared.colors.random());
            inner.name = identity.name;
            inner.runtime = Some(runtime);
            log::info!("entering room {room} as {}", inner.name);
            shared.set_state(&mut inner, SessionState::Connecting);

            match shared.open_transport(&mut inner) {
                Ok(changed) => changed,
                Err(e) => {
                    log::error!("transport construction failed: {e}");
                    shared.set_state(&mut inner, SessionState::Errored(e.to_string()));
                    return Err(e.into());
                }
            }
        };
        if changed {
            shared.presence.notify();
        }
        Ok(())
    }

    /// Release the transport and every subscription. Safe in any state,
    /// idempotent, and cancels a pending reconnect.
    pub fn leave(&self) {
        self.shared.leave();
    }

    pub fn state(&self) -> SessionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Reconnects scheduled since the last `enter()`.
    pub fn attempts(&self) -> u32 {
        lock(&self.shared.inner).attempts
    }

    /// Client id on the current transport.
    pub fn client_id(&self) -> Option<ClientId> {
        lock(&self.shared.inner)
            .transport
            .as_ref()
            .map(|t| t.client_id())
    }

    pub fn room(&self) -> Option<String> {
        lock(&self.shared.inner).room.clone()
    }

    pub fn presence(&self) -> PresenceView {
        PresenceView::new(self.shared.presence.clone())
    }

    pub fn cursors(&self) -> CursorChannel {
        CursorChannel::new(self.shared.clone(), self.shared.presence.clone())
    }

    pub fn document(&self) -> &Document {
        &self.shared.document
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Merge fields into the local presence state and propagate them.
    ///
    /// Returns `false` when there is no active session.
    pub fn publish_local(&self, fields: FieldMap) -> bool {
        self.shared.publish(fields)
    }

    pub fn publish_local_field(&self, key: &str, value: Value) -> bool {
        let mut fields = FieldMap::new();
        fields.insert(key.to_string(), value);
        self.shared.publish(fields)
    }
}

impl<C: Connector> Drop for SessionManager<C> {
    fn drop(&mut self) {
        self.shared.leave();
    }
}
