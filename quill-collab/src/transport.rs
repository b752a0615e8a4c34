//! The seam between the session core and a peer transport.
//!
//! A transport is constructed from `(room, document, configuration)` by a
//! [`Connector`], reports lifecycle and awareness changes through an
//! [`EventSink`], and exposes the awareness sub-interface
//! (`set_local_state_field`, `states`) plus `destroy()`.
//!
//! ```text
//! SessionManager ──connect()──► Connector ──► Transport
//!        ▲                                        │
//!        └──────── EventSink (mpsc) ◄─────────────┘
//!                  Synced / ConnectionClosed / ConnectionError /
//!                  AwarenessChanged / DocumentUpdate
//! ```
//!
//! Presence fields are opaque JSON values; the session layer parses the
//! ones it understands (`user`, `cursor`) and ignores the rest.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::document::Document;
use crate::error::TransportError;

/// Per-connection peer identifier, assigned by the transport.
///
/// Not stable across reconnects.
pub type ClientId = u64;

/// Raw published presence state of one peer.
pub type FieldMap = serde_json::Map<String, Value>;

/// Events a transport reports to its owner, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Initial document state exchange finished.
    Synced,
    /// The connection was closed.
    ConnectionClosed,
    /// The connection failed with a recoverable error.
    ConnectionError(String),
    /// Awareness states changed.
    AwarenessChanged {
        added: Vec<ClientId>,
        updated: Vec<ClientId>,
        removed: Vec<ClientId>,
    },
    /// A peer's document change, as a v1 update to merge locally.
    DocumentUpdate(Vec<u8>),
}

impl TransportEvent {
    pub fn added(id: ClientId) -> Self {
        Self::AwarenessChanged { added: vec![id], updated: Vec::new(), removed: Vec::new() }
    }

    pub fn updated(id: ClientId) -> Self {
        Self::AwarenessChanged { added: Vec::new(), updated: vec![id], removed: Vec::new() }
    }

    pub fn removed(id: ClientId) -> Self {
        Self::AwarenessChanged { added: Vec::new(), updated: Vec::new(), removed: vec![id] }
    }
}

/// Non-blocking event channel handed to a transport at construction.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Returns `false` once the owner stopped listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Construction parameters for one transport instance.
#[derive(Clone, Copy)]
pub struct ConnectRequest<'a> {
    pub room: &'a str,
    pub document: &'a Document,
    pub config: &'a SessionConfig,
}

/// A live connection to a room.
pub trait Transport: Send + 'static {
    /// Identifier of the local peer on this connection.
    fn client_id(&self) -> ClientId;

    /// Merge one field into the local awareness state and propagate it.
    fn set_local_state_field(&mut self, key: &str, value: Value);

    /// Awareness states of every peer that has published at least one field.
    fn states(&self) -> HashMap<ClientId, FieldMap>;

    /// Release every resource held by the connection. Idempotent.
    fn destroy(&mut self);
}

/// Factory for transports.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    /// Open a transport. Construction failures are not retried.
    fn connect(
        &self,
        request: ConnectRequest<'_>,
        events: EventSink,
    ) -> Result<Self::Transport, TransportError>;
}

impl<C: Connector> Connector for Arc<C> {
    type Transport = C::Transport;

    fn connect(
        &self,
        request: ConnectRequest<'_>,
        events: EventSink,
    ) -> Result<Self::Transport, TransportError> {
        (**self).connect(request, events)
    }
}
