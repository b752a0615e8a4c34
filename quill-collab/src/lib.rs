//! # quill-collab — Presence-aware collaboration sessions
//!
//! Keeps one shared document connected to a room, tracks who else is in
//! it and where their cursors are, and reconnects on transient failure.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  enter/leave   ┌──────────────┐  connect()  ┌───────────┐
//! │ Editor / UI    │ ─────────────► │SessionManager│ ──────────► │ Connector │
//! │                │ ◄── watch ──── │ (state, retry)│ ◄─ events ─ │ Transport │
//! └───────┬────────┘                └──────┬───────┘             └───────────┘
//!         │ cursors / collaborators        │ awareness states
//!         ▼                                ▼
//! ┌────────────────┐               ┌──────────────┐
//! │ CursorChannel  │ ────────────► │PresenceStore │
//! └────────────────┘               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`] — Connection lifecycle, state machine and backoff
//! - [`presence`] — Peer presence store and change subscriptions
//! - [`cursor`] — Publish and observe live cursors
//! - [`transport`] — Transport/connector seam and event channel
//! - [`hub`] — In-process transport for local rooms and tests
//! - [`document`] — Shared CRDT document handle
//! - [`config`] — Session and retry configuration
//! - [`color`] — Participant color palette
//! - [`error`] — Error types

pub mod color;
pub mod config;
pub mod cursor;
pub mod document;
pub mod error;
pub mod hub;
pub mod presence;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use color::{ColorAssigner, PALETTE};
pub use config::{IceServer, RetryPolicy, SessionConfig, DEFAULT_ICE_SERVERS, DEFAULT_SIGNALING};
pub use cursor::CursorChannel;
pub use document::{Document, DEFAULT_FRAGMENT};
pub use error::{ConfigError, DocumentError, SessionError, TransportError};
pub use hub::{HubStats, HubTransport, LocalHub};
pub use presence::{
    CursorPosition, Participant, PresenceSnapshot, PresenceStore, PresenceView, Subscription,
    User, CURSOR_FIELD, USER_FIELD,
};
pub use session::{LocalIdentity, SessionManager, SessionState, RETRIES_EXHAUSTED};
pub use transport::{
    ClientId, ConnectRequest, Connector, EventSink, FieldMap, Transport, TransportEvent,
};
