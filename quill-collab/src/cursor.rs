//! Live cursor publishing and observation.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::presence::{CursorPosition, PresenceStore, Subscription, CURSOR_FIELD};
use crate::session::Publish;
use crate::transport::{ClientId, FieldMap};

/// Cursor view of a session's presence.
///
/// Cloning is cheap; all clones share the session.
#[derive(Clone)]
pub struct CursorChannel {
    session: Arc<dyn Publish>,
    store: Arc<PresenceStore>,
}

impl CursorChannel {
    pub(crate) fn new(session: Arc<dyn Publish>, store: Arc<PresenceStore>) -> Self {
        Self { session, store }
    }

    /// Publish the local pointer position under the `cursor` field.
    ///
    /// Returns `false` when the session has not been entered.
    pub fn publish_cursor(&self, x: f64, y: f64) -> bool {
        self.publish(json!({ "x": x, "y": y }))
    }

    /// Withdraw the local cursor without leaving the room.
    pub fn hide_cursor(&self) -> bool {
        self.publish(Value::Null)
    }

    /// Last known cursor of every other participant that published one.
    pub fn observe_cursors(&self) -> BTreeMap<ClientId, CursorPosition> {
        self.store.snapshot().cursors()
    }

    /// Run `handler` with the remote cursor map on every presence change.
    pub fn on_cursors<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BTreeMap<ClientId, CursorPosition>) + Send + Sync + 'static,
    {
        self.store.on_change(move |snapshot| handler(&snapshot.cursors()))
    }

    fn publish(&self, value: Value) -> bool {
        let mut fields = FieldMap::new();
        fields.insert(CURSOR_FIELD.to_string(), value);
        self.session.publish(fields)
    }
}

impl std::fmt::Debug for CursorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorChannel")
            .field("cursors", &self.observe_cursors().len())
            .finish()
    }
}
