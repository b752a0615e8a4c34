//! Demo presence integration — turns a session's presence into labeled
//! cursors ready for display.
//!
//! ## Data flow
//!
//! ```text
//!  PresenceStore change
//!       │
//!       ▼
//!  Roster (dirty flag)
//!       │
//!       ▼
//!  Roster::cursor_labels() ─── name + color + position per remote peer
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use quill_collab::{ClientId, PresenceView, Subscription, User};

/// One remote cursor, resolved against its owner's identity.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorLabel {
    pub client: ClientId,
    pub name: String,
    pub color: String,
    pub x: f64,
    pub y: f64,
}

impl std::fmt::Display for CursorLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} @ ({:.1}, {:.1})", self.name, self.color, self.x, self.y)
    }
}

/// Tracks whether presence changed since the last read.
pub struct Roster {
    view: PresenceView,
    dirty: Arc<AtomicBool>,
    _subscription: Subscription,
}

impl Roster {
    pub fn new(view: PresenceView) -> Self {
        let dirty = Arc::new(AtomicBool::new(false));
        let flag = dirty.clone();
        let subscription = view.on_change(move |_| flag.store(true, Ordering::Release));
        Self {
            view,
            dirty,
            _subscription: subscription,
        }
    }

    /// Remote cursors with a known owner. Clears the dirty flag.
    pub fn cursor_labels(&self) -> Vec<CursorLabel> {
        self.dirty.store(false, Ordering::Release);
        let snapshot = self.view.snapshot();
        snapshot
            .cursors()
            .into_iter()
            .filter_map(|(client, pos)| {
                let user = snapshot.get(client)?.user.as_ref()?;
                Some(CursorLabel {
                    client,
                    name: user.name.clone(),
                    color: user.color.clone(),
                    x: pos.x,
                    y: pos.y,
                })
            })
            .collect()
    }

    pub fn collaborators(&self) -> Vec<User> {
        self.view.snapshot().collaborators()
    }

    /// Whether presence changed since the last `cursor_labels()`.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

// ===================================================================
// Tests
// ===================================================================
