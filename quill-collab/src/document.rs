//! Shared CRDT document handle.
//!
//! The merge engine is `yrs`; this wrapper only exposes what the session
//! layer and an editor binding need: a named XML fragment to bind rich
//! text to, a first-child test before seeding content, full-state
//! exchange for the initial sync step, and a feed of local changes for
//! live replication.
//!
//! Every merge performed by [`Document::apply_update`] is tagged as
//! remote, so [`Document::observe_local_updates`] never echoes a change
//! back to the peer it came from.

use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::{
    Doc, GetString, Origin, ReadTxn, StateVector, Subscription, Transact, Update,
    XmlElementPrelim, XmlFragment, XmlFragmentRef, XmlTextPrelim,
};

use crate::error::DocumentError;

/// Fragment name rich-text editors bind to.
pub const DEFAULT_FRAGMENT: &str = "tiptap";

/// Transaction origin of merged remote updates.
const REMOTE_ORIGIN: &str = "quill-remote";

/// Cheaply cloneable handle to one CRDT document.
#[derive(Clone)]
pub struct Document {
    doc: Arc<Doc>,
}

impl Document {
    pub fn new() -> Self {
        Self { doc: Arc::new(Doc::new()) }
    }

    /// Engine client id of this replica.
    pub fn replica_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// The shared fragment stored under `name`, created on first use.
    pub fn fragment(&self, name: &str) -> XmlFragmentRef {
        self.doc.get_or_insert_xml_fragment(name)
    }

    /// Whether the fragment already holds a first child.
    pub fn has_content(&self, name: &str) -> bool {
        let fragment = self.fragment(name);
        let txn = self.doc.transact();
        fragment.len(&txn) > 0
    }

    /// Seed the fragment with one paragraph unless prior content exists.
    ///
    /// Returns `true` if content was inserted.
    pub fn initialize_if_empty(&self, name: &str, text: &str) -> bool {
        let fragment = self.fragment(name);
        let mut txn = self.doc.transact_mut();
        if fragment.len(&txn) > 0 {
            return false;
        }
        let paragraph = fragment.insert(&mut txn, 0, XmlElementPrelim::empty("paragraph"));
        paragraph.insert(&mut txn, 0, XmlTextPrelim::new(text));
        true
    }

    /// Serialized XML of the fragment.
    pub fn to_xml_string(&self, name: &str) -> String {
        let fragment = self.fragment(name);
        let txn = self.doc.transact();
        fragment.get_string(&txn)
    }

    /// Whether this replica has never seen a single change.
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        txn.state_vector().is_empty()
    }

    /// Full state as a v1 update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a v1 update produced by another replica.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(bytes).map_err(|e| DocumentError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    /// Call `f` with the v1 update of every committed local transaction.
    ///
    /// Merges made through [`Document::apply_update`] are skipped. The
    /// callback runs inside the committing transaction, so it must not
    /// touch this document. Dropping the returned handle unsubscribes.
    pub fn observe_local_updates<F>(&self, f: F) -> Result<Subscription, DocumentError>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let remote = Origin::from(REMOTE_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() != Some(&remote) {
                    f(&event.update);
                }
            })
            .map_err(|e| DocumentError::Busy(e.to_string()))
    }

    /// The underlying engine document, for editor bindings.
    pub fn inner(&self) -> &Doc {
        &self.doc
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("replica_id", &self.replica_id())
            .finish()
    }
}
