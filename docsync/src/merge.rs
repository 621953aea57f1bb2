//! Conflict-free merge engine contract and its Yrs implementation.
//!
//! The session layer only relies on [`CrdtDocument`]: load a full state,
//! merge binary deltas, encode the full state, and diff against a remote
//! state vector. Any algorithm whose merge is commutative, associative and
//! idempotent over binary deltas satisfies it.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Name of the shared text root used by [`YrsDocument`]'s text helpers.
pub const DEFAULT_TEXT: &str = "content";

/// Errors raised by the merge engine.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("undecodable delta: {0}")]
    Decode(String),
    #[error("delta rejected: {0}")]
    Apply(String),
    #[error("undecodable state vector: {0}")]
    StateVector(String),
}

/// An opaque, mergeable document state.
pub trait CrdtDocument: Send + Sync + 'static {
    /// A document with no operations.
    fn empty() -> Self
    where
        Self: Sized;

    /// Rebuild a document from a full-state encoding. Zero-length input
    /// yields an empty document.
    fn load_state(state: &[u8]) -> Result<Self, MergeError>
    where
        Self: Sized;

    /// Merge a delta (or a full state) into this document.
    ///
    /// A rejected delta must leave the document untouched.
    fn apply_delta(&mut self, delta: &[u8]) -> Result<(), MergeError>;

    /// Full-state encoding, zero-length for a document with no operations.
    fn encode_state(&self) -> Vec<u8>;

    /// Compact summary of what this document has seen.
    fn state_vector(&self) -> Vec<u8>;

    /// Minimal delta bringing a replica at `remote_state_vector` up to date,
    /// zero-length when the remote already has everything.
    fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, MergeError>;
}

/// [`CrdtDocument`] backed by a Yrs `Doc` (v1 update encoding).
pub struct YrsDocument {
    doc: Doc,
}

impl YrsDocument {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Current contents of the text root `name` (empty if absent).
    pub fn text(&self, name: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(name)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Insert `chunk` into text root `name` at `index` and return the delta
    /// describing the edit.
    pub fn insert_text(&mut self, name: &str, index: u32, chunk: &str) -> Vec<u8> {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(name);
            let len = text.len(&txn);
            text.insert(&mut txn, index.min(len), chunk);
        }
        self.doc.transact().encode_diff_v1(&before)
    }

    /// Append `chunk` to the end of text root `name`, returning the delta.
    pub fn append_text(&mut self, name: &str, chunk: &str) -> Vec<u8> {
        self.insert_text(name, u32::MAX, chunk)
    }

    /// Remove `len` characters starting at `index` from text root `name`,
    /// returning the delta.
    pub fn remove_text(&mut self, name: &str, index: u32, len: u32) -> Vec<u8> {
        let before = self.doc.transact().state_vector();
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(name);
            let current = text.len(&txn);
            let start = index.min(current);
            let count = len.min(current - start);
            if count > 0 {
                text.remove_range(&mut txn, start, count);
            }
        }
        self.doc.transact().encode_diff_v1(&before)
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtDocument for YrsDocument {
    fn empty() -> Self {
        Self::new()
    }

    fn load_state(state: &[u8]) -> Result<Self, MergeError> {
        let mut doc = Self::new();
        if !state.is_empty() {
            doc.apply_delta(state)?;
        }
        Ok(doc)
    }

    fn apply_delta(&mut self, delta: &[u8]) -> Result<(), MergeError> {
        // Decoding fully before opening a transaction keeps rejected input
        // from touching the document.
        let update = Update::decode_v1(delta).map_err(|e| MergeError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| MergeError::Apply(e.to_string()))
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        if txn.state_vector().is_empty() {
            return Vec::new();
        }
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| MergeError::StateVector(e.to_string()))?;
        let diff = self.doc.transact().encode_diff_v1(&remote);
        let update = Update::decode_v1(&diff).map_err(|e| MergeError::Decode(e.to_string()))?;
        if update.is_empty() {
            return Ok(Vec::new());
        }
        Ok(diff)
    }
}
