//! Composition of a base snapshot with pending differential patches.

use domainflow_types::DifferentialPatch;
use serde_json::Value;

use crate::apply::apply_patch;

struct PendingPatch {
    id: String,
    patch: DifferentialPatch,
    inserted: u64,
}

/// Owns the authoritative base snapshot plus the map of pending (unconfirmed)
/// patches and composes them in sequence order into the current view.
pub struct PatchProcessor {
    base_snapshot: Value,
    pending: Vec<PendingPatch>,
    insert_counter: u64,
}

impl PatchProcessor {
    pub fn new(initial: Value) -> Self {
        Self {
            base_snapshot: initial,
            pending: Vec::new(),
            insert_counter: 0,
        }
    }

    /// Replace the base snapshot. Pending patches are intentionally left
    /// alone — clearing them on a full-snapshot reset is the caller's call.
    pub fn update_base_snapshot(&mut self, doc: &Value) {
        self.base_snapshot = doc.clone();
    }

    pub fn base_snapshot(&self) -> &Value {
        &self.base_snapshot
    }

    /// Register a pending patch under `id`. An existing patch with the same
    /// id is replaced in place.
    pub fn add_pending_patch(&mut self, id: impl Into<String>, patch: DifferentialPatch) {
        let id = id.into();
        self.insert_counter += 1;
        if let Some(existing) = self.pending.iter_mut().find(|p| p.id == id) {
            existing.patch = patch;
            return;
        }
        self.pending.push(PendingPatch {
            id,
            patch,
            inserted: self.insert_counter,
        });
    }

    /// Remove the pending patch with `id`. Returns whether it existed.
    pub fn remove_patch(&mut self, id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.id != id);
        self.pending.len() != before
    }

    pub fn clear_pending_patches(&mut self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Compute the current view: base snapshot plus every pending patch in
    /// ascending sequence-number order (missing numbers sort as 0, insertion
    /// order among equals). Pure relative to current state — calling it
    /// repeatedly does not change anything.
    pub fn current_state(&self) -> Value {
        let mut ordered: Vec<&PendingPatch> = self.pending.iter().collect();
        ordered.sort_by_key(|p| (p.patch.sequence_number.unwrap_or(0), p.inserted));

        let mut doc = self.base_snapshot.clone();
        for pending in ordered {
            doc = apply_patch(&doc, &pending.patch);
        }
        doc
    }
}

impl Default for PatchProcessor {
    fn default() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }
}
