//! Differential patch application for DomainFlow progress documents.
//!
//! Two layers:
//! - [`apply_op`] — pure application of a single path-addressed operation to a
//!   JSON document, returning a new document.
//! - [`PatchProcessor`] — owns a base snapshot plus a map of pending
//!   (unconfirmed) patches and composes them into the current computed view.

mod apply;
mod processor;

pub use apply::{apply_op, apply_patch};
pub use processor::PatchProcessor;
