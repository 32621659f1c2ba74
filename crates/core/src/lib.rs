//! Shared domain types for the vidshelf live-progress layer.
//!
//! Everything that crosses a crate boundary lives here: identifier
//! aliases, the [`progress::ProgressEvent`] wire shape, per-field
//! values, entity snapshots and the lenient coercion helpers that keep
//! malformed server payloads from ever reaching the UI as errors.

pub mod entity;
pub mod error;
pub mod fields;
pub mod progress;
pub mod types;
pub mod wire;
