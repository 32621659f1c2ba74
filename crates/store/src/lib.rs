//! Client-side state for live job progress and optimistic field edits.
//!
//! - [`ProgressStore`] : keyed progress records fed by the connection
//!   layer, with per-key `watch` subscriptions and display smoothing.
//! - [`smoothing`] : the tick-driven animation step and pluggable
//!   [`TickSource`]s.
//! - [`resolver`] : merges a live record with an entity's persisted
//!   import snapshot into one displayable value.
//! - [`EntityCache`] : shared read cache of fetched entities.
//! - [`FieldMutationController`] : optimistic per-field writes with
//!   rollback.

pub mod entity_cache;
pub mod mutation;
pub mod progress;
pub mod resolver;
pub mod smoothing;

pub use entity_cache::{EntityCache, EntitySource, FieldState, FieldView};
pub use mutation::{FieldAck, FieldMutationController, FieldWrite, FieldWriteError, FieldWriter};
pub use progress::{ApplyOutcome, ProgressKey, ProgressRecord, ProgressStore, ProgressSubscription};
pub use resolver::{resolve, ProgressSource, ResolvedProgress};
pub use smoothing::{run_smoothing, IntervalTicks, ManualTicks, SmoothingConfig, TickSource};
