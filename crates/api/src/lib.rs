//! HTTP access to the video library server.
//!
//! [`LibraryApi`] implements the seams the client state depends on:
//! [`vidshelf_store::FieldWriter`] for optimistic edits,
//! [`vidshelf_store::EntitySource`] for cache seeding and
//! [`vidshelf_stream::HistorySource`] for replay after a reconnect.

pub mod client;
mod sources;

pub use client::{ApiError, LibraryApi};
