//! Application wiring for the vidshelf live layer.
//!
//! - [`config`] - environment configuration.
//! - [`context`] - the [`LiveContext`] service container with the
//!   presentation-facing `use_progress` / `set_field` API.

pub mod config;
pub mod context;

pub use config::{AppConfig, ConfigError};
pub use context::{LiveContext, ProgressView, Services};
