//! SQLite storage layer for the context repository engine.
//!
//! - [`events`] — audit event storage, one row per mutation.
//! - [`schema`] — table/index/trigger definitions and `apply_schema`.
//! - [`migrations`] — versioned schema migrations beyond the baseline.
//! - [`driver`] — connection lifetime, PRAGMAs, and the `mutate()` transaction
//!   discipline every component module writes through.

pub mod driver;
pub mod events;
pub mod migrations;
pub mod schema;

pub use driver::{ChangeContext, ChangeDelta, Driver};
