//! contextd - a long-lived context repository engine for AI coding agents.
//!
//! Sessions hold prioritized, categorized context items; items relate to
//! each other through a typed graph; checkpoints, branches, and merges give
//! a session history independent of the git repository it's tracking; and a
//! change-watcher subsystem lets callers long-poll for mutations instead of
//! re-querying on a timer.
//!
//! # Architecture
//!
//! - [`engine`] - the public `Engine` handle grouping every component
//! - [`session`] - session lifecycle
//! - [`repository`] - context item CRUD, batch operations, unified query
//! - [`relationships`] - the typed relationship graph
//! - [`checkpoint`] - checkpoint / branch / merge
//! - [`compression`] - age-based compaction into summarized buckets
//! - [`journal`] - journal entries and the cross-entity timeline
//! - [`watcher`] - the change-watcher subsystem
//! - [`storage`] - the SQLite driver, schema, migrations, and audit events
//! - [`config`] - configuration resolution
//! - [`channel`] - channel name derivation and normalization
//! - [`validate`] - input validation and sanitization
//! - [`error`] - error types and handling
//!
//! Everything above this crate (the `contextd` binary, or any other host
//! process) talks to a single [`Engine`] handle and nothing lower.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod checkpoint;
pub mod compression;
pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod model;
pub mod relationships;
pub mod repository;
pub mod session;
pub mod storage;
pub mod validate;
pub mod watcher;

pub use engine::Engine;
pub use error::{Error, ErrorCode, Result};
