//! stackline-state: durable ledgers for Stackline.
//!
//! Backed by [redb](https://docs.rs/redb), holds every piece of state the
//! deployment workflow shares between steps: deployment locks, build
//! records with their latest-build index, per-target deployment records,
//! and target configuration.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{env}|{repo}`, `{repo}|{env}|{build_id}`, ...) enable
//! prefix scans over a partition. Operations that touch more than one
//! record, or that must check before writing, run inside one write
//! transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod builds;
pub mod deployments;
pub mod error;
pub mod locks;
pub mod store;
pub mod tables;
pub mod targets;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
