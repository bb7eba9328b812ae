//! Offline-first sync core for a point-of-sale client.
//!
//! [`db::EntityStore`] is the on-device store: every local mutation commits
//! together with an outbox entry. [`sync`] pushes those entries to the
//! server in order, pulls server state back without echoing it, and applies
//! server notifications exactly once.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sync;

pub use error::{StoreError, SyncError};
