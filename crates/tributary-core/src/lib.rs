//! # Tributary Core
//!
//! Runtime-agnostic logic of the Tributary synchronization engine: data
//! models, error taxonomy, storage traits, the connector contract, and the
//! Token Refresher, Merge Engine and Deletion Reconciler.
//!
//! This crate contains no tokio, sqlx, HTTP client or other native-only
//! dependencies. The `tributary` crate supplies the SQLite store, the
//! provider connectors and the orchestrator.

pub mod connector;
pub mod error;
pub mod merge;
pub mod models;
pub mod reconcile;
pub mod store;
pub mod token;

pub use error::{ConnectorError, SyncError};
