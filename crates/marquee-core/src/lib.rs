//! Core domain model and storage for marquee.
//!
//! This crate defines the ingestion-run model (normalized source sets,
//! validators), the SQLite schema, and the idempotency ledger that keeps
//! the same external record from being ingested twice on the same day.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod error;
pub mod ledger;
pub mod model;
pub mod schema;

pub use error::{Error, Result};
pub use ledger::RunLedger;
pub use model::{IngestionRun, SourceSet, Validators};
pub use schema::Database;
