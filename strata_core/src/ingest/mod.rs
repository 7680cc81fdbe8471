//! Ingestion: source configuration, job run lifecycle, and recurring scheduling.
//!
//! - `engine` drives one run from connector to curated facts
//! - `schedule` discovers due recurring sources and feeds a worker pool
//! - every run is recorded in the `SourceCatalog` audit trail

pub mod engine;
pub mod models;
pub mod schedule;
pub mod traits;
