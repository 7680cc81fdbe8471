//! Persistence for the pipeline: source catalog, staging, and curated facts.
//!
//! Every tenant-facing operation takes an explicit `OrgId`; the only
//! cross-tenant entry point is `SourceCatalog::list_recurring_sources`,
//! used by scheduler discovery.

pub mod memory;
pub mod models;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryPipelineDb;
pub use sqlite::SqlitePipelineDb;
