//! Persisted store for the issue pipeline.
//!
//! Every pipeline step reads and writes through [`IssueStore`]. All writes are
//! upserts or replace-by-issue operations so a step can be re-invoked without
//! duplicating records.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgIssueStore;
pub use store::{IssueStore, ResetStats};
