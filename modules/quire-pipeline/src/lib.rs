//! Issue assembly pipeline: ingest, score, deduplicate, generate, allocate,
//! and finalize one newsletter issue.

pub mod allocation;
pub mod dedup;
pub mod deps;
pub mod finalize;
pub mod generation;
pub mod infra;
pub mod ingest;
pub mod orchestrator;
pub mod scoring;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use deps::PipelineDeps;
pub use orchestrator::{Orchestrator, PipelineReport};
