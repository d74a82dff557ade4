pub mod config;
pub mod error;
pub mod fingerprint;
pub mod types;

pub use config::{Config, PipelineSettings};
pub use error::{QuireError, Result};
pub use types::*;
