pub mod claude;
pub mod embedder;
pub mod feed;
pub mod notify;
