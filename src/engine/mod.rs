// Caching engine.

pub mod cache;
pub mod downloader;
pub mod inflight;
pub mod stats;
