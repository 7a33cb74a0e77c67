// Caching reverse proxy for Maven repositories with ordered mirror fallback.

pub mod config;
pub mod engine;
pub mod path;
pub mod server;
pub mod source;
