// Upstream side: mirror list and the shared outbound client pool.

pub mod http_source;
pub mod mirror;
pub mod traits;
