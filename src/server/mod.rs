// Inbound HTTP: route table and axum handlers.

pub mod handler;
pub mod routes;
