//! Quota-bounded, rate-limited recording store behind an axum action endpoint.

pub mod error;
pub mod guard;
pub mod rate_limit;
pub mod request;
pub mod security;
pub mod server;
pub mod store;
