//! HTTP server exposing worker status.
//!
//! - [`status_api`]: response types and route handlers

pub mod status_api;
