//! HTTP API: job submission, status lookups and health checks.

pub mod app;
pub mod middleware;
