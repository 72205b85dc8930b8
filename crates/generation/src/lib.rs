//! `atelier-generation`
//!
//! **Responsibility:** boundary to the external AI inference service.
//!
//! This crate is intentionally **not** part of the pipeline's bookkeeping:
//! - It must not touch the job store or the queue.
//! - It must not mutate marketplace records.
//! - It turns a [`GenerationRequest`](atelier_core::GenerationRequest) into a
//!   content URL, or an error.

pub mod client;
pub mod error;
pub mod fake;
pub mod http;

pub use client::{GeneratedContent, GenerationClient};
pub use error::GenerationError;
pub use fake::FakeGenerationClient;
pub use http::HttpGenerationClient;
