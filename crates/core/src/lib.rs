//! `atelier-core` — domain building blocks for the generation pipeline.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the job state machine, and the payloads sent to the
//! inference service.

pub mod error;
pub mod id;
pub mod job;
pub mod payload;

pub use error::{DomainError, DomainResult};
pub use id::{ArtistId, JobId, ProductId, ProductMediaId};
pub use job::{Job, JobStatus, OwnerKind, OwnerRef, TransitionError};
pub use payload::{BackgroundRequest, GenerationRequest, ProfessionalShootRequest};
