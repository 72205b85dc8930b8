//! Job store: the single source of truth for what happened to each job.
//!
//! ## Components
//!
//! - `JobStore`: async persistence contract with monotonic transitions
//! - `InMemoryJobStore`: tests/dev
//! - `PostgresJobStore`: durable, one row per job

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
