//! Infrastructure layer: job stores, durable queue, marketplace access,
//! configuration, and the pipeline that ties them together.

pub mod config;
pub mod jobs;
pub mod marketplace;
pub mod pipeline;
pub mod queue;

#[cfg(test)]
mod integration_tests;
