//! Client-side job polling.
//!
//! Polls the status endpoint on a fixed interval until the job reaches a
//! terminal state, a hard wall-clock cap runs out, or the caller cancels.
//! A timeout is reported as such; it says nothing about the job's eventual
//! outcome, which stays whatever the server records.

mod error;
mod poll;
mod source;

pub use error::PollError;
pub use poll::{BatchEnd, BatchOutcome, PollOutcome, PollPolicy, poll_batch, poll_job};
pub use source::{HttpStatusSource, JobSnapshot, StatusSource};
