//! Bounded, cancellable polling loops.
//!
//! Interval, deadline and cancellation are arms of one `select!`, so whichever
//! fires first ends the operation and nothing keeps ticking afterwards.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use atelier_core::{JobId, JobStatus};

use crate::source::{JobSnapshot, StatusSource};

/// How often to ask, and for how long in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL, Self::DEFAULT_TIMEOUT)
    }
}

/// How polling a single job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    Completed { result_url: String },
    Failed { reason: Option<String> },
    /// The cap ran out. The job may still finish server-side.
    TimedOut { last_status: Option<JobStatus> },
    Cancelled,
    /// The server has no record of this id.
    NotFound,
}

impl PollOutcome {
    pub fn is_terminal_job_state(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed { result_url } => write!(f, "generation completed: {result_url}"),
            Self::Failed { reason: Some(reason) } => write!(f, "generation failed: {reason}"),
            Self::Failed { reason: None } => f.write_str("generation failed"),
            Self::TimedOut { .. } => f.write_str("generation taking longer than expected"),
            Self::Cancelled => f.write_str("polling cancelled"),
            Self::NotFound => f.write_str("job not found"),
        }
    }
}

fn ticker(policy: &PollPolicy) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Poll one job until it is COMPLETED or FAILED, the policy's timeout
/// elapses, or `cancel` fires.
///
/// Failed lookups are logged and retried on the next tick; only the timeout
/// bounds how long that goes on.
pub async fn poll_job(
    source: &dyn StatusSource,
    id: JobId,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> PollOutcome {
    let mut ticker = ticker(policy);
    let deadline = tokio::time::sleep(policy.timeout);
    tokio::pin!(deadline);
    let mut last_status = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = &mut deadline => {
                info!(job_id = %id, last_status = ?last_status, "polling timed out");
                return PollOutcome::TimedOut { last_status };
            }
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = &mut deadline => {
                info!(job_id = %id, last_status = ?last_status, "polling timed out");
                return PollOutcome::TimedOut { last_status };
            }
            fetched = source.fetch(id) => fetched,
        };

        match fetched {
            Ok(Some(snapshot)) => {
                last_status = Some(snapshot.status);
                if let Some(outcome) = terminal_outcome(snapshot) {
                    return outcome;
                }
            }
            Ok(None) => return PollOutcome::NotFound,
            Err(e) => warn!(job_id = %id, error = %e, "status lookup failed, retrying"),
        }
    }
}

fn terminal_outcome(snapshot: JobSnapshot) -> Option<PollOutcome> {
    match snapshot.status {
        JobStatus::Pending => None,
        JobStatus::Completed => match snapshot.result_url {
            Some(result_url) => Some(PollOutcome::Completed { result_url }),
            None => {
                warn!(job_id = %snapshot.id, "COMPLETED job without a result url");
                Some(PollOutcome::Failed {
                    reason: Some("completed without a result".to_string()),
                })
            }
        },
        JobStatus::Failed => Some(PollOutcome::Failed {
            reason: snapshot.failure,
        }),
    }
}

/// Why a batch poll stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchEnd {
    /// Every id reached a terminal state or was reported unknown.
    Settled,
    TimedOut,
    Cancelled,
}

/// Per-job results of polling a batch, with each state counted explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub completed: Vec<(JobId, String)>,
    pub failed: Vec<(JobId, Option<String>)>,
    pub pending: Vec<JobId>,
    pub missing: Vec<JobId>,
    pub end: BatchEnd,
}

impl BatchOutcome {
    /// True only if every job was seen COMPLETED.
    pub fn all_completed(&self) -> bool {
        !self.completed.is_empty() && self.failed.is_empty() && self.pending.is_empty() && self.missing.is_empty()
    }

    pub fn is_settled(&self) -> bool {
        self.pending.is_empty() && self.missing.is_empty()
    }
}

/// Poll several jobs on one shared ticker and deadline.
///
/// Each tick re-queries only the ids still PENDING. One job failing does not
/// stop the others from being followed.
pub async fn poll_batch(
    source: &dyn StatusSource,
    ids: &[JobId],
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> BatchOutcome {
    let mut outcome = BatchOutcome {
        completed: Vec::new(),
        failed: Vec::new(),
        pending: Vec::new(),
        missing: Vec::new(),
        end: BatchEnd::Settled,
    };
    let mut waiting: BTreeSet<JobId> = ids.iter().copied().collect();

    let mut ticker = ticker(policy);
    let deadline = tokio::time::sleep(policy.timeout);
    tokio::pin!(deadline);

    'poll: while !waiting.is_empty() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome.end = BatchEnd::Cancelled;
                break;
            }
            _ = &mut deadline => {
                outcome.end = BatchEnd::TimedOut;
                break;
            }
            _ = ticker.tick() => {}
        }

        for id in waiting.clone() {
            // a slow lookup must not carry the batch past the cap
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome.end = BatchEnd::Cancelled;
                    break 'poll;
                }
                _ = &mut deadline => {
                    outcome.end = BatchEnd::TimedOut;
                    break 'poll;
                }
                fetched = source.fetch(id) => fetched,
            };
            match fetched {
                Ok(Some(snapshot)) => match terminal_outcome(snapshot) {
                    Some(PollOutcome::Completed { result_url }) => {
                        waiting.remove(&id);
                        outcome.completed.push((id, result_url));
                    }
                    Some(PollOutcome::Failed { reason }) => {
                        waiting.remove(&id);
                        outcome.failed.push((id, reason));
                    }
                    _ => {}
                },
                Ok(None) => {
                    waiting.remove(&id);
                    outcome.missing.push(id);
                }
                Err(e) => warn!(job_id = %id, error = %e, "status lookup failed, retrying"),
            }
        }
        debug!(remaining = waiting.len(), "batch poll tick");
    }

    outcome.pending = waiting.into_iter().collect();
    if outcome.end != BatchEnd::Settled {
        info!(end = ?outcome.end, pending = outcome.pending.len(), "batch polling stopped early");
    }
    outcome
}
