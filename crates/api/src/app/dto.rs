use std::str::FromStr;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use atelier_core::{JobId, JobStatus, OwnerKind};
use atelier_infra::pipeline::SubmittedJob;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub owner_kind: OwnerKind,
    pub owner_ref: i64,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryRequest {
    pub job_ids: Vec<JobId>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedJobResponse {
    pub job_id: JobId,
    pub owner_kind: OwnerKind,
    pub owner_ref: i64,
    pub status: JobStatus,
}

impl From<&SubmittedJob> for SubmittedJobResponse {
    fn from(job: &SubmittedJob) -> Self {
        Self {
            job_id: job.job_id,
            owner_kind: job.owner.kind(),
            owner_ref: job.owner.id(),
            status: job.status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResponse {
    pub jobs: Vec<SubmittedJobResponse>,
}

impl SubmissionResponse {
    pub fn new(jobs: &[SubmittedJob]) -> Self {
        Self {
            jobs: jobs.iter().map(SubmittedJobResponse::from).collect(),
        }
    }
}

// -------------------------
// Path parsing
// -------------------------

/// Parse a path id, answering 400 with `code` when it is malformed.
pub fn parse_id<T: FromStr>(raw: &str, code: &'static str) -> Result<T, axum::response::Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, code, format!("malformed id: {raw}")))
}
