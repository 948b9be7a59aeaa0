//! Jobs HTTP routes.
//!
//! Provides endpoints for:
//! - Listing and searching jobs by run-state, operation and subjects
//! - Aborting running jobs and canceling queued ones
//! - Requesting an operation of a configured backup

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::jobs::{Job, JobCriteria, JobError, JobSummary, Priority, RunState, Subjects, Trigger};
use crate::server::state::{GuardedDaemon, ServerState};

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    #[serde(default)]
    pub logs: bool,
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    pub priority: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobsByRunStateResponse {
    pub queued: Vec<JobSummary>,
    pub running: Vec<JobSummary>,
    pub archived: Vec<JobSummary>,
}

/// Reserved keys of the search query string; every other key is a subject tag.
const SEARCH_OPERATION: &str = "operation";
const SEARCH_RUN_STATE: &str = "run_state";
const SEARCH_LOGS: &str = "logs";

fn job_error_response(e: JobError) -> Response {
    let status = match &e {
        JobError::UnknownJob(_) => StatusCode::NOT_FOUND,
        JobError::InvalidPriority(_) => StatusCode::BAD_REQUEST,
        JobError::AlreadyStarted(_)
        | JobError::InvalidState { .. }
        | JobError::AbortNotSupported(_) => StatusCode::CONFLICT,
        JobError::OperationFailure(_) | JobError::Canceled | JobError::Aborted => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string()).into_response()
}

fn parse_uuid(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("Invalid job id: {}", raw)).into_response())
}

fn summarize(jobs: &[Arc<Job>]) -> Vec<JobSummary> {
    jobs.iter().map(|job| job.to_summary(false)).collect()
}

/// GET /api/jobs
async fn get_jobs(State(daemon): State<GuardedDaemon>) -> impl IntoResponse {
    let jobs = daemon.service().registry().get_jobs_by_run_state();
    Json(JobsByRunStateResponse {
        queued: summarize(&jobs.queued),
        running: summarize(&jobs.running),
        archived: summarize(&jobs.archived),
    })
}

/// GET /api/jobs/search?operation=backup&run_state=archived&backup=home
async fn search_jobs(
    State(daemon): State<GuardedDaemon>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Response {
    let run_state = match params.remove(SEARCH_RUN_STATE) {
        Some(raw) => match raw.parse::<RunState>() {
            Ok(run_state) => Some(run_state),
            Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
        },
        None => None,
    };
    let include_logs = params
        .remove(SEARCH_LOGS)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let operation = params.remove(SEARCH_OPERATION);
    let subjects: Subjects = params.into_iter().collect();

    let criteria = JobCriteria {
        run_state,
        operation,
        subjects,
    };
    debug!("Searching jobs with {:?}", criteria);
    let summaries: Vec<JobSummary> = daemon
        .service()
        .registry()
        .find_jobs(&criteria)
        .iter()
        .map(|job| job.to_summary(include_logs))
        .collect();
    Json(summaries).into_response()
}

/// GET /api/jobs/{uuid}?logs=true
async fn get_job(
    State(daemon): State<GuardedDaemon>,
    Path(id): Path<String>,
    Query(query): Query<JobQuery>,
) -> Response {
    let uuid = match parse_uuid(&id) {
        Ok(uuid) => uuid,
        Err(response) => return response,
    };
    match daemon.service().get_job(uuid) {
        Ok(job) => Json(job.to_summary(query.logs)).into_response(),
        Err(e) => job_error_response(e),
    }
}

/// POST /api/jobs/{uuid}/abort
async fn abort_job(State(daemon): State<GuardedDaemon>, Path(id): Path<String>) -> Response {
    let uuid = match parse_uuid(&id) {
        Ok(uuid) => uuid,
        Err(response) => return response,
    };
    match daemon.service().abort(uuid) {
        Ok(job) => Json(job.to_summary(false)).into_response(),
        Err(e) => {
            warn!("Failed to abort job {}: {}", uuid, e);
            job_error_response(e)
        }
    }
}

/// POST /api/jobs/{uuid}/cancel
async fn cancel_job(State(daemon): State<GuardedDaemon>, Path(id): Path<String>) -> Response {
    let uuid = match parse_uuid(&id) {
        Ok(uuid) => uuid,
        Err(response) => return response,
    };
    match daemon.service().cancel(uuid) {
        Ok(job) => Json(job.to_summary(false)).into_response(),
        Err(e) => {
            warn!("Failed to cancel job {}: {}", uuid, e);
            job_error_response(e)
        }
    }
}

/// POST /api/backups/{name}/{operation}?priority=immediate
async fn trigger_operation(
    State(daemon): State<GuardedDaemon>,
    Path((backup, operation)): Path<(String, String)>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    let priority = match query.priority.as_deref().map(str::parse::<Priority>) {
        Some(Ok(priority)) => Some(priority),
        Some(Err(e)) => return job_error_response(e),
        None => None,
    };

    match daemon.trigger(&backup, &operation, Trigger::Api, priority) {
        Ok(Some(job)) => (StatusCode::ACCEPTED, Json(job.to_summary(false))).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            debug!("Rejected operation request: {}", e);
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
    }
}

/// GET /api/schedules
async fn get_schedules(State(daemon): State<GuardedDaemon>) -> impl IntoResponse {
    Json(daemon.schedules())
}

pub fn job_routes(state: ServerState) -> Router {
    Router::new()
        .route("/jobs", get(get_jobs))
        .route("/jobs/search", get(search_jobs))
        .route("/jobs/{uuid}", get(get_job))
        .route("/jobs/{uuid}/abort", post(abort_job))
        .route("/jobs/{uuid}/cancel", post(cancel_job))
        .route("/backups/{name}/{operation}", post(trigger_operation))
        .route("/schedules", get(get_schedules))
        .with_state(state)
}
