use crate::jobs::JobState;
use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all backupd metrics
const PREFIX: &str = "backupd";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref JOBS_FINISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_jobs_finished_total"), "Jobs that reached a terminal state"),
        &["operation", "state"]
    ).expect("Failed to create jobs_finished_total metric");

    pub static ref JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_job_duration_seconds"),
            "Time between a job starting and settling"
        )
        .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 21600.0]),
        &["operation"]
    ).expect("Failed to create job_duration_seconds metric");

    pub static ref JOBS_QUEUED: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_queued"),
        "Jobs waiting in the run queue"
    ).expect("Failed to create jobs_queued metric");

    pub static ref JOBS_RUNNING: Gauge = Gauge::new(
        format!("{PREFIX}_jobs_running"),
        "Jobs currently running"
    ).expect("Failed to create jobs_running metric");

    pub static ref TRIGGER_FIRES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_trigger_fires_total"), "Scheduler and watcher firings"),
        &["trigger"]
    ).expect("Failed to create trigger_fires_total metric");
}

pub fn init_metrics() {
    // Ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(JOBS_FINISHED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_QUEUED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RUNNING.clone()));
    let _ = REGISTRY.register(Box::new(TRIGGER_FIRES_TOTAL.clone()));
}

/// Record a job reaching a terminal state. Canceled jobs never ran, so no duration is observed.
pub fn record_job_finished(operation: &str, state: JobState, duration: Duration) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[operation, state.as_str()])
        .inc();

    if state != JobState::Canceled {
        JOB_DURATION_SECONDS
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }
}

pub fn set_jobs_gauges(queued: usize, running: usize) {
    JOBS_QUEUED.set(queued as f64);
    JOBS_RUNNING.set(running as f64);
}

pub fn record_trigger_fire(trigger: &str) {
    TRIGGER_FIRES_TOTAL.with_label_values(&[trigger]).inc();
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
