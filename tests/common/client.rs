//! HTTP client for end-to-end tests
//!
//! When API routes or request formats change, update only this file.

use super::constants::*;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::time::Duration;

pub struct TestClient {
    pub client: reqwest::Client,
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    pub async fn get_jobs(&self) -> Response {
        self.client
            .get(format!("{}/api/jobs", self.base_url))
            .send()
            .await
            .expect("Get jobs request failed")
    }

    pub async fn search_jobs(&self, query: &[(&str, &str)]) -> Response {
        self.client
            .get(format!("{}/api/jobs/search", self.base_url))
            .query(query)
            .send()
            .await
            .expect("Search jobs request failed")
    }

    pub async fn get_job(&self, uuid: &str, logs: bool) -> Response {
        self.client
            .get(format!("{}/api/jobs/{}", self.base_url, uuid))
            .query(&[("logs", logs)])
            .send()
            .await
            .expect("Get job request failed")
    }

    pub async fn abort_job(&self, uuid: &str) -> Response {
        self.client
            .post(format!("{}/api/jobs/{}/abort", self.base_url, uuid))
            .send()
            .await
            .expect("Abort job request failed")
    }

    pub async fn cancel_job(&self, uuid: &str) -> Response {
        self.client
            .post(format!("{}/api/jobs/{}/cancel", self.base_url, uuid))
            .send()
            .await
            .expect("Cancel job request failed")
    }

    pub async fn trigger(&self, backup: &str, operation: &str, priority: Option<&str>) -> Response {
        let mut request = self
            .client
            .post(format!("{}/api/backups/{}/{}", self.base_url, backup, operation));
        if let Some(priority) = priority {
            request = request.query(&[("priority", priority)]);
        }
        request.send().await.expect("Trigger request failed")
    }

    pub async fn get_schedules(&self) -> Response {
        self.client
            .get(format!("{}/api/schedules", self.base_url))
            .send()
            .await
            .expect("Get schedules request failed")
    }

    pub async fn get_metrics(&self) -> Response {
        self.client
            .get(format!("{}/metrics", self.base_url))
            .send()
            .await
            .expect("Get metrics request failed")
    }

    /// Triggers an operation and returns the uuid of the resulting job.
    pub async fn trigger_job(&self, backup: &str, operation: &str, priority: Option<&str>) -> String {
        let response = self.trigger(backup, operation, priority).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let summary: Value = response.json().await.expect("Invalid job summary");
        summary["uuid"].as_str().expect("Missing job uuid").to_string()
    }

    /// Polls a job until it reaches `state`, returning its summary with run-logs.
    pub async fn wait_for_state(&self, uuid: &str, state: &str) -> Value {
        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(JOB_STATE_TIMEOUT_MS);
        loop {
            let summary: Value = self
                .get_job(uuid, true)
                .await
                .json()
                .await
                .expect("Invalid job summary");
            if summary["state"] == state {
                return summary;
            }
            if start.elapsed() > timeout {
                panic!("Job {} stuck in {} instead of {}", uuid, summary["state"], state);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
