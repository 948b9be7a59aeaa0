//! End-to-end tests for the jobs API
//!
//! TestServer::spawn() starts a daemon with one backup ("home") whose operations run real
//! shell commands, with a concurrency of 1.

#![cfg(unix)]

mod common;

use common::{TestClient, TestServer, BACKUP_NAME, OP_BACKUP, OP_FAILING, OP_SLOW};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

/// Aborts a job, retrying while the executor has not yet hooked up cancellation.
async fn abort_when_possible(client: &TestClient, uuid: &str) {
    for _ in 0..200 {
        let response = client.abort_job(uuid).await;
        match response.status() {
            StatusCode::OK => return,
            StatusCode::CONFLICT => tokio::time::sleep(Duration::from_millis(20)).await,
            status => panic!("Unexpected abort status {}", status),
        }
    }
    panic!("Job {} could not be aborted", uuid);
}

fn log_messages(summary: &Value) -> Vec<String> {
    summary["run_logs"]
        .as_array()
        .expect("Missing run_logs")
        .iter()
        .map(|entry| entry["message"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_successful_operation() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let uuid = client.trigger_job(BACKUP_NAME, OP_BACKUP, None).await;
    let summary = client.wait_for_state(&uuid, "success").await;

    assert_eq!(summary["operation"], OP_BACKUP);
    assert_eq!(summary["trigger"], "api");
    assert_eq!(summary["subjects"]["backup"], BACKUP_NAME);
    assert_eq!(summary["subjects"]["repository"], "local");
    assert!(summary["started_at"].is_string());
    assert!(summary["ended_at"].is_string());
    assert!(summary.get("error").is_none());
    assert!(log_messages(&summary).contains(&"snapshot saved".to_string()));

    let jobs: Value = client.get_jobs().await.json().await.unwrap();
    assert_eq!(jobs["archived"].as_array().unwrap().len(), 1);
    assert!(jobs["archived"][0].get("run_logs").is_none());
}

#[tokio::test]
async fn test_failing_operation() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let uuid = client.trigger_job(BACKUP_NAME, OP_FAILING, None).await;
    let summary = client.wait_for_state(&uuid, "failure").await;

    assert!(summary["error"]
        .as_str()
        .unwrap()
        .contains("exited with code 3"));
    let warnings: Vec<&Value> = summary["run_logs"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|entry| entry["level"] == "warn")
        .collect();
    assert!(warnings
        .iter()
        .any(|entry| entry["message"] == "corrupted pack"));
}

#[tokio::test]
async fn test_abort_running_operation() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let uuid = client.trigger_job(BACKUP_NAME, OP_SLOW, None).await;
    client.wait_for_state(&uuid, "running").await;

    let found: Value = client
        .search_jobs(&[("run_state", "running"), ("operation", OP_SLOW), ("repository", "local")])
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(found[0]["uuid"], uuid.as_str());

    abort_when_possible(&client, &uuid).await;
    let summary = client.wait_for_state(&uuid, "aborted").await;
    assert!(summary.get("error").is_none());

    // Aborting a finished job is a no-op
    assert_eq!(client.abort_job(&uuid).await.status(), StatusCode::OK);
    assert_eq!(client.cancel_job(&uuid).await.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_queued_requests_are_deduplicated() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    // Occupies the only slot
    let slow = client.trigger_job(BACKUP_NAME, OP_SLOW, None).await;
    client.wait_for_state(&slow, "running").await;

    let first = client.trigger_job(BACKUP_NAME, OP_BACKUP, None).await;
    let second = client.trigger_job(BACKUP_NAME, OP_BACKUP, Some("normal")).await;
    assert_eq!(first, second);

    let bumped = client
        .trigger_job(BACKUP_NAME, OP_BACKUP, Some("immediate"))
        .await;
    assert_ne!(first, bumped);
    client.wait_for_state(&first, "canceled").await;

    let jobs: Value = client.get_jobs().await.json().await.unwrap();
    let queued = jobs["queued"].as_array().unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0]["uuid"], bumped.as_str());
    assert_eq!(queued[0]["priority"], "immediate");

    abort_when_possible(&client, &slow).await;
    client.wait_for_state(&bumped, "success").await;
}

#[tokio::test]
async fn test_cancel_queued_operation() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let slow = client.trigger_job(BACKUP_NAME, OP_SLOW, None).await;
    client.wait_for_state(&slow, "running").await;
    let queued = client.trigger_job(BACKUP_NAME, OP_BACKUP, None).await;

    let response = client.cancel_job(&queued).await;
    assert_eq!(response.status(), StatusCode::OK);
    let summary: Value = response.json().await.unwrap();
    assert_eq!(summary["state"], "canceled");

    // Running jobs can only be aborted
    assert_eq!(client.cancel_job(&slow).await.status(), StatusCode::CONFLICT);

    let jobs: Value = client.get_jobs().await.json().await.unwrap();
    assert!(jobs["queued"].as_array().unwrap().is_empty());
    assert_eq!(jobs["archived"][0]["uuid"], queued.as_str());
}

#[tokio::test]
async fn test_rejected_requests() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let response = client.trigger("work", OP_BACKUP, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.trigger(BACKUP_NAME, "restore", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.trigger(BACKUP_NAME, OP_BACKUP, Some("asap")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client.get_job("00000000-0000-0000-0000-000000000000", false).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client.abort_job("nope").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_schedules_and_metrics() {
    let server = TestServer::spawn().await;
    let client = TestClient::new(server.base_url.clone());

    let schedules: Value = client.get_schedules().await.json().await.unwrap();
    let schedules = schedules.as_array().unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0]["operation"], OP_BACKUP);
    assert_eq!(schedules[0]["schedules"][0], "0 3 * * *");
    assert!(schedules[0]["next_run_at"].is_string());

    let uuid = client.trigger_job(BACKUP_NAME, OP_BACKUP, None).await;
    client.wait_for_state(&uuid, "success").await;

    let response = client.get_metrics().await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains("backupd_jobs_finished_total"));
    assert!(body.contains("backupd_jobs_running"));
}
