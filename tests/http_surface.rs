use std::sync::Arc;

use axum_test::TestServer;
use plexbeam_worker::build_app;
use plexbeam_worker::config::{Accelerator, Config};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn test_config(temp_dir: std::path::PathBuf, api_key: Option<String>) -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 0,
        ffmpeg_path: "plexbeam-worker-test-ffmpeg-does-not-exist".into(),
        ffprobe_path: "plexbeam-worker-test-ffprobe-does-not-exist".into(),
        accelerator: Accelerator::None,
        device: None,
        qsv_preset: "veryfast".into(),
        qsv_quality: 25,
        qsv_low_power: true,
        nvenc_preset: "p1".into(),
        nvenc_tune: "ull".into(),
        nvenc_gpu: 0,
        temp_dir,
        log_dir: std::env::temp_dir(),
        shared_output_dir: None,
        path_mappings: vec![],
        max_concurrent_jobs: 1,
        job_timeout: 3600,
        segment_timeout: 30,
        beam_max_bitrate: None,
        cleanup_temp_after_hours: 24,
        log_ffmpeg_output: true,
        api_key,
        ffmpeg_major_version: None,
    }
}

async fn server_with(api_key: Option<String>) -> (TestServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(test_config(dir.path().to_path_buf(), api_key));
    let app = build_app(config, CancellationToken::new()).await.unwrap();
    (TestServer::new(app).unwrap(), dir)
}

#[tokio::test]
async fn health_check_does_not_require_auth_and_reports_ffmpeg_status() {
    let (server, _dir) = server_with(None).await;
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["ffmpeg_ok"], false);
}

#[tokio::test]
async fn status_for_unknown_job_is_404() {
    let (server, _dir) = server_with(None).await;
    let response = server.get("/status/does-not-exist").await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn jobs_list_starts_empty() {
    let (server, _dir) = server_with(None).await;
    let response = server.get("/jobs").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn protected_endpoint_rejects_missing_or_wrong_api_key() {
    let (server, _dir) = server_with(Some("s3cret".into())).await;

    let no_key = server
        .delete("/job/anything")
        .await;
    no_key.assert_status_unauthorized();

    let wrong_key = server
        .delete("/job/anything")
        .add_header("x-api-key", "nope")
        .await;
    wrong_key.assert_status_unauthorized();
}

#[tokio::test]
async fn protected_endpoint_accepts_matching_api_key() {
    let (server, _dir) = server_with(Some("s3cret".into())).await;
    // The job doesn't exist, but a correct key must get past the auth gate
    // and reach the handler, which then reports 404 rather than 401.
    let response = server
        .delete("/job/anything")
        .add_header("x-api-key", "s3cret")
        .await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn unauthenticated_get_endpoints_are_not_gated_by_api_key() {
    let (server, _dir) = server_with(Some("s3cret".into())).await;
    let response = server.get("/health").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn submitting_a_transcode_job_eventually_fails_when_ffmpeg_is_unreachable() {
    let (server, _dir) = server_with(None).await;
    let response = server
        .post("/transcode")
        .json(&json!({
            "job_id": "job-abc",
            "input": {"type": "file", "path": "/media/movie.mkv"},
            "output": {"type": "dash"},
            "arguments": {"raw_args": ["-i", "/media/movie.mkv", "-f", "dash", "dash"]},
            "source": "upstream-B",
        }))
        .await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["job_id"], "job-abc");

    let mut last_status = String::new();
    for _ in 0..50 {
        let status_response = server.get("/status/job-abc").await;
        status_response.assert_status_ok();
        let status_body: serde_json::Value = status_response.json();
        last_status = status_body["status"].as_str().unwrap().to_string();
        if last_status == "failed" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(last_status, "failed");
}

#[tokio::test]
async fn transcode_request_with_unknown_source_dialect_is_rejected() {
    let (server, _dir) = server_with(None).await;
    let response = server
        .post("/transcode")
        .json(&json!({
            "job_id": "job-bad-dialect",
            "input": {"type": "file", "path": "/media/movie.mkv"},
            "output": {"type": "dash"},
            "arguments": {"raw_args": []},
            "source": "not-a-real-dialect",
        }))
        .await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn serving_a_segment_with_an_encoded_path_traversal_filename_is_rejected() {
    let (server, _dir) = server_with(None).await;
    let response = server.get("/segments/some-job/%2e%2e%2Fetc%2Fpasswd").await;
    response.assert_status_bad_request();
}

#[tokio::test]
async fn listing_segments_for_unknown_job_is_404() {
    let (server, _dir) = server_with(None).await;
    let response = server.get("/beam/segments/does-not-exist").await;
    response.assert_status_not_found();
}
