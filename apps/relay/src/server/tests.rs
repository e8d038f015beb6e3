use std::sync::Arc;

use anyhow::Result;
use assistants_client::RunStatus;
use axum::Router;
use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::{AppState, build_router};
use crate::config::Config;
use crate::config_store;
use crate::test_support::{StubApi, StubFailure};

fn test_state(api: &Arc<StubApi>, config: Config) -> AppState {
    AppState::new(config, api.clone(), config_store::memory())
}

async fn provisioned_app(api: &Arc<StubApi>) -> Result<Router> {
    provisioned_app_with(api, Config::for_tests()).await
}

async fn provisioned_app_with(api: &Arc<StubApi>, config: Config) -> Result<Router> {
    let state = test_state(api, config);
    state.provisioner().provision().await?;
    Ok(build_router(state))
}

fn json_request(method: &str, uri: &str, body: &Value) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body)?))?)
}

fn empty_request(method: &str, uri: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())?)
}

async fn read_json(response: axum::response::Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    let value = serde_json::from_slice::<Value>(&bytes)?;
    Ok(value)
}

async fn read_bytes(response: axum::response::Response) -> Result<Vec<u8>> {
    Ok(response.into_body().collect().await?.to_bytes().to_vec())
}

#[tokio::test]
async fn healthz_reports_service_and_store_backend() -> Result<()> {
    let api = StubApi::shared();
    let app = build_router(test_state(&api, Config::for_tests()));

    let response = app.oneshot(empty_request("GET", "/healthz")?).await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = read_json(response).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "interpreter-relay");
    assert_eq!(body["configStore"], "memory");
    Ok(())
}

#[tokio::test]
async fn readiness_follows_provisioning() -> Result<()> {
    let api = StubApi::shared();
    let state = test_state(&api, Config::for_tests());
    let app = build_router(state.clone());

    let before = app.clone().oneshot(empty_request("GET", "/readyz")?).await?;
    assert_eq!(before.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(read_json(before).await?["status"], "not_ready");

    state.provisioner().provision().await?;
    let after = app.oneshot(empty_request("GET", "/readyz")?).await?;
    assert_eq!(after.status(), StatusCode::OK);
    assert_eq!(read_json(after).await?["provisioned"], true);
    Ok(())
}

#[tokio::test]
async fn turn_before_provisioning_is_not_provisioned() -> Result<()> {
    let api = StubApi::shared();
    let app = build_router(test_state(&api, Config::for_tests()));

    let response = app
        .oneshot(json_request("POST", "/turn", &json!({ "message": "hi" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(read_json(response).await?["kind"], "not_provisioned");
    assert_eq!(api.calls("create_thread"), 0);
    Ok(())
}

#[tokio::test]
async fn turn_returns_normalized_result() -> Result<()> {
    let api = StubApi::shared();
    api.add_text_reply("4");
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(json_request(
            "POST",
            "/turn",
            &json!({ "message": "Calculate 2+2" }),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["message"], "4");
    assert_eq!(body["files"], json!([]));
    assert_eq!(body["annotationsConsumed"], false);
    assert!(body["threadId"].as_str().is_some_and(|id| !id.is_empty()));
    Ok(())
}

#[tokio::test]
async fn turn_surfaces_cited_files() -> Result<()> {
    let api = StubApi::shared();
    api.add_reply(json!([
        { "type": "image_file", "image_file": { "file_id": "file_plot" } },
        {
            "type": "text",
            "text": {
                "value": "Saved [data](sandbox:/mnt/data/out.csv)",
                "annotations": [{
                    "type": "file_path",
                    "text": "sandbox:/mnt/data/out.csv",
                    "file_path": { "file_id": "file_csv" },
                }],
            },
        },
    ]));
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(json_request("POST", "/turn", &json!({ "message": "plot" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["message"], "Saved [data]()");
    assert_eq!(body["files"][0]["fileId"], "file_plot");
    assert_eq!(body["files"][0]["kind"], "image");
    assert_eq!(body["files"][1]["fileId"], "file_csv");
    assert_eq!(body["files"][1]["displayName"], "out.csv");
    assert_eq!(body["files"][1]["kind"], "file");
    assert_eq!(body["annotationsConsumed"], true);
    Ok(())
}

#[tokio::test]
async fn malformed_turn_body_is_invalid_request() -> Result<()> {
    let api = StubApi::shared();
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(json_request("POST", "/turn", &json!({ "threadId": "thread_1" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await?["kind"], "invalid_request");
    Ok(())
}

#[tokio::test]
async fn exhausted_rate_limit_maps_to_429_with_thread() -> Result<()> {
    let api = StubApi::shared();
    api.fail("create_run", StubFailure::RateLimited, 10);
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(json_request("POST", "/turn", &json!({ "message": "hi" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = read_json(response).await?;
    assert_eq!(body["kind"], "rate_limited");
    assert!(body["threadId"].as_str().is_some());
    Ok(())
}

#[tokio::test]
async fn failed_run_maps_to_502_with_thread() -> Result<()> {
    let api = StubApi::shared();
    api.add_thread("thread_existing");
    api.set_run_statuses(&[RunStatus::Queued, RunStatus::InProgress, RunStatus::Failed]);
    api.set_run_error("server_error", "Sandbox crashed");
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(json_request(
            "POST",
            "/turn",
            &json!({ "message": "hi", "threadId": "thread_existing" }),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = read_json(response).await?;
    assert_eq!(body["kind"], "upstream_failed");
    assert_eq!(body["threadId"], "thread_existing");
    Ok(())
}

#[tokio::test]
async fn stalled_run_maps_to_504() -> Result<()> {
    let api = StubApi::shared();
    api.set_run_statuses(&[RunStatus::InProgress]);
    let mut config = Config::for_tests();
    config.poll_timeout_ms = 20;
    let app = provisioned_app_with(&api, config).await?;

    let response = app
        .oneshot(json_request("POST", "/turn", &json!({ "message": "hi" }))?)
        .await?;

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = read_json(response).await?;
    assert_eq!(body["kind"], "timeout");
    assert!(body["threadId"].as_str().is_some());
    Ok(())
}

#[tokio::test]
async fn slow_poll_still_answers_with_timeout_envelope() -> Result<()> {
    let api = StubApi::shared();
    api.set_run_statuses(&[RunStatus::InProgress]);
    api.set_poll_delay(std::time::Duration::from_millis(400));
    let mut config = Config::for_tests();
    config.poll_timeout_ms = 20;
    let app = provisioned_app_with(&api, config).await?;

    let started = std::time::Instant::now();
    let response = app
        .oneshot(json_request("POST", "/turn", &json!({ "message": "hi" }))?)
        .await?;

    assert!(started.elapsed() < std::time::Duration::from_millis(300));
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    let body = read_json(response).await?;
    assert_eq!(body["kind"], "timeout");
    assert!(body["threadId"].as_str().is_some());
    Ok(())
}

#[tokio::test]
async fn threads_can_be_created_and_listed() -> Result<()> {
    let api = StubApi::shared();
    api.add_text_reply("4");
    let app = provisioned_app(&api).await?;

    let created = app.clone().oneshot(empty_request("POST", "/threads")?).await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let thread_id = read_json(created).await?["threadId"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("missing threadId"))?;

    let turn = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/turn",
            &json!({ "message": "Calculate 2+2", "threadId": thread_id }),
        )?)
        .await?;
    assert_eq!(turn.status(), StatusCode::OK);

    let history = app
        .oneshot(empty_request(
            "GET",
            &format!("/threads/{thread_id}/messages"),
        )?)
        .await?;
    assert_eq!(history.status(), StatusCode::OK);
    let body = read_json(history).await?;
    assert_eq!(body["threadId"], thread_id.as_str());
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][1]["role"], "assistant");
    assert_eq!(body["messages"][1]["message"], "4");
    assert_eq!(api.calls("create_thread"), 1);
    Ok(())
}

#[tokio::test]
async fn upload_returns_token_estimate() -> Result<()> {
    let api = StubApi::shared();
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/files?filename=notes.txt")
                .body(Body::from("hello world"))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["filename"], "notes.txt");
    assert_eq!(body["sizeBytes"], 11);
    assert_eq!(body["estimatedTokens"], 2);
    assert_eq!(body["tokensEstimated"], false);
    assert_eq!(body["contentClass"], "text");

    let file_id = body["fileId"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing fileId"))?;
    let (filename, content) = api
        .uploaded(file_id)
        .ok_or_else(|| anyhow::anyhow!("upload not recorded"))?;
    assert_eq!(filename, "notes.txt");
    assert_eq!(&content[..], b"hello world");
    Ok(())
}

#[tokio::test]
async fn binary_upload_reports_size_based_estimate() -> Result<()> {
    let api = StubApi::shared();
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/files?filename=chart.png")
                .body(Body::from(vec![0_u8; 2048]))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await?;
    assert_eq!(body["estimatedTokens"], 500);
    assert_eq!(body["tokensEstimated"], true);
    assert_eq!(body["contentClass"], "binary");
    Ok(())
}

#[tokio::test]
async fn upload_without_filename_is_rejected() -> Result<()> {
    let api = StubApi::shared();
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/files")
                .body(Body::from("payload"))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response).await?["kind"], "invalid_request");
    assert_eq!(api.calls("upload_file"), 0);
    Ok(())
}

#[tokio::test]
async fn oversized_upload_is_rejected_before_upstream() -> Result<()> {
    let api = StubApi::shared();
    let mut config = Config::for_tests();
    config.max_upload_bytes = 16;
    let app = provisioned_app_with(&api, config).await?;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/files?filename=big.txt")
                .body(Body::from(vec![b'x'; 64]))?,
        )
        .await?;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(read_json(response).await?["kind"], "invalid_request");
    assert_eq!(api.calls("upload_file"), 0);
    Ok(())
}

#[tokio::test]
async fn file_download_streams_with_guessed_type() -> Result<()> {
    let api = StubApi::shared();
    api.add_file("file_report", "report.csv", b"x,y\n1,2\n");
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(empty_request("GET", "/files/file_report")?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "text/csv");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "inline; filename=\"report.csv\""
    );
    assert_eq!(response.headers()[CACHE_CONTROL], "public, max-age=3600");
    assert_eq!(read_bytes(response).await?, b"x,y\n1,2\n");
    Ok(())
}

#[tokio::test]
async fn container_file_download_uses_container_path() -> Result<()> {
    let api = StubApi::shared();
    api.add_container_file("cntr_1", "cfile_1", "/mnt/data/chart.png", b"\x89PNG");
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(empty_request("GET", "/files/cfile_1?containerId=cntr_1")?)
        .await?;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
    assert_eq!(
        response.headers()[CONTENT_DISPOSITION],
        "inline; filename=\"chart.png\""
    );
    assert_eq!(read_bytes(response).await?, b"\x89PNG");
    assert_eq!(api.calls("retrieve_file"), 0);
    Ok(())
}

#[tokio::test]
async fn missing_file_is_not_found() -> Result<()> {
    let api = StubApi::shared();
    let app = provisioned_app(&api).await?;

    let response = app
        .oneshot(empty_request("GET", "/files/file_missing")?)
        .await?;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(read_json(response).await?["kind"], "not_found");
    Ok(())
}

#[tokio::test]
async fn reprovision_reuses_or_forces_replacement() -> Result<()> {
    let api = StubApi::shared();
    let app = provisioned_app(&api).await?;

    let reused = app
        .clone()
        .oneshot(empty_request("POST", "/admin/assistant/reprovision")?)
        .await?;
    assert_eq!(reused.status(), StatusCode::OK);
    let reused = read_json(reused).await?;
    assert_eq!(reused["outcome"], "reused");
    assert_eq!(api.calls("create_assistant"), 1);

    let forced = app
        .oneshot(json_request(
            "POST",
            "/admin/assistant/reprovision",
            &json!({ "force": true }),
        )?)
        .await?;
    assert_eq!(forced.status(), StatusCode::OK);
    let forced = read_json(forced).await?;
    assert_eq!(forced["outcome"], "replaced");
    assert_ne!(forced["assistantId"], reused["assistantId"]);
    assert_eq!(api.calls("create_assistant"), 2);
    Ok(())
}

#[tokio::test]
async fn reprovision_creation_failure_is_upstream_failed() -> Result<()> {
    let api = StubApi::shared();
    let app = provisioned_app(&api).await?;
    api.fail("create_assistant", StubFailure::Rejected, 1);

    let response = app
        .oneshot(json_request(
            "POST",
            "/admin/assistant/reprovision",
            &json!({ "force": true }),
        )?)
        .await?;

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(read_json(response).await?["kind"], "upstream_failed");
    Ok(())
}
