use std::net::SocketAddr;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use serde_json::{Value, json};
use smartfolder_core::{MetascanClient, RemoteError, RemoteId, ScanService, Verdict};

const GOOD_KEY: &str = "test-key";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("apikey")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|key| key == GOOD_KEY)
}

async fn upload(headers: HeaderMap, body: Bytes) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let name = headers
        .get("filename")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if body.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(Json(json!({ "data_id": format!("id-{name}") })))
}

async fn status(headers: HeaderMap, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let body = match id.as_str() {
        "id-clean.txt" => json!({
            "scan_results": {
                "in_queue": 0,
                "progress_percentage": 100,
                "scan_all_result_i": 0,
                "scan_all_result_a": "No threat detected"
            }
        }),
        "id-queued.txt" => json!({
            "scan_results": {
                "in_queue": "4",
                "progress_percentage": "0",
                "scan_all_result_i": "0",
                "scan_all_result_a": ""
            }
        }),
        "id-eicar.com" => json!({
            "scan_results": {
                "in_queue": 0,
                "progress_percentage": 100,
                "scan_all_result_i": 1,
                "scan_all_result_a": "Infected"
            }
        }),
        _ => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    };
    Ok(Json(body))
}

async fn serve() -> SocketAddr {
    let app = Router::new()
        .route("/v1/file", post(upload))
        .route("/v1/file/{id}", get(status));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn client() -> MetascanClient {
    let addr = serve().await;
    MetascanClient::new(format!("http://{addr}/v1/file"), Some(Duration::from_secs(5))).unwrap()
}

#[tokio::test]
async fn upload_then_poll_clean_file() {
    let client = client().await;

    let remote_id = client
        .submit(b"hello".to_vec(), "clean.txt", GOOD_KEY)
        .await
        .unwrap();
    assert_eq!(remote_id.as_str(), "id-clean.txt");

    let result = client.poll(&remote_id, GOOD_KEY).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(result.verdict(), Verdict::Clean);
    assert_eq!(result.result_label, "No threat detected");
}

#[tokio::test]
async fn queued_scan_reports_progress_from_strings() {
    let client = client().await;
    let result = client
        .poll(&RemoteId::new("id-queued.txt").unwrap(), GOOD_KEY)
        .await
        .unwrap();
    assert_eq!(result.queue_position, 4);
    assert!(!result.is_complete());
}

#[tokio::test]
async fn infected_code_is_not_clean() {
    let client = client().await;
    let result = client
        .poll(&RemoteId::new("id-eicar.com").unwrap(), GOOD_KEY)
        .await
        .unwrap();
    assert_eq!(result.verdict(), Verdict::Infected);
}

#[tokio::test]
async fn bad_key_is_unauthorized_for_both_calls() {
    let client = client().await;
    let upload = client.submit(b"x".to_vec(), "clean.txt", "nope").await;
    assert!(matches!(upload, Err(RemoteError::Unauthorized)));

    let poll = client
        .poll(&RemoteId::new("id-clean.txt").unwrap(), "nope")
        .await;
    assert!(matches!(poll, Err(RemoteError::Unauthorized)));
}

#[tokio::test]
async fn other_statuses_are_transient() {
    let client = client().await;
    let poll = client
        .poll(&RemoteId::new("id-missing").unwrap(), GOOD_KEY)
        .await;
    assert!(matches!(poll, Err(RemoteError::Status(500))));
    assert!(!poll.unwrap_err().is_unauthorized());
}
