//! A full task run against an in-process queue

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tcproxy_core::{
    AuthScheme, Credentials, ExpectedArtifacts, FeatureFlags, ProxyConfig, ReclaimConfig,
    TaskClaim, TaskCondition, TaskDefinition, TaskLog, TaskPayload, WorkerConfig, PROXY_URL_ENV,
    ROTATION_NOTICE,
};
use tcproxy_queue::QueueClient;
use tcproxy_reclaim::ReclaimState;
use tcproxy_worker::TaskSession;

const TASK_ID: &str = "Zt5JjZ2cRVGcNfCVhXd0Hg";

#[derive(Default)]
struct MockQueue {
    reclaims: AtomicUsize,
    fail_reclaims: bool,
    artifact_auth: Mutex<Vec<String>>,
}

async fn reclaim(
    State(queue): State<Arc<MockQueue>>,
    Path((_task_id, _run_id)): Path<(String, u32)>,
) -> impl IntoResponse {
    let n = queue.reclaims.fetch_add(1, Ordering::SeqCst) + 1;
    if queue.fail_reclaims {
        return (StatusCode::INTERNAL_SERVER_ERROR, "queue is down").into_response();
    }
    Json(serde_json::json!({
        "runId": 0,
        "takenUntil": (Utc::now() + chrono::Duration::minutes(20)).to_rfc3339(),
        "credentials": {
            "clientId": format!("client-{}", n + 1),
            "accessToken": format!("token-{}", n + 1),
        }
    }))
    .into_response()
}

async fn artifact(
    State(queue): State<Arc<MockQueue>>,
    Path((_task_id, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    queue.artifact_auth.lock().unwrap().push(auth);
    assert_eq!(name, "public/test.txt");
    "test artifact"
}

async fn serve(queue: Arc<MockQueue>) -> String {
    let router = Router::new()
        .route("/api/queue/v1/task/:task_id/runs/:run_id/reclaim", post(reclaim))
        .route("/api/queue/v1/task/:task_id/artifacts/*name", get(artifact))
        .with_state(queue);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn worker_config(root_url: &str) -> WorkerConfig {
    WorkerConfig {
        root_url: root_url.to_string(),
        proxy: ProxyConfig {
            auth_scheme: AuthScheme::Hawk,
            ..ProxyConfig::default()
        },
        reclaim: ReclaimConfig::fixed(Duration::from_secs(1)),
    }
}

fn task(proxy: bool) -> TaskDefinition {
    TaskDefinition {
        scopes: vec!["queue:get-artifact:public/*".to_string()],
        expires: Utc::now() + chrono::Duration::days(14),
        payload: TaskPayload {
            command: vec![serde_json::json!("sleep 2; curl $TASKCLUSTER_PROXY_URL/...")],
            max_run_time: 60,
            features: FeatureFlags {
                taskcluster_proxy: proxy,
            },
            ..TaskPayload::default()
        },
    }
}

fn claim(lease: chrono::Duration) -> TaskClaim {
    TaskClaim::new(TASK_ID, 0, Utc::now() + lease, Credentials::new("client-1", "token-1"))
}

#[tokio::test]
async fn test_task_fetches_artifact_through_rotating_proxy() {
    let queue = Arc::new(MockQueue::default());
    let root = serve(queue.clone()).await;
    let config = worker_config(&root);
    let task = task(true);

    let dir = tempfile::tempdir().unwrap();
    let log = TaskLog::create(dir.path().join("live_backing.log"))
        .await
        .unwrap();
    let coordinator = Arc::new(QueueClient::new(config.api_base(), AuthScheme::Hawk).unwrap());

    let session = TaskSession::start(
        &config,
        coordinator,
        &task,
        claim(chrono::Duration::minutes(20)),
        log.clone(),
    )
    .await
    .unwrap();

    // The task process: wait for a couple of reclaims, then fetch an artifact
    let proxy_url = session.env()[PROXY_URL_ENV].clone();
    tokio::time::sleep(Duration::from_millis(2_600)).await;
    let body = reqwest::get(format!(
        "{}/queue/v1/task/{}/artifacts/public/test.txt",
        proxy_url, TASK_ID
    ))
    .await
    .unwrap()
    .text()
    .await
    .unwrap();
    log.line(&body).await;

    let record = session.log_artifact(&task).await;
    let state = session.finish().await;

    assert!(matches!(state, ReclaimState::Stopped { reclaims } if reclaims >= 2));
    assert_eq!(log.count_containing(ROTATION_NOTICE).await, 1);

    let auth = queue.artifact_auth.lock().unwrap().clone();
    assert_eq!(auth.len(), 1);
    assert!(auth[0].starts_with(r#"Hawk id="client-"#));
    assert!(!auth[0].contains(r#"id="client-1""#));

    ExpectedArtifacts::task_log(&task, &["test artifact", ROTATION_NOTICE])
        .validate(&[record])
        .unwrap();
}

#[tokio::test]
async fn test_no_proxy_without_feature_flag() {
    let queue = Arc::new(MockQueue::default());
    let root = serve(queue.clone()).await;
    let config = worker_config(&root);
    let coordinator = Arc::new(QueueClient::new(config.api_base(), AuthScheme::Hawk).unwrap());

    let session = TaskSession::start(
        &config,
        coordinator,
        &task(false),
        claim(chrono::Duration::minutes(20)),
        TaskLog::memory(),
    )
    .await
    .unwrap();

    assert!(session.proxy_url().is_none());
    assert!(!session.env().contains_key(PROXY_URL_ENV));
    assert!(session.env().contains_key("TASK_ID"));
    session.finish().await;
}

#[tokio::test]
async fn test_claim_lost_when_queue_stays_down() {
    let queue = Arc::new(MockQueue {
        fail_reclaims: true,
        ..MockQueue::default()
    });
    let root = serve(queue.clone()).await;
    let config = worker_config(&root);
    let coordinator = Arc::new(QueueClient::new(config.api_base(), AuthScheme::Hawk).unwrap());
    let log = TaskLog::memory();

    let session = TaskSession::start(
        &config,
        coordinator,
        &task(true),
        claim(chrono::Duration::milliseconds(1_500)),
        log.clone(),
    )
    .await
    .unwrap();

    let condition = tokio::time::timeout(Duration::from_secs(5), session.aborted())
        .await
        .unwrap();
    assert!(matches!(condition, TaskCondition::ClaimLost { .. }));

    let calls = queue.reclaims.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(queue.reclaims.load(Ordering::SeqCst), calls);

    let state = session.finish().await;
    assert!(matches!(state, ReclaimState::Aborted { .. }));
    assert_eq!(log.count_containing("claim-lost").await, 1);
}
