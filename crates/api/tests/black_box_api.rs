use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use complyflow_analysis::simulated;
use complyflow_api::app::{self, AppServices, Backends};
use complyflow_auth::{InMemoryEntitlements, JwtClaims, SubscriptionStatus};
use complyflow_core::{TenantId, UserId};
use complyflow_infra::config::JobConfig;
use complyflow_infra::jobs::WorkerPool;

const SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    ws_url: String,
    handle: tokio::task::JoinHandle<()>,
    _workers: Option<WorkerPool>,
}

impl TestServer {
    /// Same router as prod on an ephemeral port; optionally with a local
    /// worker pool running fast simulated stages.
    async fn spawn(with_workers: bool) -> Self {
        Self::spawn_with(Backends::in_memory(), with_workers).await
    }

    async fn spawn_with(backends: Backends, with_workers: bool) -> Self {
        let jobs = JobConfig {
            poll_interval: Duration::from_millis(10),
            worker_concurrency: 2,
            ..JobConfig::default()
        };
        let services = AppServices::with_backends(backends, SECRET, jobs);
        let workers = with_workers.then(|| services.spawn_workers(simulated::standard_pipeline(Duration::from_millis(30))));

        let app = app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}/realtime"),
            handle,
            _workers: workers,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(tenant_id: TenantId) -> String {
    let now = Utc::now();
    let claims = JwtClaims::new(UserId::new(), tenant_id, now, now + ChronoDuration::minutes(10));

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("failed to encode jwt")
}

async fn submit(client: &reqwest::Client, srv: &TestServer, token: &str, input_ref: &str) -> String {
    let res = client
        .post(format!("{}/analyses", srv.base_url))
        .bearer_auth(token)
        .json(&json!({"input_ref": input_ref, "frameworks": ["GDPR", "SOC2"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "processing");
    body["analysis_id"].as_str().unwrap().to_string()
}

async fn wait_for_status(
    client: &reqwest::Client,
    srv: &TestServer,
    token: &str,
    id: &str,
    status: &str,
) -> serde_json::Value {
    for _ in 0..200 {
        let body: serde_json::Value = client
            .get(format!("{}/analyses/{}", srv.base_url, id))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["status"] == status {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("analysis {id} never reached {status}");
}

async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("{}/whoami", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/analyses/latest", srv.base_url))
        .bearer_auth("garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client.get(format!("{}/health", srv.base_url)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn tenant_context_is_derived_from_token() {
    let srv = TestServer::spawn(false).await;
    let tenant_id = TenantId::new();

    let res = reqwest::Client::new()
        .get(format!("{}/whoami", srv.base_url))
        .bearer_auth(mint_jwt(tenant_id))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["tenant_id"].as_str().unwrap(), tenant_id.to_string());
}

#[tokio::test]
async fn submission_is_validated() {
    let srv = TestServer::spawn(false).await;
    let token = mint_jwt(TenantId::new());
    let client = reqwest::Client::new();

    for body in [
        json!({"input_ref": "  ", "frameworks": ["GDPR"]}),
        json!({"input_ref": "policy.pdf", "frameworks": []}),
    ] {
        let res = client
            .post(format!("{}/analyses", srv.base_url))
            .bearer_auth(&token)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let err: serde_json::Value = res.json().await.unwrap();
        assert_eq!(err["error"], "validation_error");
    }
}

#[tokio::test]
async fn lapsed_subscription_cannot_submit() {
    let lapsed = TenantId::new();
    let trialing = TenantId::new();
    let gate = InMemoryEntitlements::new(None);
    gate.set_status(lapsed, SubscriptionStatus::PastDue);
    gate.set_status(trialing, SubscriptionStatus::Trialing);

    let mut backends = Backends::in_memory();
    backends.entitlements = Arc::new(gate);
    let srv = TestServer::spawn_with(backends, false).await;
    let client = reqwest::Client::new();

    for (tenant, expected) in [
        (lapsed, StatusCode::PAYMENT_REQUIRED),
        (TenantId::new(), StatusCode::PAYMENT_REQUIRED),
        (trialing, StatusCode::ACCEPTED),
    ] {
        let res = client
            .post(format!("{}/analyses", srv.base_url))
            .bearer_auth(mint_jwt(tenant))
            .json(&json!({"input_ref": "policy.pdf", "frameworks": ["GDPR"]}))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), expected);
    }

    let stats: serde_json::Value = client
        .get(format!("{}/analyses/stats", srv.base_url))
        .bearer_auth(mint_jwt(lapsed))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total"], 0);
}

#[tokio::test]
async fn submitted_job_is_pending_until_a_worker_runs() {
    let srv = TestServer::spawn(false).await;
    let token = mint_jwt(TenantId::new());
    let client = reqwest::Client::new();

    let id = submit(&client, &srv, &token, "policy.pdf").await;

    let res = client
        .get(format!("{}/analyses/{}", srv.base_url, id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "pending");
    assert_eq!(body["progress"], 0);
    assert!(body["result_ref"].is_null());

    let stats: serde_json::Value = client
        .get(format!("{}/analyses/stats", srv.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["recent"][0]["analysis_id"], id);
}

#[tokio::test]
async fn other_tenants_cannot_see_a_job() {
    let srv = TestServer::spawn(false).await;
    let client = reqwest::Client::new();
    let owner = mint_jwt(TenantId::new());
    let stranger = mint_jwt(TenantId::new());

    let id = submit(&client, &srv, &owner, "policy.pdf").await;

    let res = client
        .get(format!("{}/analyses/{}", srv.base_url, id))
        .bearer_auth(&stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/analyses/latest", srv.base_url))
        .bearer_auth(&stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(format!("{}/analyses/not-a-uuid", srv.base_url))
        .bearer_auth(&owner)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn job_completes_and_polling_agrees() {
    let srv = TestServer::spawn(true).await;
    let token = mint_jwt(TenantId::new());
    let client = reqwest::Client::new();

    let id = submit(&client, &srv, &token, "policy.pdf").await;
    let done = wait_for_status(&client, &srv, &token, &id, "completed").await;
    assert_eq!(done["progress"], 100);
    assert!(done["result_ref"].as_str().unwrap().ends_with(".pdf"));

    let latest: serde_json::Value = client
        .get(format!("{}/analyses/latest", srv.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest["analysis_id"], id);
    assert_eq!(latest["status"], "completed");
}

#[tokio::test]
async fn unsupported_document_fails_with_sentinel() {
    let srv = TestServer::spawn(true).await;
    let token = mint_jwt(TenantId::new());
    let client = reqwest::Client::new();

    let id = submit(&client, &srv, &token, "scan.bmp").await;
    let failed = wait_for_status(&client, &srv, &token, &id, "failed").await;
    assert_eq!(failed["progress"], -1);
    assert!(failed["result_ref"].is_null());
}

#[tokio::test]
async fn realtime_requires_a_token() {
    let srv = TestServer::spawn(false).await;
    let err = tokio_tungstenite::connect_async(srv.ws_url.as_str()).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(res) => assert_eq!(res.status(), 401),
        other => panic!("expected http rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn realtime_rejects_cross_tenant_join() {
    let srv = TestServer::spawn(false).await;
    let token = mint_jwt(TenantId::new());

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?token={}", srv.ws_url, token))
        .await
        .unwrap();
    ws.send(Message::Text(json!({"type": "join", "tenant_id": TenantId::new()}).to_string()))
        .await
        .unwrap();

    let frame = next_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["message"], "tenant mismatch");
}

#[tokio::test]
async fn realtime_sync_then_live_progress_to_completion() {
    let srv = TestServer::spawn(true).await;
    let tenant_id = TenantId::new();
    let token = mint_jwt(tenant_id);
    let client = reqwest::Client::new();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}?token={}", srv.ws_url, token))
        .await
        .unwrap();
    ws.send(Message::Text(json!({"type": "join", "tenant_id": tenant_id}).to_string()))
        .await
        .unwrap();

    let sync = next_json(&mut ws).await;
    assert_eq!(sync["type"], "sync_status");
    assert!(sync["job_id"].is_null());

    let id = submit(&client, &srv, &token, "policy.docx").await;

    let mut last = -2;
    loop {
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "analysis_progress");
        assert_eq!(frame["job_id"], id);
        let progress = frame["progress"].as_i64().unwrap();
        assert!(progress >= last, "progress went backwards: {last} -> {progress}");
        last = progress;
        if progress == 100 {
            assert_eq!(frame["message"], "Analysis complete!");
            break;
        }
    }

    // A late joiner is synced to the terminal state.
    let (mut late, _) = tokio_tungstenite::connect_async(format!("{}?token={}", srv.ws_url, token))
        .await
        .unwrap();
    late.send(Message::Text(json!({"type": "join", "tenant_id": tenant_id}).to_string()))
        .await
        .unwrap();
    let sync = next_json(&mut late).await;
    assert_eq!(sync["type"], "sync_status");
    assert_eq!(sync["job_id"], id);
    assert_eq!(sync["status"], "completed");
    assert_eq!(sync["progress"], 100);
}
