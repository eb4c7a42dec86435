use axum::{
    Router,
    body::{Body, to_bytes},
    extract::RawQuery,
    http::{HeaderMap, Request, Response, StatusCode},
    routing::post,
};
use castor::config::Config;
use castor::db::{DbHandle, HealthPolicy};
use castor::server::router::{CastorState, castor_router};
use castor::service::IpFilter;
use serde_json::json;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower::ServiceExt;
use url::Url;

const MODEL: &str = "gemini-2.0-flash";
const BODY: &str = r#"{"contents":[{"parts":[{"text":"hi"}]}]}"#;

async fn spawn_upstream(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock upstream");
    });
    addr
}

fn temp_db_path(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "castor-sse-{tag}-{}-{nanos}.sqlite",
        std::process::id()
    ));
    path
}

/// Build the proxy against the given upstream with `keys` already in the pool.
async fn spawn_proxy(
    tag: &str,
    upstream: &str,
    keys: &[&str],
    max_retries: u32,
) -> (Router, DbHandle, PathBuf) {
    let mut cfg = Config::default();
    cfg.upstream.default_url = Url::parse(upstream).expect("upstream url");
    cfg.upstream.max_retries = max_retries;

    let path = temp_db_path(tag);
    let database_url = format!("sqlite:{}", path.display());
    let db = castor::db::spawn(&database_url, HealthPolicy::from_config(&cfg.health)).await;

    let key_set: BTreeSet<String> = keys.iter().map(|k| (*k).to_string()).collect();
    db.upsert_credentials(key_set).await.expect("seed keys");
    db.reconcile_health(cfg.upstream.models.clone())
        .await
        .expect("seed health records");

    let ip_filter = Arc::new(IpFilter::new(
        cfg.policy.rate_limit_per_minute,
        cfg.policy.rate_limit_per_hour_ban,
    ));
    let state = CastorState::new(db.clone(), &cfg, ip_filter);
    (castor_router(state), db, path)
}

async fn cleanup(path: PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = tokio::fs::remove_file(format!("{}{suffix}", path.display())).await;
    }
}

fn proxy_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(BODY))
        .expect("failed to build request")
}

fn sse_response(events: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(Body::from(events.to_string()))
        .expect("sse response")
}

async fn key_health_statuses(db: &DbHandle, model: &str) -> Vec<(Option<i64>, i64)> {
    let mut out = Vec::new();
    for credential in db.list_credentials().await.expect("list credentials") {
        let record = db
            .get_health(credential.id, model)
            .await
            .expect("get health")
            .expect("record exists");
        out.push((record.status_code, record.test_count));
    }
    out
}

#[tokio::test]
async fn upstream_rejections_exhaust_the_retry_budget() {
    let upstream = Router::new().route(
        "/{*path}",
        post(|| async { (StatusCode::TOO_MANY_REQUESTS, "quota exceeded") }),
    );
    let addr = spawn_upstream(upstream).await;

    let (app, db, path) = spawn_proxy("reject", &format!("http://{addr}"), &["K1"], 3).await;

    let resp = app
        .oneshot(proxy_request(&format!(
            "/v1beta/models/{MODEL}:generateContent"
        )))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    // One key, three retries: it is sent upstream exactly once, the remaining
    // budget burns on used-id discards with no further upstream calls.
    assert_eq!(db.recent_request_count().await.unwrap(), 1);
    assert_eq!(key_health_statuses(&db, MODEL).await, vec![(Some(429), 1)]);

    cleanup(path).await;
}

#[tokio::test]
async fn no_credential_is_attempted_upstream_twice() {
    let upstream = Router::new().route(
        "/{*path}",
        post(|| async { (StatusCode::TOO_MANY_REQUESTS, "quota exceeded") }),
    );
    let addr = spawn_upstream(upstream).await;

    let (app, db, path) =
        spawn_proxy("rotate", &format!("http://{addr}"), &["K1", "K2", "K3"], 3).await;

    let resp = app
        .oneshot(proxy_request(&format!(
            "/v1beta/models/{MODEL}:generateContent"
        )))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let statuses = key_health_statuses(&db, MODEL).await;
    for (status, test_count) in &statuses {
        assert!(*test_count <= 1, "credential attempted upstream twice");
        assert!(matches!(status, None | Some(429)));
    }

    // Every upstream attempt produced exactly one log row.
    let attempted: i64 = statuses.iter().map(|(_, c)| c).sum();
    assert!(attempted >= 1);
    assert_eq!(db.recent_request_count().await.unwrap(), attempted);

    cleanup(path).await;
}

#[tokio::test]
async fn sse_stream_with_one_event_is_rejected_and_retried() {
    let upstream = Router::new().route(
        "/{*path}",
        post(|| async { sse_response("data: only\r\n\r\n") }),
    );
    let addr = spawn_upstream(upstream).await;

    let (app, db, path) = spawn_proxy("sse-short", &format!("http://{addr}"), &["K1"], 2).await;

    let resp = app
        .oneshot(proxy_request(&format!(
            "/v1beta/models/{MODEL}:streamGenerateContent"
        )))
        .await
        .expect("request failed");

    // The client never sees the truncated stream, only the final 503.
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    // The upstream said 200 but the pre-check overwrote the record with 500.
    assert_eq!(
        key_health_statuses(&db, MODEL).await,
        vec![(Some(500), 2)]
    );
    // Two log rows for the one attempt: the upstream 200, then the 500.
    assert_eq!(db.recent_request_count().await.unwrap(), 2);

    cleanup(path).await;
}

#[tokio::test]
async fn sse_stream_with_enough_events_is_relayed_in_order() {
    const EVENTS: &str = "data: one\r\n\r\ndata: two\r\n\r\ndata: three\r\n\r\n";
    let upstream = Router::new().route("/{*path}", post(|| async { sse_response(EVENTS) }));
    let addr = spawn_upstream(upstream).await;

    let (app, db, path) = spawn_proxy("sse-ok", &format!("http://{addr}"), &["K1"], 2).await;

    let resp = app
        .oneshot(proxy_request(&format!(
            "/v1beta/models/{MODEL}:streamGenerateContent"
        )))
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], EVENTS.as_bytes());

    assert_eq!(key_health_statuses(&db, MODEL).await, vec![(Some(200), 1)]);

    cleanup(path).await;
}

#[tokio::test]
async fn forwarding_rewrites_credential_and_strips_caller_key() {
    // The mock upstream echoes back what it actually received.
    let upstream = Router::new().route(
        "/{*path}",
        post(|RawQuery(query): RawQuery, headers: HeaderMap| async move {
            let api_key = headers
                .get("x-goog-api-key")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string();
            axum::Json(json!({ "api_key": api_key, "query": query }))
        }),
    );
    let addr = spawn_upstream(upstream).await;

    let (app, db, path) = spawn_proxy("echo", &format!("http://{addr}"), &["pool-key-1"], 2).await;

    let resp = app
        .oneshot(proxy_request(&format!(
            "/v1beta/models/{MODEL}:generateContent?key=caller-secret&alt=sse"
        )))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let echoed: serde_json::Value = serde_json::from_slice(&body).expect("echo json");

    // The pooled credential replaced whatever the caller sent.
    assert_eq!(echoed["api_key"], "pool-key-1");
    // The caller's `key` parameter never reaches the upstream.
    let query = echoed["query"].as_str().unwrap_or_default();
    assert!(query.contains("alt=sse"));
    assert!(!query.contains("caller-secret"));

    assert_eq!(key_health_statuses(&db, MODEL).await, vec![(Some(200), 1)]);

    cleanup(path).await;
}

#[tokio::test]
async fn transport_errors_mark_the_credential_and_return_503() {
    // Nothing listens here; the connection is refused.
    let (app, db, path) = spawn_proxy("refused", "http://127.0.0.1:1", &["K1"], 2).await;

    let resp = app
        .oneshot(proxy_request(&format!(
            "/v1beta/models/{MODEL}:generateContent"
        )))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    assert_eq!(key_health_statuses(&db, MODEL).await, vec![(Some(500), 1)]);
    assert_eq!(db.recent_request_count().await.unwrap(), 1);

    cleanup(path).await;
}
