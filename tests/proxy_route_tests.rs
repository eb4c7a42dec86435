use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use castor::config::Config;
use castor::db::{DbHandle, HealthPolicy};
use castor::server::router::{CastorState, castor_router};
use castor::service::IpFilter;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tower::ServiceExt;

const MODEL: &str = "gemini-2.0-flash";
const BODY: &str = r#"{"contents":[{"parts":[{"text":"hi"}]}]}"#;

fn temp_db_path(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();
    let mut path = std::env::temp_dir();
    path.push(format!(
        "castor-route-{tag}-{}-{nanos}.sqlite",
        std::process::id()
    ));
    path
}

async fn spawn_app(tag: &str, cfg: &Config) -> (Router, DbHandle, Arc<IpFilter>, PathBuf) {
    let path = temp_db_path(tag);
    let database_url = format!("sqlite:{}", path.display());
    let db = castor::db::spawn(&database_url, HealthPolicy::from_config(&cfg.health)).await;

    let ip_filter = Arc::new(IpFilter::new(
        cfg.policy.rate_limit_per_minute,
        cfg.policy.rate_limit_per_hour_ban,
    ));
    let state = CastorState::new(db.clone(), cfg, ip_filter.clone());
    (castor_router(state), db, ip_filter, path)
}

async fn cleanup(path: PathBuf) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = tokio::fs::remove_file(format!("{}{suffix}", path.display())).await;
    }
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(BODY))
        .expect("failed to build request")
}

fn post_with_key(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-goog-api-key", key)
        .body(Body::from(BODY))
        .expect("failed to build request")
}

#[tokio::test]
async fn unsupported_model_and_foreign_paths_are_404() {
    let cfg = Config::default();
    let (app, _db, _filter, path) = spawn_app("notfound", &cfg).await;

    let resp = app
        .clone()
        .oneshot(post("/v1beta/models/unknown-model:generateContent"))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("unknown-model"));

    let resp = app
        .clone()
        .oneshot(post("/healthz"))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = app
        .oneshot(post("/v1beta/models/"))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    cleanup(path).await;
}

#[tokio::test]
async fn empty_pool_exhausts_retries_with_a_single_miss_log() {
    // Empty auth key: caller counts as authenticated, so no admission gate.
    let cfg = Config::default();
    let (app, db, _filter, path) = spawn_app("exhaust", &cfg).await;

    let resp = app
        .oneshot(post(&format!("/v1beta/models/{MODEL}:generateContent")))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains(MODEL));

    // The no-credential miss is logged once, not once per retry.
    assert_eq!(db.recent_request_count().await.unwrap(), 1);

    cleanup(path).await;
}

#[tokio::test]
async fn admission_gates_unauthenticated_callers_only() {
    let mut cfg = Config::default();
    cfg.basic.auth_key = "secret".to_string();
    let (app, _db, _filter, path) = spawn_app("admission", &cfg).await;

    let uri = format!("/v1beta/models/{MODEL}:generateContent");

    // Zero healthy credentials is below the low threshold: anonymous -> 500.
    let resp = app.clone().oneshot(post(&uri)).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Wrong key is still anonymous.
    let resp = app
        .clone()
        .oneshot(post_with_key(&uri, "not-the-secret"))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Authenticated via header: admission is bypassed, dispatch proceeds and
    // exhausts the (empty) pool instead.
    let resp = app
        .clone()
        .oneshot(post_with_key(&uri, "secret"))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Authenticated via query parameter works the same.
    let resp = app
        .oneshot(post(&format!("{uri}?key=secret")))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    cleanup(path).await;
}

#[tokio::test]
async fn minute_quota_throttles_unauthenticated_callers() {
    let mut cfg = Config::default();
    cfg.basic.auth_key = "secret".to_string();
    cfg.policy.rate_limit_per_minute = 1;
    let (app, _db, _filter, path) = spawn_app("throttle", &cfg).await;

    let uri = format!("/v1beta/models/{MODEL}:generateContent");

    // First anonymous request passes the filter (and dies at admission).
    let resp = app.clone().oneshot(post(&uri)).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // Second one in the same minute is throttled before anything else runs.
    let resp = app.clone().oneshot(post(&uri)).await.expect("request failed");
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    // Authenticated callers are exempt from the filter.
    let resp = app
        .oneshot(post_with_key(&uri, "secret"))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    cleanup(path).await;
}

#[tokio::test]
async fn persisted_ban_rejects_first_contact() {
    let mut cfg = Config::default();
    cfg.basic.auth_key = "secret".to_string();
    let (app, _db, filter, path) = spawn_app("banned", &cfg).await;

    // Simulate startup hydration of a ban recorded by an earlier process.
    // Requests without connection info resolve to the unspecified address.
    filter.hydrate_bans([IpAddr::V4(Ipv4Addr::UNSPECIFIED)]);

    let resp = app
        .oneshot(post(&format!("/v1beta/models/{MODEL}:generateContent")))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    cleanup(path).await;
}
