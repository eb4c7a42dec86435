use crate::api::sse;
use crate::db::{HealthObservation, HealthSource, RequestLogEntry};
use crate::error::CastorError;
use crate::middleware::{ProxyContext, ProxyPreprocess};
use crate::server::guards::auth::Caller;
use crate::server::router::CastorState;
use crate::service::{Selection, selector};
use ahash::AHashSet;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{
        HeaderMap, StatusCode,
        header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::time::Instant;
use tracing::{info, warn};

/// Fixed body for admission rejection. 500 rather than 503 is deliberate:
/// existing clients of this service match on it.
const ADMISSION_REJECT_MESSAGE: &str = "No available credentials for this model.";

pub async fn proxy_handler(
    State(state): State<CastorState>,
    caller: Caller,
    ProxyPreprocess(body, ctx): ProxyPreprocess,
) -> Response {
    if !caller.authenticated && !admit(&state, &ctx.model).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": ADMISSION_REJECT_MESSAGE })),
        )
            .into_response();
    }

    dispatch(&state, &ctx, body).await
}

/// Load-shedding decision for one unauthenticated request. A store failure
/// counts as zero healthy credentials: anonymous traffic is shed while the
/// store is unhealthy.
async fn admit(state: &CastorState, model: &str) -> bool {
    let healthy = match state.db.count_healthy(model).await {
        Ok(n) => n,
        Err(e) => {
            warn!(model, error = %e, "healthy count unavailable");
            0
        }
    };

    let admitted = state.admission.admit(healthy);
    if !admitted {
        info!(model, healthy, "request shed by admission control");
    }
    admitted
}

/// The retry-with-rotation loop. Each iteration burns one unit of the retry
/// budget whether it reached upstream or not; a credential id is never sent
/// upstream twice for the same inbound request.
async fn dispatch(state: &CastorState, ctx: &ProxyContext, body: Bytes) -> Response {
    let mut used: AHashSet<i64> = AHashSet::new();
    let mut miss_logged = false;

    for attempt in 1..=state.max_retries {
        let credential = match selector::next_credential(&state.db, &ctx.model, &used).await {
            Selection::Fresh(credential) => credential,
            Selection::Duplicate => continue,
            Selection::Exhausted => {
                if !miss_logged {
                    miss_logged = true;
                    log_request(state, ctx, None, 503, 0).await;
                }
                warn!(
                    model = %ctx.model,
                    "no credential available ({attempt}/{})",
                    state.max_retries
                );
                continue;
            }
        };
        used.insert(credential.id);

        let started = Instant::now();
        let upstream = state
            .upstream
            .forward(
                &ctx.subpath,
                ctx.query.as_deref(),
                &ctx.headers,
                body.clone(),
                &credential.key_value,
            )
            .await;

        match upstream {
            Ok(resp) => {
                let status = resp.status();
                record_health(state, ctx, credential.id, status.as_u16()).await;
                log_request(
                    state,
                    ctx,
                    Some(credential.id),
                    status.as_u16(),
                    elapsed_ms(started),
                )
                .await;

                if status.is_success() {
                    match relay_response(resp).await {
                        Ok(response) => return response,
                        Err(e) => {
                            warn!(
                                key_id = credential.id,
                                error = %e,
                                "stream validation failed; rotating credential"
                            );
                            record_health(state, ctx, credential.id, 500).await;
                            log_request(state, ctx, Some(credential.id), 500, elapsed_ms(started))
                                .await;
                            continue;
                        }
                    }
                }

                // Non-2xx: drop the body and rotate to another credential.
                warn!(
                    key_id = credential.id,
                    status = status.as_u16(),
                    "upstream failed ({attempt}/{})",
                    state.max_retries
                );
            }
            Err(e) => {
                warn!(key_id = credential.id, error = %e, "upstream request failed");
                record_health(state, ctx, credential.id, 500).await;
                log_request(state, ctx, Some(credential.id), 500, elapsed_ms(started)).await;
            }
        }
    }

    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "error": format!(
                "Service temporarily unavailable for model '{}' after {} retries.",
                ctx.model, state.max_retries
            )
        })),
    )
        .into_response()
}

/// Turn a successful upstream response into the client response. SSE bodies
/// must survive the two-event pre-check before any byte is emitted; other
/// bodies are relayed chunk-by-chunk with no buffering at all.
async fn relay_response(upstream: reqwest::Response) -> Result<Response, CastorError> {
    let status = upstream.status();
    let headers = sanitize_headers(upstream.headers());
    let is_sse = upstream
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("text/event-stream"));

    let mut byte_stream = Box::pin(upstream.bytes_stream());

    let body = if is_sse {
        let prelude = sse::precheck(&mut byte_stream).await?;
        let replay = futures::stream::once(async move { Ok::<_, reqwest::Error>(prelude) });
        Body::from_stream(replay.chain(byte_stream))
    } else {
        Body::from_stream(byte_stream)
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// The proxy re-frames the body, so framing and encoding headers from the
/// upstream hop must not leak through.
fn sanitize_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    headers.remove(TRANSFER_ENCODING);
    headers.remove(CONTENT_ENCODING);
    headers.remove(CONTENT_LENGTH);
    headers
}

async fn record_health(state: &CastorState, ctx: &ProxyContext, key_id: i64, status: u16) {
    let observation = HealthObservation {
        key_id,
        model: ctx.model.clone(),
        status,
        source: HealthSource::Dispatcher,
    };
    if let Err(e) = state.db.record_health(observation).await {
        warn!(key_id, error = %e, "failed to record credential health");
    }
}

async fn log_request(
    state: &CastorState,
    ctx: &ProxyContext,
    key_id: Option<i64>,
    status: u16,
    response_time_ms: i64,
) {
    let entry = RequestLogEntry {
        key_id,
        model: ctx.model.clone(),
        status,
        path: ctx.request_path.clone(),
        response_time_ms,
    };
    if let Err(e) = state.db.log_request(entry).await {
        warn!(error = %e, "failed to log request");
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}
