use crate::api::API_KEY_HEADER;
use crate::server::router::CastorState;
use crate::service::IpVerdict;
use axum::{
    Json,
    extract::{ConnectInfo, FromRequestParts},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

fn extract_header_token(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn extract_query_token(query: Option<&str>) -> Option<String> {
    query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "key")
            .map(|(_, v)| v.into_owned())
    })
}

fn matches_key(candidate: Option<String>, expected: &str) -> bool {
    candidate.is_some_and(|token| token.as_bytes().ct_eq(expected.as_bytes()).into())
}

/// Who is calling, as the dispatcher cares: authenticated callers skip both
/// the IP filter and the admission controller.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub authenticated: bool,
    pub ip: IpAddr,
}

/// Guard: classifies the caller and applies the IP filter to unauthenticated
/// traffic. The only rejection it produces is 429.
impl FromRequestParts<CastorState> for Caller {
    type Rejection = RateLimited;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &CastorState,
    ) -> Result<Self, Self::Rejection> {
        let ip = client_ip(parts);

        // An empty configured key disables authentication entirely: every
        // caller is trusted, nobody is filtered or shed.
        let expected = state.auth_key.as_ref();
        let authenticated = expected.is_empty()
            || matches_key(extract_header_token(&parts.headers), expected)
            || matches_key(extract_query_token(parts.uri.query()), expected);

        if authenticated {
            return Ok(Caller {
                authenticated: true,
                ip,
            });
        }

        match state.ip_filter.check(ip) {
            IpVerdict::Allowed => Ok(Caller {
                authenticated: false,
                ip,
            }),
            IpVerdict::Throttled => {
                info!(%ip, "rate limit exceeded");
                Err(RateLimited)
            }
            IpVerdict::Banned { newly } => {
                if newly {
                    info!(%ip, "hourly limit exceeded; banning permanently");
                    if let Err(e) = state.db.ban_ip(&ip.to_string()).await {
                        warn!(%ip, error = %e, "failed to persist ban");
                    }
                }
                Err(RateLimited)
            }
        }
    }
}

fn client_ip(parts: &Parts) -> IpAddr {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |ci| ci.0.ip())
}

pub struct RateLimited;

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "error": "Too Many Requests" })),
        )
            .into_response()
    }
}
