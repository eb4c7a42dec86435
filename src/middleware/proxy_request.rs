use crate::server::router::CastorState;
use axum::{
    Json, RequestExt,
    extract::{FromRequest, Path, Request},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::json;
use std::collections::HashSet;
use tracing::warn;

const MODELS_PREFIX: &str = "v1beta/models/";

/// Everything the dispatch loop needs to replay one inbound request.
#[derive(Debug, Clone)]
pub struct ProxyContext {
    /// The wildcard path as received, without the leading slash.
    pub subpath: String,
    /// Model name extracted from the path.
    pub model: String,
    /// Raw inbound query string, if any.
    pub query: Option<String>,
    /// Inbound headers, forwarded upstream after rewriting.
    pub headers: HeaderMap,
    /// Leading-slash path, recorded in request logs.
    pub request_path: String,
}

/// Extractor: validates the proxied path, resolves the model and buffers the
/// body once so the dispatcher can replay it across retries.
pub struct ProxyPreprocess(pub Bytes, pub ProxyContext);

impl FromRequest<CastorState> for ProxyPreprocess {
    type Rejection = Response;

    async fn from_request(mut req: Request, state: &CastorState) -> Result<Self, Self::Rejection> {
        let Path(subpath) = match req.extract_parts::<Path<String>>().await {
            Ok(p) => p,
            Err(rejection) => return Err(rejection.into_response()),
        };

        let model = match resolve_model(&subpath, &state.models) {
            Ok(model) => model,
            Err(message) => {
                warn!("rejected request path {subpath:?}: {message}");
                return Err((
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": message })),
                )
                    .into_response());
            }
        };

        let query = req.uri().query().map(str::to_string);
        let request_path = req.uri().path().to_string();
        let headers = req.headers().clone();

        let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("failed to read request body: {e}") })),
                )
                    .into_response());
            }
        };

        let ctx = ProxyContext {
            subpath,
            model,
            query,
            headers,
            request_path,
        };
        Ok(ProxyPreprocess(body, ctx))
    }
}

/// Check the `v1beta/models/<name>[:<operation>]` shape and return the model
/// name when it is in the supported set.
fn resolve_model(subpath: &str, models: &HashSet<String>) -> Result<String, String> {
    if !subpath.starts_with(MODELS_PREFIX) {
        return Err("Not Found".to_string());
    }

    let model_part = subpath.split(':').next().unwrap_or(subpath);
    let segments: Vec<&str> = model_part.split('/').collect();
    if segments.len() < 3 {
        return Err("Invalid path format".to_string());
    }

    let model = (*segments.last().expect("split yields at least one segment")).to_string();
    if model.is_empty() || !models.contains(&model) {
        return Err(format!("Model '{model}' not supported"));
    }

    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn models() -> HashSet<String> {
        ["gemini-2.0-flash", "gemma-3-4b-it"]
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn extracts_model_with_operation_suffix() {
        let model = resolve_model("v1beta/models/gemini-2.0-flash:generateContent", &models())
            .expect("valid path");
        assert_eq!(model, "gemini-2.0-flash");
    }

    #[test]
    fn extracts_model_without_operation() {
        let model = resolve_model("v1beta/models/gemma-3-4b-it", &models()).expect("valid path");
        assert_eq!(model, "gemma-3-4b-it");
    }

    #[test]
    fn rejects_foreign_prefix() {
        assert!(resolve_model("v1/models/gemini-2.0-flash", &models()).is_err());
        assert!(resolve_model("healthz", &models()).is_err());
    }

    #[test]
    fn rejects_short_paths() {
        assert!(resolve_model("v1beta/models/", &models()).is_err());
    }

    #[test]
    fn rejects_unsupported_model() {
        let err = resolve_model("v1beta/models/unknown-model:generateContent", &models())
            .expect_err("unsupported");
        assert!(err.contains("unknown-model"));
    }
}
