use crate::config::UpstreamConfig;
use crate::error::CastorError;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, HOST, HeaderMap, HeaderValue};
use url::Url;

/// Header carrying the pooled credential on egress (and, for callers that use
/// it, the shared auth key on ingress).
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Query parameter stripped before forwarding: it carries the caller's auth
/// key, never the pooled credential.
const CLIENT_KEY_PARAM: &str = "key";

/// Egress side of the dispatcher: owns the forwarding `reqwest` client and
/// knows how to turn an inbound subpath into the upstream URL.
pub struct UpstreamClient {
    client: reqwest::Client,
    default_url: Url,
    gateway_url: Option<Url>,
}

impl UpstreamClient {
    pub fn from_config(cfg: &UpstreamConfig) -> Self {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.request_timeout())
            .http2_adaptive_window(true);

        if let Some(proxy_url) = &cfg.proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .expect("invalid proxy url for reqwest client");
            builder = builder.proxy(proxy);
        }

        Self {
            client: builder.build().expect("failed to build reqwest client"),
            default_url: cfg.default_url.clone(),
            gateway_url: cfg.gateway_url.clone(),
        }
    }

    /// Upstream URL for one inbound subpath, with the caller's query string
    /// minus the `key` parameter.
    pub fn build_url(&self, subpath: &str, query: Option<&str>) -> Result<Url, CastorError> {
        let mut url = if let Some(gateway) = &self.gateway_url {
            let segment = subpath.rsplit('/').next().unwrap_or(subpath);
            Url::parse(&format!(
                "{}/google-ai-studio/v1beta/models/{segment}",
                gateway.as_str().trim_end_matches('/')
            ))?
        } else {
            Url::parse(&format!(
                "{}/{subpath}",
                self.default_url.as_str().trim_end_matches('/')
            ))?
        };

        if let Some(query) = query {
            let forwarded: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
                .filter(|(k, _)| k != CLIENT_KEY_PARAM)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if !forwarded.is_empty() {
                url.query_pairs_mut().extend_pairs(forwarded);
            }
        }

        Ok(url)
    }

    /// Forward one request body upstream under the given credential.
    ///
    /// Inbound headers travel verbatim except `host` and `content-length`
    /// (re-derived for the upstream connection) and `x-goog-api-key`, which is
    /// overwritten with the selected pool credential.
    pub async fn forward(
        &self,
        subpath: &str,
        query: Option<&str>,
        inbound_headers: &HeaderMap,
        body: Bytes,
        credential: &str,
    ) -> Result<reqwest::Response, CastorError> {
        let url = self.build_url(subpath, query)?;

        let mut headers = inbound_headers.clone();
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.insert(API_KEY_HEADER, HeaderValue::from_str(credential)?);

        let resp = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    fn client_with(default_url: &str, gateway_url: Option<&str>) -> UpstreamClient {
        let cfg = UpstreamConfig {
            default_url: Url::parse(default_url).expect("default url"),
            gateway_url: gateway_url.map(|g| Url::parse(g).expect("gateway url")),
            ..UpstreamConfig::default()
        };
        UpstreamClient::from_config(&cfg)
    }

    #[test]
    fn default_upstream_url_appends_subpath() {
        let client = client_with("https://upstream.example", None);
        let url = client
            .build_url("v1beta/models/gemini-2.0-flash:generateContent", None)
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://upstream.example/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn gateway_url_uses_last_path_segment() {
        let client = client_with(
            "https://upstream.example",
            Some("https://gateway.example/ai"),
        );
        let url = client
            .build_url("v1beta/models/gemini-2.0-flash:streamGenerateContent", None)
            .expect("url");
        assert_eq!(
            url.as_str(),
            "https://gateway.example/ai/google-ai-studio/v1beta/models/gemini-2.0-flash:streamGenerateContent"
        );
    }

    #[test]
    fn query_is_forwarded_without_client_key() {
        let client = client_with("https://upstream.example", None);
        let url = client
            .build_url(
                "v1beta/models/m:generateContent",
                Some("key=caller-secret&alt=sse"),
            )
            .expect("url");
        assert_eq!(url.query(), Some("alt=sse"));
    }

    #[test]
    fn key_only_query_is_dropped_entirely() {
        let client = client_with("https://upstream.example", None);
        let url = client
            .build_url("v1beta/models/m:generateContent", Some("key=caller-secret"))
            .expect("url");
        assert_eq!(url.query(), None);
    }
}
