pub mod sse;
pub mod upstream_client;

pub use upstream_client::{API_KEY_HEADER, UpstreamClient};
