pub mod proxy_request;

pub use proxy_request::{ProxyContext, ProxyPreprocess};
