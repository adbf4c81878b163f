use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    #[error("transport error: {0}")]
    Transport(#[from] hyper::Error),
    #[error("invalid upstream uri: {0}")]
    Uri(#[from] http::uri::InvalidUri),
    #[error("failed to build request: {0}")]
    Http(#[from] http::Error),
    #[error("container config rewrite failed: {0}")]
    Config(#[from] serde_json::Error),
    #[error("proxy accept loop did not stop cleanly: {0}")]
    Shutdown(#[from] tokio::task::JoinError),
}

/// Wire shape of proxy-generated error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}
