//! The persistent client pool for the real daemon.

use std::convert::Infallible;
#[cfg(unix)]
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
#[cfg(unix)]
use hyperlocal::UnixConnector;

use crate::error::ProxyError;

pub(crate) type BoxBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;
pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub(crate) fn full_body(b: impl Into<Bytes>) -> BoxBody {
    Full::new(b.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub(crate) fn incoming_to_box(b: Incoming) -> BoxBody {
    b.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

/// Where the real daemon lives. Resolved once at proxy creation and immutable
/// for the proxy's lifetime.
#[derive(Clone, Debug)]
pub enum UpstreamTarget {
    /// Filesystem socket of the daemon, e.g. `/var/run/docker.sock`.
    #[cfg(unix)]
    Unix(PathBuf),
    /// TCP daemon endpoint (`DOCKER_HOST=tcp://…`).
    Tcp { host: String, port: u16 },
}

enum Pool {
    #[cfg(unix)]
    Unix(Client<UnixConnector, BoxBody>),
    Tcp(Client<HttpConnector, BoxBody>),
}

/// One keep-alive connection pool to the daemon, shared by every in-flight
/// exchange (including image-metadata lookups) for the proxy's lifetime.
pub(crate) struct UpstreamClient {
    target: UpstreamTarget,
    pool: Pool,
}

impl UpstreamClient {
    pub(crate) fn new(target: UpstreamTarget) -> Self {
        let pool = match &target {
            #[cfg(unix)]
            UpstreamTarget::Unix(_) => {
                let mut builder = Client::builder(TokioExecutor::new());
                builder.pool_max_idle_per_host(8);
                Pool::Unix(builder.build(UnixConnector))
            }
            UpstreamTarget::Tcp { .. } => {
                let mut connector = HttpConnector::new();
                connector.set_connect_timeout(Some(Duration::from_secs(5)));
                let mut builder = Client::builder(TokioExecutor::new());
                builder.pool_max_idle_per_host(8);
                Pool::Tcp(builder.build(connector))
            }
        };
        Self { target, pool }
    }

    /// Build the upstream URI for an already prefix-stripped path-and-query.
    pub(crate) fn uri_for(&self, path_and_query: &str) -> Result<Uri, ProxyError> {
        match &self.target {
            #[cfg(unix)]
            UpstreamTarget::Unix(socket) => Ok(hyperlocal::Uri::new(socket, path_and_query).into()),
            UpstreamTarget::Tcp { host, port } => {
                Ok(format!("http://{host}:{port}{path_and_query}").parse::<Uri>()?)
            }
        }
    }

    pub(crate) async fn request(
        &self,
        req: Request<BoxBody>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let resp = match &self.pool {
            #[cfg(unix)]
            Pool::Unix(client) => client.request(req).await?,
            Pool::Tcp(client) => client.request(req).await?,
        };
        Ok(resp)
    }
}
