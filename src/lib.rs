//! Intercepting reverse proxy for the Docker Engine API.
//!
//! The proxy listens where a Docker client expects the daemon socket to be
//! (`<tmp>/httptoolkit-<port>-docker.sock`, or the equivalent named pipe on
//! Windows) and forwards everything to the real daemon over a persistent
//! keep-alive connection pool. Exactly one request shape is rewritten on the
//! way through: versioned `/containers/create` calls have their JSON body
//! handed to a [`CreateConfigTransformer`] so that TLS-interception settings
//! (certificate mount, proxy environment variables) can be injected into new
//! containers. Every other request, including upgraded exec/attach streams,
//! passes through byte-for-byte.
//!
//! A proxy instance tracks every accepted connection and can be torn down
//! with [`DockerProxy::destroy`], which stops the listener and force-closes
//! all live connections without draining them.

pub mod endpoint;
pub mod error;
pub mod head;
pub mod intercept;
mod proxy;
mod upstream;

pub use endpoint::{resolve, ListenEndpoint, SOCKET_NAME_PREFIX};
pub use error::ProxyError;
pub use intercept::{CreateConfigTransformer, InterceptionSettings};
pub use proxy::{DockerProxy, ProxyConfig};
pub use upstream::UpstreamTarget;
