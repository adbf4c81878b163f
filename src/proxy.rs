//! The proxy core: listener lifecycle, connection tracking, request routing,
//! response relay, and upgrade tunneling.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use http::header::CONTENT_LENGTH;
use http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::endpoint::{self, ListenEndpoint};
use crate::error::{ErrorBody, ProxyError};
use crate::head;
use crate::intercept::{self, CreateConfigTransformer, InterceptionSettings};
use crate::upstream::{
    empty_body, full_body, incoming_to_box, BoxBody, UpstreamClient, UpstreamTarget,
};

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Port of the owning MITM server; selects the listen address and is
    /// injected into intercepted containers.
    pub proxy_port: u16,
    /// Connection target of the real daemon.
    pub upstream: UpstreamTarget,
    /// CA certificate made available to intercepted containers.
    pub cert_path: PathBuf,
    /// How interception material reaches containers, e.g. `mount`.
    pub interception_type: String,
    /// Internal prefix stripped from request paths before routing, if the
    /// proxy is mounted under one.
    pub path_prefix: Option<String>,
}

struct ProxyCtx {
    client: UpstreamClient,
    transformer: Arc<dyn CreateConfigTransformer>,
    settings: InterceptionSettings,
    path_prefix: Option<String>,
    tracker: Arc<ConnTracker>,
}

/// Live-connection registry. Every entry corresponds to one open connection
/// (or tunnel) task; aborting the task drops its socket, so draining this map
/// and aborting is what force-close means.
struct ConnTracker {
    conns: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
}

impl ConnTracker {
    fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Spawn `fut` as a tracked task. The entry is inserted while the map
    /// lock is held, so the task's own removal cannot run first.
    fn track(tracker: &Arc<Self>, fut: impl Future<Output = ()> + Send + 'static) {
        let id = tracker.next_id.fetch_add(1, Ordering::Relaxed);
        let cleanup = Arc::clone(tracker);
        let mut conns = tracker.conns.lock().expect("connection map poisoned");
        let task = tokio::spawn(async move {
            fut.await;
            // Tolerates the key being gone already: destroy() drains the map.
            cleanup
                .conns
                .lock()
                .expect("connection map poisoned")
                .remove(&id);
        });
        conns.insert(id, task.abort_handle());
    }

    fn abort_all(&self) {
        let handles: Vec<AbortHandle> = {
            let mut conns = self.conns.lock().expect("connection map poisoned");
            conns.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
        }
    }
}

/// A running proxy instance. Owners must call [`DockerProxy::destroy`] on
/// shutdown and await it before considering the proxy stopped.
pub struct DockerProxy {
    endpoint: ListenEndpoint,
    tracker: Arc<ConnTracker>,
    stop: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl DockerProxy {
    /// Bind the listen address for `config.proxy_port` and start serving.
    /// Any bind or address-resolution failure rejects creation entirely.
    pub async fn start(
        config: ProxyConfig,
        transformer: Arc<dyn CreateConfigTransformer>,
    ) -> Result<DockerProxy, ProxyError> {
        let endpoint = endpoint::resolve(config.proxy_port);
        let settings = InterceptionSettings {
            interception_type: config.interception_type,
            cert_path: config.cert_path,
            proxy_port: config.proxy_port,
        };
        let tracker = Arc::new(ConnTracker::new());
        let ctx = Arc::new(ProxyCtx {
            client: UpstreamClient::new(config.upstream),
            transformer,
            settings,
            path_prefix: config.path_prefix,
            tracker: Arc::clone(&tracker),
        });
        let (stop_tx, stop_rx) = watch::channel(false);
        let accept_task = listen(&endpoint, ctx, Arc::clone(&tracker), stop_rx)?;
        info!(endpoint = %endpoint, "docker proxy listening");
        Ok(DockerProxy {
            endpoint,
            tracker,
            stop: stop_tx,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn endpoint(&self) -> &ListenEndpoint {
        &self.endpoint
    }

    /// Stop accepting, cut every live connection, and wait for the listener
    /// loop to finish. In-flight exchanges are dropped, not drained. Calling
    /// this again after a completed destroy is a no-op.
    pub async fn destroy(&self) -> Result<(), ProxyError> {
        let accept_task = self
            .accept_task
            .lock()
            .expect("accept task lock poisoned")
            .take();
        let Some(accept_task) = accept_task else {
            return Ok(());
        };
        let _ = self.stop.send(true);
        self.tracker.abort_all();
        let result = accept_task.await;
        if let ListenEndpoint::Unix(path) = &self.endpoint {
            endpoint::remove_stale_socket(path);
        }
        result?;
        Ok(())
    }
}

#[cfg(unix)]
fn listen(
    endpoint: &ListenEndpoint,
    ctx: Arc<ProxyCtx>,
    tracker: Arc<ConnTracker>,
    stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, ProxyError> {
    match endpoint {
        ListenEndpoint::Unix(path) => {
            endpoint::remove_stale_socket(path);
            let listener = tokio::net::UnixListener::bind(path).map_err(|source| {
                ProxyError::Bind {
                    endpoint: path.display().to_string(),
                    source,
                }
            })?;
            Ok(tokio::spawn(accept_loop(listener, ctx, tracker, stop)))
        }
        ListenEndpoint::Pipe(name) => Err(ProxyError::Bind {
            endpoint: name.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "named pipes are not available on this platform",
            ),
        }),
    }
}

#[cfg(unix)]
async fn accept_loop(
    listener: tokio::net::UnixListener,
    ctx: Arc<ProxyCtx>,
    tracker: Arc<ConnTracker>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _addr)) => spawn_connection(stream, &ctx, &tracker),
                Err(err) => error!(%err, "accept error"),
            },
            _ = stop.changed() => {
                info!("docker proxy shutting down");
                break;
            }
        }
    }
}

#[cfg(windows)]
fn listen(
    endpoint: &ListenEndpoint,
    ctx: Arc<ProxyCtx>,
    tracker: Arc<ConnTracker>,
    stop: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, ProxyError> {
    use tokio::net::windows::named_pipe::ServerOptions;

    match endpoint {
        ListenEndpoint::Pipe(name) => {
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .create(name)
                .map_err(|source| ProxyError::Bind {
                    endpoint: name.clone(),
                    source,
                })?;
            Ok(tokio::spawn(accept_loop(
                name.clone(),
                first,
                ctx,
                tracker,
                stop,
            )))
        }
        ListenEndpoint::Unix(path) => Err(ProxyError::Bind {
            endpoint: path.display().to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "domain sockets are not available on this platform",
            ),
        }),
    }
}

#[cfg(windows)]
async fn accept_loop(
    name: String,
    mut server: tokio::net::windows::named_pipe::NamedPipeServer,
    ctx: Arc<ProxyCtx>,
    tracker: Arc<ConnTracker>,
    mut stop: watch::Receiver<bool>,
) {
    use tokio::net::windows::named_pipe::ServerOptions;

    loop {
        tokio::select! {
            result = server.connect() => match result {
                Ok(()) => {
                    // A pipe instance serves one client; stand up the next
                    // instance before handing this one off.
                    let next = match ServerOptions::new().create(&name) {
                        Ok(next) => next,
                        Err(err) => {
                            error!(%err, "failed to create next pipe instance");
                            break;
                        }
                    };
                    let stream = std::mem::replace(&mut server, next);
                    spawn_connection(stream, &ctx, &tracker);
                }
                Err(err) => error!(%err, "pipe accept error"),
            },
            _ = stop.changed() => {
                info!("docker proxy shutting down");
                break;
            }
        }
    }
}

fn spawn_connection<S>(stream: S, ctx: &Arc<ProxyCtx>, tracker: &Arc<ConnTracker>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ctx = Arc::clone(ctx);
    ConnTracker::track(tracker, async move {
        if let Err(err) = serve_connection(stream, ctx).await {
            warn!(%err, "connection error");
        }
    });
}

async fn serve_connection<S>(stream: S, ctx: Arc<ProxyCtx>) -> Result<(), hyper::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| handle(Arc::clone(&ctx), req));
    let mut builder = http1::Builder::new();
    builder.keep_alive(true);
    builder.preserve_header_case(true);
    builder.serve_connection(io, service).with_upgrades().await
}

async fn handle(
    ctx: Arc<ProxyCtx>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, ProxyError> {
    let path = effective_path(req.uri().path(), ctx.path_prefix.as_deref()).to_string();
    if is_create_path(&path) {
        intercept_create(ctx, req, &path).await
    } else {
        relay(ctx, req).await
    }
}

/// Forward a request as-is and relay whatever comes back. If the daemon
/// answers with a protocol switch the exchange turns into a raw tunnel; that
/// decision is made from the upstream response alone, so exec/attach/log
/// streams need no path knowledge here.
async fn relay(
    ctx: Arc<ProxyCtx>,
    req: Request<Incoming>,
) -> Result<Response<BoxBody>, ProxyError> {
    let (parts, body) = req.into_parts();
    let upstream_req = build_upstream_request(&ctx, &parts, incoming_to_box(body))?;
    let upstream_resp = ctx.client.request(upstream_req).await.map_err(|err| {
        error!(%err, method = %parts.method, path = %parts.uri.path(), "upstream request failed");
        err
    })?;
    if upstream_resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        return upgrade_downstream(ctx, parts, upstream_resp);
    }
    Ok(relay_response(upstream_resp))
}

/// Buffer, rewrite, and forward a matched container-create request. An
/// unparseable body fails the request outright; it is never passed through
/// corrupt.
async fn intercept_create(
    ctx: Arc<ProxyCtx>,
    req: Request<Incoming>,
    path: &str,
) -> Result<Response<BoxBody>, ProxyError> {
    let api_version = intercept::api_version(path).to_string();
    let (parts, body) = req.into_parts();
    let raw = body.collect().await?.to_bytes();
    let rewritten = match intercept::rewrite_create_config(
        &ctx.client,
        ctx.transformer.as_ref(),
        &ctx.settings,
        &api_version,
        &raw,
    )
    .await
    {
        Ok(rewritten) => rewritten,
        Err(err) => {
            warn!(%err, "rejecting container create request with unparseable body");
            return Ok(invalid_body_response(&err));
        }
    };
    let upstream_req = build_upstream_request(&ctx, &parts, full_body(rewritten))?;
    let upstream_resp = ctx.client.request(upstream_req).await.map_err(|err| {
        error!(%err, "upstream create request failed");
        err
    })?;
    Ok(relay_response(upstream_resp))
}

fn build_upstream_request(
    ctx: &ProxyCtx,
    parts: &http::request::Parts,
    body: BoxBody,
) -> Result<Request<BoxBody>, ProxyError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let path_and_query = effective_path(path_and_query, ctx.path_prefix.as_deref());
    let uri = ctx.client.uri_for(path_and_query)?;
    let mut upstream_req = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(body)?;
    let headers = upstream_req.headers_mut();
    for (name, value) in &parts.headers {
        // content-length is recomputed by the transport for the body
        // actually sent, which may not be the body the client sent
        if *name == CONTENT_LENGTH {
            continue;
        }
        headers.append(name, value.clone());
    }
    Ok(upstream_req)
}

/// Status and headers pass through untouched; hyper writes the head as soon
/// as this returns, so long-poll bodies stream instead of buffering.
fn relay_response(resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = resp.into_parts();
    Response::from_parts(parts, incoming_to_box(body))
}

/// Mirror the upstream 101 head onto the downstream response and hand both
/// connections to a tracked tunnel task.
fn upgrade_downstream(
    ctx: Arc<ProxyCtx>,
    parts: http::request::Parts,
    upstream_resp: Response<Incoming>,
) -> Result<Response<BoxBody>, ProxyError> {
    let mut builder = Response::builder().status(upstream_resp.status());
    let headers = builder.headers_mut().expect("headers_mut available");
    for (name, value) in upstream_resp.headers() {
        headers.append(name, value.clone());
    }
    let resp = builder.body(empty_body())?;
    let downstream_req = Request::from_parts(parts, ());
    ConnTracker::track(&ctx.tracker, tunnel(downstream_req, upstream_resp));
    Ok(resp)
}

/// Splice an upgraded downstream connection to its upgraded upstream
/// counterpart until either side closes. Handshake residue buffered on either
/// side is replayed by the upgraded handles before live bytes flow.
async fn tunnel(downstream_req: Request<()>, upstream_resp: Response<Incoming>) {
    let downstream = match hyper::upgrade::on(downstream_req).await {
        Ok(downstream) => downstream,
        Err(err) => {
            warn!(%err, "downstream upgrade failed");
            return;
        }
    };
    let mut downstream_io = TokioIo::new(downstream);
    match hyper::upgrade::on(upstream_resp).await {
        Ok(upstream) => {
            let mut upstream_io = TokioIo::new(upstream);
            match copy_bidirectional(&mut downstream_io, &mut upstream_io).await {
                Ok((to_upstream, to_downstream)) => {
                    debug!(to_upstream, to_downstream, "tunnel closed");
                }
                Err(err) => warn!(%err, "tunnel error"),
            }
            let _ = downstream_io.shutdown().await;
            let _ = upstream_io.shutdown().await;
        }
        Err(err) => {
            warn!(%err, "upstream upgrade failed");
            // The downstream transport is raw bytes now, so the error head
            // has to be written by hand.
            let _ = downstream_io.write_all(&head::bad_gateway_head()).await;
            let _ = downstream_io.shutdown().await;
        }
    }
}

fn invalid_body_response(err: &serde_json::Error) -> Response<BoxBody> {
    let body = ErrorBody {
        code: "invalid_config",
        message: format!("invalid container config: {err}"),
    };
    let body = serde_json::to_vec(&body).expect("static error body serializes");
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .expect("static response builds")
}

fn effective_path<'a>(path: &'a str, prefix: Option<&str>) -> &'a str {
    match prefix {
        Some(prefix) => path.strip_prefix(prefix).unwrap_or(path),
        None => path,
    }
}

fn is_create_path(path: &str) -> bool {
    let mut segments = path.trim_start_matches('/').splitn(3, '/');
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(version), Some("containers"), Some("create")) if !version.is_empty()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_path_requires_a_version_prefix() {
        assert!(is_create_path("/v1.41/containers/create"));
        assert!(is_create_path("/v1.24/containers/create"));
        assert!(!is_create_path("/containers/create"));
        assert!(!is_create_path("/v1.41/containers/abc/start"));
        assert!(!is_create_path("/v1.41/images/create"));
        assert!(!is_create_path("/v1.41/containers/create/extra"));
        assert!(!is_create_path("/"));
    }

    #[test]
    fn prefix_stripping_applies_only_when_present() {
        assert_eq!(
            effective_path("/docker/v1.41/_ping", Some("/docker")),
            "/v1.41/_ping"
        );
        assert_eq!(
            effective_path("/v1.41/_ping", Some("/docker")),
            "/v1.41/_ping"
        );
        assert_eq!(effective_path("/v1.41/_ping", None), "/v1.41/_ping");
    }
}
