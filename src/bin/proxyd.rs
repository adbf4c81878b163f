use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use docker_mitm_proxy::{
    CreateConfigTransformer, DockerProxy, InterceptionSettings, ProxyConfig, UpstreamTarget,
};
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "docker-proxyd",
    version,
    about = "Intercepting proxy for the Docker Engine API"
)]
struct Options {
    /// Port of the owning MITM server; selects the proxy listen address
    #[arg(long, env = "PROXY_PORT")]
    proxy_port: u16,
    /// CA certificate (PEM) to make visible inside intercepted containers
    #[arg(long, env = "PROXY_CERT_PATH")]
    cert_path: PathBuf,
    /// Socket of the real Docker daemon
    #[arg(long, env = "DOCKER_SOCKET", default_value = "/var/run/docker.sock")]
    docker_socket: PathBuf,
    /// TCP daemon address as host:port; overrides --docker-socket
    #[arg(long, env = "DOCKER_HOST_ADDR")]
    docker_host: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let options = Options::parse();
    if let Err(err) = run(options).await {
        error!(%err, "docker proxy failed");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(options: Options) -> anyhow::Result<()> {
    let upstream = upstream_target(&options)?;
    let config = ProxyConfig {
        proxy_port: options.proxy_port,
        upstream,
        cert_path: options.cert_path,
        interception_type: "mount".to_string(),
        path_prefix: None,
    };
    let proxy = DockerProxy::start(config, Arc::new(EnvInjectingTransformer))
        .await
        .context("failed to start docker proxy")?;
    info!(endpoint = %proxy.endpoint(), "proxying the docker daemon");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
    proxy.destroy().await.context("proxy shutdown failed")?;
    Ok(())
}

fn upstream_target(options: &Options) -> anyhow::Result<UpstreamTarget> {
    if let Some(addr) = &options.docker_host {
        let (host, port) = addr
            .rsplit_once(':')
            .with_context(|| format!("invalid daemon address '{addr}', expected host:port"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid daemon port in '{addr}'"))?;
        return Ok(UpstreamTarget::Tcp {
            host: host.to_string(),
            port,
        });
    }
    #[cfg(unix)]
    {
        Ok(UpstreamTarget::Unix(options.docker_socket.clone()))
    }
    #[cfg(not(unix))]
    {
        anyhow::bail!("a tcp daemon address is required on this platform (--docker-host)")
    }
}

/// Built-in transformer: mounts the CA certificate into the container and
/// points the usual proxy environment variables at the MITM port.
struct EnvInjectingTransformer;

impl CreateConfigTransformer for EnvInjectingTransformer {
    fn transform(
        &self,
        mut config: Value,
        _image_config: Option<Value>,
        settings: &InterceptionSettings,
    ) -> Value {
        let proxy_url = format!("http://host.docker.internal:{}", settings.proxy_port);
        let cert_mount = format!(
            "{}:/etc/ssl/certs/docker-mitm-ca.pem:ro",
            settings.cert_path.display()
        );
        if let Some(map) = config.as_object_mut() {
            let env = map.entry("Env").or_insert_with(|| json!([]));
            if let Some(env) = env.as_array_mut() {
                env.push(json!(format!("HTTP_PROXY={proxy_url}")));
                env.push(json!(format!("HTTPS_PROXY={proxy_url}")));
            }
            let host_config = map.entry("HostConfig").or_insert_with(|| json!({}));
            if let Some(host_config) = host_config.as_object_mut() {
                let binds = host_config.entry("Binds").or_insert_with(|| json!([]));
                if let Some(binds) = binds.as_array_mut() {
                    binds.push(json!(cert_mount));
                }
            }
        }
        config
    }
}
