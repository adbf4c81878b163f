//! Rewriting of intercepted container-creation requests.

use std::path::PathBuf;

use http::{Method, Request};
use http_body_util::BodyExt;
use serde_json::Value;
use tracing::debug;

use crate::upstream::{empty_body, UpstreamClient};

/// Fixed options handed to the config transformer for every intercepted
/// create call.
#[derive(Clone, Debug)]
pub struct InterceptionSettings {
    /// How interception material reaches the container, e.g. `mount`.
    pub interception_type: String,
    /// CA certificate to make visible inside intercepted containers.
    pub cert_path: PathBuf,
    /// Port of the owning MITM server, injected into container env vars.
    pub proxy_port: u16,
}

/// Computes the rewritten container-creation payload.
///
/// This is an external collaborator: the proxy only guarantees that the
/// daemon sees the transformer's output instead of the client's original
/// body. `image_config` is the daemon's view of the requested image, when it
/// could be fetched.
pub trait CreateConfigTransformer: Send + Sync {
    fn transform(
        &self,
        create_config: Value,
        image_config: Option<Value>,
        settings: &InterceptionSettings,
    ) -> Value;
}

pub(crate) fn api_version(path: &str) -> &str {
    path.trim_start_matches('/').split('/').next().unwrap_or("")
}

/// Parse a buffered create body, enrich it with the daemon's image metadata
/// when available, and run it through the transformer. A parse failure is the
/// caller's problem to surface; a metadata lookup failure is not a failure at
/// all — the create goes ahead and the daemon reports a missing image itself,
/// which is the signal clients use to pull and retry.
pub(crate) async fn rewrite_create_config(
    client: &UpstreamClient,
    transformer: &dyn CreateConfigTransformer,
    settings: &InterceptionSettings,
    api_version: &str,
    raw: &[u8],
) -> Result<Vec<u8>, serde_json::Error> {
    let config: Value = serde_json::from_slice(raw)?;
    let image = config
        .get("Image")
        .and_then(|v| v.as_str())
        .map(str::to_owned);
    let image_config = match &image {
        Some(image) => inspect_image(client, api_version, image).await,
        None => None,
    };
    let rewritten = transformer.transform(config, image_config, settings);
    serde_json::to_vec(&rewritten)
}

async fn inspect_image(client: &UpstreamClient, api_version: &str, image: &str) -> Option<Value> {
    let uri = client
        .uri_for(&format!("/{api_version}/images/{image}/json"))
        .ok()?;
    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(empty_body())
        .ok()?;
    let resp = match client.request(req).await {
        Ok(resp) => resp,
        Err(err) => {
            debug!(%err, image, "image inspect failed, continuing without image config");
            return None;
        }
    };
    if !resp.status().is_success() {
        debug!(status = %resp.status(), image, "image not present, continuing without image config");
        return None;
    }
    let body = resp.into_body().collect().await.ok()?.to_bytes();
    serde_json::from_slice(&body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_is_the_first_path_segment() {
        assert_eq!(api_version("/v1.41/containers/create"), "v1.41");
        assert_eq!(api_version("/v1.24/images/alpine/json"), "v1.24");
        assert_eq!(api_version("/"), "");
    }
}
