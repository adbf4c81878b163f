//! Hand serialization of HTTP/1.1 response heads.
//!
//! Once a connection has switched protocols there is no response writer left
//! on it, so anything that still needs to look like HTTP (an error head on a
//! half-established tunnel) has to be rendered to raw bytes by hand.

use http::header::{HeaderValue, CONTENT_LENGTH};
use http::{HeaderMap, StatusCode};

/// Render a response head: status line, each header as `name: value`, and the
/// terminating blank line, all with exact `\r\n` endings.
pub fn render_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let reason = status.canonical_reason().unwrap_or("");
    let mut head = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), reason).into_bytes();
    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// Head written onto an upgraded downstream stream when the upstream half of
/// the tunnel never materializes.
pub(crate) fn bad_gateway_head() -> Vec<u8> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
    render_head(StatusCode::BAD_GATEWAY, &headers)
}
