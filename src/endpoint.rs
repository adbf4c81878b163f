//! Listen-address resolution for proxy instances.
//!
//! A proxy is identified by the port of its owning MITM server; that port
//! maps deterministically to one local transport address per platform.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Prefix shared by every proxy listen address.
pub const SOCKET_NAME_PREFIX: &str = "httptoolkit-";

/// The concrete local address a proxy instance listens on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenEndpoint {
    /// Filesystem domain socket (everywhere but Windows).
    Unix(PathBuf),
    /// Windows named pipe.
    Pipe(String),
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenEndpoint::Unix(path) => write!(f, "{}", path.display()),
            ListenEndpoint::Pipe(name) => f.write_str(name),
        }
    }
}

/// Resolve the listen address for a proxy port on the current platform.
/// Deterministic: the same port always yields the same address.
pub fn resolve(proxy_port: u16) -> ListenEndpoint {
    if cfg!(windows) {
        ListenEndpoint::Pipe(pipe_name(proxy_port))
    } else {
        ListenEndpoint::Unix(socket_path(&std::env::temp_dir(), proxy_port))
    }
}

fn socket_path(tmp_dir: &Path, proxy_port: u16) -> PathBuf {
    tmp_dir.join(format!("{SOCKET_NAME_PREFIX}{proxy_port}-docker.sock"))
}

fn pipe_name(proxy_port: u16) -> String {
    format!(r"\\.\pipe\{SOCKET_NAME_PREFIX}{proxy_port}-docker")
}

/// Remove a socket file left behind by an earlier unclean shutdown. A missing
/// file is the normal case; any other failure is logged and startup carries
/// on — a real problem will surface from bind.
pub(crate) fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale proxy socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(%err, path = %path.display(), "failed to remove stale proxy socket"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_embeds_the_proxy_port() {
        let path = socket_path(Path::new("/tmp"), 8000);
        assert_eq!(path, PathBuf::from("/tmp/httptoolkit-8000-docker.sock"));
    }

    #[test]
    fn pipe_name_uses_the_pipe_namespace() {
        assert_eq!(pipe_name(8000), r"\\.\pipe\httptoolkit-8000-docker");
    }

    #[test]
    fn resolution_is_idempotent_per_port() {
        assert_eq!(resolve(4380), resolve(4380));
        assert_ne!(resolve(4380), resolve(4381));
    }

    #[test]
    fn missing_stale_socket_is_not_an_error() {
        remove_stale_socket(Path::new("/nonexistent/httptoolkit-0-docker.sock"));
    }
}
