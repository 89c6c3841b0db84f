//! Dual-listener accept
//!
//! Two accept loops feed one handler tree: a TCP listener and a local IPC
//! (Unix domain socket) listener. Each loop serves a clone of the router
//! with a layer that tags connections with their source; the Unix accept
//! loop additionally verifies the peer's UID against the server's before a
//! connection is served, so IPC requests need no API key.

use axum::Extension;
use axum::Router;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;

use crate::errors::{WebError, WebResult};

/// Where a connection was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSource {
    /// TCP listener; API-key auth and rate limiting apply
    Tcp,
    /// Local IPC listener; peer credentials verified at accept
    Tray,
}

impl ConnectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionSource::Tcp => "tcp",
            ConnectionSource::Tray => "tray",
        }
    }
}

/// The two listeners and their serve tasks
pub struct DualListener {
    tcp_addr: SocketAddr,
    socket_path: Option<PathBuf>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl DualListener {
    /// Bind both listeners and start serving the router
    ///
    /// `socket_path` of `None` disables the IPC listener (or on platforms
    /// without Unix sockets).
    pub async fn serve(
        listen: &str,
        socket_path: Option<&Path>,
        router: Router,
    ) -> WebResult<Self> {
        let tcp_listener = TcpListener::bind(listen).await.map_err(|e| {
            WebError::Conflict(format!("failed to bind {}: {}", listen, e))
        })?;
        let tcp_addr = tcp_listener
            .local_addr()
            .map_err(|e| WebError::Internal(e.to_string()))?;

        let mut tasks = Vec::new();

        let tcp_router = router
            .clone()
            .layer(Extension(ConnectionSource::Tcp));
        tasks.push(tokio::spawn(async move {
            let app = tcp_router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(tcp_listener, app).await {
                tracing::error!(error = %e, "TCP listener exited");
            }
        }));

        let mut bound_socket = None;
        #[cfg(unix)]
        if let Some(path) = socket_path {
            let uds = bind_unix_socket(path)?;
            bound_socket = Some(path.to_path_buf());

            let tray_router = router.layer(Extension(ConnectionSource::Tray));
            tasks.push(tokio::spawn(async move {
                if let Err(e) = axum::serve(uds, tray_router).await {
                    tracing::error!(error = %e, "IPC listener exited");
                }
            }));
        }
        #[cfg(not(unix))]
        if socket_path.is_some() {
            tracing::warn!("Local IPC endpoint is only supported on Unix platforms");
        }

        Ok(Self {
            tcp_addr,
            socket_path: bound_socket,
            tasks,
        })
    }

    /// Bound TCP address
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Bound socket path, when the IPC listener is up
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Stop accepting and drop the socket file
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        if let Some(path) = self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Bind the Unix socket, cleaning up a stale file from a crashed predecessor
#[cfg(unix)]
fn bind_unix_socket(path: &Path) -> WebResult<PeerCheckedUnixListener> {
    use std::os::unix::fs::PermissionsExt;

    if path.exists() {
        // A live daemon answers a connect; a stale socket does not
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => {
                return Err(WebError::Conflict(format!(
                    "another instance is listening on {}",
                    path.display()
                )));
            }
            Err(_) => {
                tracing::info!(path = %path.display(), "Removing stale socket");
                std::fs::remove_file(path)
                    .map_err(|e| WebError::Internal(format!("unlink stale socket: {}", e)))?;
            }
        }
    }

    let listener = std::os::unix::net::UnixListener::bind(path)
        .map_err(|e| WebError::Conflict(format!("failed to bind {}: {}", path.display(), e)))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| WebError::Internal(e.to_string()))?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| WebError::Internal(format!("chmod socket: {}", e)))?;

    let listener = tokio::net::UnixListener::from_std(listener)
        .map_err(|e| WebError::Internal(e.to_string()))?;

    Ok(PeerCheckedUnixListener { inner: listener })
}

/// Unix listener that only yields connections from the server's own UID
#[cfg(unix)]
pub struct PeerCheckedUnixListener {
    inner: tokio::net::UnixListener,
}

#[cfg(unix)]
impl axum::serve::Listener for PeerCheckedUnixListener {
    type Io = tokio::net::UnixStream;
    type Addr = tokio::net::unix::SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let Ok((stream, addr)) = self.inner.accept().await else {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            };

            let server_uid = unsafe { libc::geteuid() };
            match stream.peer_cred() {
                Ok(cred) if cred.uid() == server_uid => return (stream, addr),
                Ok(cred) => {
                    tracing::warn!(
                        peer_uid = cred.uid(),
                        server_uid,
                        "Rejecting IPC connection from foreign UID"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Rejecting IPC connection without peer credentials");
                }
            }
            // Dropping the stream closes the rejected connection
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    async fn status() -> &'static str {
        "ok"
    }

    #[tokio::test]
    async fn test_serve_binds_tcp_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("mcpproxy.sock");
        let router = Router::new().route("/api/v1/status", get(status));

        let listener = DualListener::serve("127.0.0.1:0", Some(&socket), router)
            .await
            .unwrap();
        assert_ne!(listener.tcp_addr().port(), 0);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert!(socket.exists());
            let mode = std::fs::metadata(&socket).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        listener.shutdown().await;
        assert!(!socket.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("mcpproxy.sock");

        // A bound-then-dropped listener leaves a stale file behind
        {
            let stale = std::os::unix::net::UnixListener::bind(&socket).unwrap();
            drop(stale);
        }
        assert!(socket.exists());

        let router = Router::new().route("/api/v1/status", get(status));
        let listener = DualListener::serve("127.0.0.1:0", Some(&socket), router)
            .await
            .unwrap();
        assert!(socket.exists());
        listener.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_same_uid_connection_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("mcpproxy.sock");
        let router = Router::new().route("/api/v1/status", get(status));
        let listener = DualListener::serve("127.0.0.1:0", Some(&socket), router)
            .await
            .unwrap();

        let stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = stream;
        stream
            .write_all(b"GET /api/v1/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf);
        assert!(response.starts_with("HTTP/1.1 200"));

        listener.shutdown().await;
    }
}
