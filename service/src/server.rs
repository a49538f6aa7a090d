//! Server lifecycle
//!
//! [`ConformanceServer::bind`] owns the listener, [`ConformanceServer::start`]
//! begins accepting calls on a background task, and
//! [`RunningServer::shutdown`] stops it gracefully. Binding to port 0 and
//! reading [`RunningServer::local_addr`] is how tests get a private server.

use crate::error::Result;
use crate::service::ConformanceService;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::service::Routes;
use tracing::info;

/// A bound, not yet serving, conformance server
pub struct ConformanceServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl ConformanceServer {
    /// Bind the gRPC listener.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "gRPC listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `signal` resolves, then stop gracefully.
    ///
    /// Calls are routed through axum rather than `tonic::transport::Server`,
    /// whose own `grpc-timeout` layer would answer an expired call before the
    /// handler's call context could.
    pub async fn serve_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(addr = %self.local_addr, "gRPC server listening");

        let router = Routes::new(ConformanceService::new().into_server()).into_axum_router();
        axum::serve(self.listener, router)
            .tcp_nodelay(true)
            .with_graceful_shutdown(signal)
            .await?;

        info!(addr = %self.local_addr, "gRPC server stopped");
        Ok(())
    }

    /// Start serving on a background task.
    pub fn start(self) -> RunningServer {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let local_addr = self.local_addr;

        let handle = tokio::spawn(self.serve_until(async move {
            // A dropped sender stops the server too.
            let _ = shutdown_rx.await;
        }));

        RunningServer {
            local_addr,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }
}

/// Handle to a server accepting calls
///
/// Dropping the handle stops the server.
pub struct RunningServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://` URI for clients.
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stop accepting calls and wait for in-flight calls to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        (&mut self.handle).await?
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = ConformanceServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_start_then_shutdown() {
        let server = ConformanceServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let running = server.start();
        assert!(running.endpoint().starts_with("http://127.0.0.1:"));
        running.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_io_error() {
        let first = ConformanceServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let err = ConformanceServer::bind(first.local_addr()).await.err().unwrap();
        assert!(matches!(err, crate::error::ServiceError::Io(_)));
    }
}
