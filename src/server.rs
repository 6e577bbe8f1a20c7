//! TCP accept loop for the relay.
//!
//! Accepts client connections, hands each one to the configured handler on
//! its own task, and stops accepting when the shared cancellation token
//! fires. In-flight connections observe the same token and are drained
//! before `run` returns.

use crate::config::Config;
use crate::handlers::Handler;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Listen backlog for the accept socket
const LISTEN_BACKLOG: i32 = 1024;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Server startup errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to resolve listen address '{0}'")]
    Resolve(String, #[source] io::Error),

    #[error("Listen address '{0}' did not resolve to any socket address")]
    NoAddress(String),

    #[error("Failed to listen on {0}")]
    Bind(SocketAddr, #[source] io::Error),
}

/// Relay server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    handler: Arc<Handler>,
    connection_limit: Arc<Semaphore>,
    nodelay: bool,
}

impl Server {
    /// Bind the listening socket described by `config`.
    pub async fn bind(config: &Config, handler: Handler) -> Result<Self, ServerError> {
        let addr = tokio::net::lookup_host(&config.listen)
            .await
            .map_err(|e| ServerError::Resolve(config.listen.clone(), e))?
            .next()
            .ok_or_else(|| ServerError::NoAddress(config.listen.clone()))?;

        let listener = create_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Bind(addr, e))?;

        Ok(Server {
            listener,
            local_addr,
            handler: Arc::new(handler),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            nodelay: config.nodelay,
        })
    }

    /// Address the server is actually listening on.
    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `cancel` fires, then wait for in-flight
    /// connections to finish.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServerError> {
        let tracker = TaskTracker::new();

        info!(
            address = %self.local_addr,
            handler = self.handler.name(),
            targets = ?self.handler.targets(),
            "Relay listening"
        );

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        if backoff(&cancel).await {
                            continue;
                        }
                        break;
                    }
                },
            };

            debug!(peer = %peer, "New connection");
            self.configure(&stream, peer);

            let handler = Arc::clone(&self.handler);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                match handler.handle_connection(&cancel, stream).await {
                    Ok(()) => debug!(peer = %peer, "Connection closed"),
                    Err(e) if e.is_cancelled() => debug!(peer = %peer, "Connection cancelled"),
                    Err(e) => warn!(peer = %peer, error = %e, "Connection error"),
                }
                drop(permit);
            });
        }

        info!(in_flight = tracker.len(), "Stopped accepting, draining connections");
        tracker.close();
        tracker.wait().await;
        info!("Relay stopped");
        Ok(())
    }

    fn configure(&self, stream: &TcpStream, peer: SocketAddr) {
        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
        }
    }
}

/// Sleep for [`ACCEPT_BACKOFF`], returning `false` if `cancel` fires first.
async fn backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::echo_target;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(echo: bool, targets: Vec<String>) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            targets,
            echo,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_echo_server_round_trip_and_shutdown() {
        let config = config(true, Vec::new());
        let server = Server::bind(&config, Handler::from_config(&config))
            .await
            .unwrap();
        let addr = server.local_addr();

        let cancel = CancellationToken::new();
        let run = tokio::spawn(server.run(cancel.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"round trip").await.unwrap();
        let mut buf = [0u8; 10];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("no echo from server")
            .unwrap();
        assert_eq!(&buf, b"round trip");

        // Cancelling stops the accept loop and the idle connection.
        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("server did not stop")
            .unwrap();
        assert!(res.is_ok());
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_pass_through_server() {
        let target = echo_target().await;
        let config = config(false, vec![target]);
        let server = Server::bind(&config, Handler::from_config(&config))
            .await
            .unwrap();
        let addr = server.local_addr();

        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"relayed").await.unwrap();
        let mut buf = [0u8; 7];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
            .await
            .expect("no reply through relay")
            .unwrap();
        assert_eq!(&buf, b"relayed");

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_address() {
        let mut config = config(true, Vec::new());
        config.listen = "not an address".to_string();

        let res = Server::bind(&config, Handler::from_config(&config)).await;
        assert!(matches!(res, Err(ServerError::Resolve(..))));
    }

    #[tokio::test]
    async fn test_accept_backoff_waits_before_retry() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        assert!(backoff(&cancel).await);
        assert!(start.elapsed() >= ACCEPT_BACKOFF);
    }

    #[tokio::test]
    async fn test_accept_backoff_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), backoff(&cancel))
            .await
            .expect("backoff ignored cancellation");
        assert!(!res);
    }
}
