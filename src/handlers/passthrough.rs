//! Pass-through handler: relays a client to exactly one target.

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::copy::copy_with_cancel;
use crate::error::{ProxyError, Result};
use crate::target::dial;

#[derive(Debug, Clone)]
pub struct PassThroughHandler {
    target: String,
    nodelay: bool,
}

impl PassThroughHandler {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            nodelay: true,
        }
    }

    /// Set TCP_NODELAY on the target stream.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Relay `client` to the target in both directions.
    ///
    /// Returns when either direction ends. The other direction is aborted and
    /// both streams are closed.
    pub async fn handle_connection(
        &self,
        cancel: &CancellationToken,
        client: TcpStream,
    ) -> Result<()> {
        let upstream = dial(&self.target, self.nodelay, cancel).await?;

        let (mut client_read, mut client_write) = client.into_split();
        let (mut target_read, mut target_write) = upstream.into_split();

        let mut tasks = JoinSet::new();

        let upload_cancel = cancel.clone();
        tasks.spawn(async move {
            let bytes =
                copy_with_cancel(&mut client_read, &mut target_write, &upload_cancel).await?;
            trace!(bytes, "Client to target finished");
            Ok::<_, ProxyError>(())
        });

        let download_cancel = cancel.clone();
        tasks.spawn(async move {
            let bytes =
                copy_with_cancel(&mut target_read, &mut client_write, &download_cancel).await?;
            trace!(bytes, "Target to client finished");
            Ok::<_, ProxyError>(())
        });

        // Dropping the set on return aborts whichever direction is still running.
        match tasks.join_next().await {
            Some(joined) => joined?,
            None => Ok(()),
        }
    }
}
