//! Duplicating handler: mirrors a client's traffic to several targets.
//!
//! Outbound bytes go to every target through a [`FanOut`]. Only the primary
//! target (the first in the list) is read from; its replies are relayed to
//! the client. Replies from the other targets are never read.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::copy::copy_with_cancel;
use crate::error::{ProxyError, Result};
use crate::handlers::fanout::{copy_to_fan_out, FanOut};
use crate::target::{MultiTargetSelector, TargetSelector};

#[derive(Debug, Clone)]
pub struct DuplicatingHandler<S = MultiTargetSelector> {
    selector: S,
}

impl<S> DuplicatingHandler<S>
where
    S: TargetSelector,
{
    pub fn new(selector: S) -> Self {
        Self { selector }
    }

    pub fn selector(&self) -> &S {
        &self.selector
    }

    /// Relay `client` to all targets.
    ///
    /// Fails without copying if any target cannot be reached. Otherwise
    /// returns the first error from either direction, or `Ok` once the client
    /// and the primary target have both finished. All streams are closed on
    /// return.
    pub async fn handle_connection(
        &self,
        cancel: &CancellationToken,
        client: TcpStream,
    ) -> Result<()> {
        let targets = self.selector.connect(cancel).await?;
        if targets.is_empty() {
            debug!("No targets configured, closing client");
            return Ok(());
        }

        let (mut client_read, mut client_write) = client.into_split();

        let mut readers = Vec::with_capacity(targets.len());
        let mut writers = Vec::with_capacity(targets.len());
        for stream in targets {
            let (read, write) = stream.into_split();
            readers.push(read);
            writers.push(write);
        }

        let mut readers = readers.into_iter();
        let Some(mut primary) = readers.next() else {
            return Ok(());
        };
        // Held open, never drained, until the handler returns.
        let _secondaries: Vec<_> = readers.collect();

        let mut tasks = JoinSet::new();

        let fan_out_cancel = cancel.clone();
        let fan_out_targets = writers.len();
        tasks.spawn(async move {
            let mut sink = FanOut::new(writers);
            let bytes = copy_to_fan_out(&mut client_read, &mut sink, &fan_out_cancel).await?;
            // Let every backend see the client's end of stream.
            sink.shutdown().await?;
            trace!(bytes, targets = fan_out_targets, "Client to targets finished");
            Ok::<_, ProxyError>(())
        });

        let reply_cancel = cancel.clone();
        tasks.spawn(async move {
            let bytes = copy_with_cancel(&mut primary, &mut client_write, &reply_cancel).await?;
            client_write.shutdown().await?;
            trace!(bytes, "Primary target to client finished");
            Ok::<_, ProxyError>(())
        });

        // One result per task; the first failure wins and aborts the rest.
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        Ok(())
    }
}
