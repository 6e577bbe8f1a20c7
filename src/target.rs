//! Backend target selection.
//!
//! A selector owns an ordered, immutable list of `host:port` targets and
//! opens one connection to each of them per client. Connecting is
//! all-or-nothing: a caller either receives a stream for every target, in
//! list order, or an error and no streams at all.
//!
//! The selector never keeps the streams it opens. Ownership passes to the
//! caller on return and the streams close when the caller drops them.

use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::copy::with_cancel;
use crate::error::{ProxyError, Result};

/// Opens connections to a fixed set of backends.
pub trait TargetSelector: Send + Sync {
    /// The configured targets, in dial order.
    fn targets(&self) -> &[String];

    /// Connect to every target, in order.
    ///
    /// Returns exactly `targets().len()` streams, index-aligned with the
    /// target list, or an error with every already-opened stream closed.
    fn connect(
        &self,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<TcpStream>>> + Send;
}

/// Selector that dials all configured targets sequentially.
#[derive(Debug, Clone)]
pub struct MultiTargetSelector {
    targets: Arc<[String]>,
    nodelay: bool,
}

impl MultiTargetSelector {
    pub fn new(targets: Vec<String>) -> Self {
        Self {
            targets: targets.into(),
            nodelay: true,
        }
    }

    /// Set TCP_NODELAY on every stream this selector opens.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl TargetSelector for MultiTargetSelector {
    fn targets(&self) -> &[String] {
        &self.targets
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Vec<TcpStream>> {
        let mut streams = Vec::with_capacity(self.targets.len());

        for (index, target) in self.targets.iter().enumerate() {
            match dial(target, self.nodelay, cancel).await {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    debug!(
                        addr = %target,
                        index,
                        opened = streams.len(),
                        "Target connect failed, closing opened streams"
                    );
                    // Dropping closes every stream opened so far.
                    drop(streams);
                    return Err(e);
                }
            }
        }

        Ok(streams)
    }
}

/// Open a single connection to `target`, honouring cancellation.
pub async fn dial(target: &str, nodelay: bool, cancel: &CancellationToken) -> Result<TcpStream> {
    let stream = with_cancel(cancel, TcpStream::connect(target))
        .await
        .map_err(|e| match e {
            ProxyError::Io(source) => ProxyError::Dial {
                target: target.to_string(),
                source,
            },
            other => other,
        })?;

    if nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(addr = %target, error = %e, "Failed to set TCP_NODELAY");
        }
    }

    trace!(addr = %target, "Connected to target");
    Ok(stream)
}
