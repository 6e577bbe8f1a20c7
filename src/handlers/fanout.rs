//! Fan-out write sink for duplicated traffic.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::copy::with_cancel;
use crate::error::Result;

/// Read buffer size for the client side of a duplicated connection
const BUFFER_SIZE: usize = 16 * 1024;

/// Writes every buffer to all targets, in list order.
///
/// A write fails as soon as one target fails. Targets earlier in the list
/// have already received that buffer by then and are not rolled back, so
/// the streams seen by different backends may diverge after a failure.
pub struct FanOut<W> {
    targets: Vec<W>,
}

impl<W> FanOut<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(targets: Vec<W>) -> Self {
        Self { targets }
    }

    /// Write all of `buf` to each target in turn.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        for (index, target) in self.targets.iter_mut().enumerate() {
            if let Err(e) = target.write_all(buf).await {
                debug!(index, error = %e, "Fan-out write failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Shut down the write side of every target.
    ///
    /// All targets are attempted; the first error is returned.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        let mut first_err = None;
        for target in self.targets.iter_mut() {
            if let Err(e) = target.shutdown().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Copy `src` into every target of `sink` until EOF, error, or cancellation.
///
/// Returns the number of bytes read from `src`; each target received that
/// many bytes when the copy succeeds.
pub async fn copy_to_fan_out<R, W>(
    src: &mut R,
    sink: &mut FanOut<W>,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin,
{
    with_cancel(cancel, async {
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
        let mut total = 0u64;

        loop {
            buffer.clear();
            let n = src.read_buf(&mut buffer).await?;
            if n == 0 {
                return Ok::<_, io::Error>(total);
            }

            sink.write_all(&buffer).await?;
            total += n as u64;
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_write_all_reaches_every_target() {
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);
        let (c, mut c_peer) = tokio::io::duplex(1024);

        let mut sink = FanOut::new(vec![a, b, c]);

        sink.write_all(b"duplicated").await.unwrap();
        sink.shutdown().await.unwrap();

        for peer in [&mut a_peer, &mut b_peer, &mut c_peer] {
            let mut received = Vec::new();
            peer.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"duplicated");
        }
    }

    #[tokio::test]
    async fn test_failed_target_stops_the_write() {
        let first = tokio_test::io::Builder::new().write(b"data").build();
        let second = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .build();
        // Never written to: the write stops at the failing target.
        let third = tokio_test::io::Builder::new().build();

        let mut sink = FanOut::new(vec![first, second, third]);
        let err = sink.write_all(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_copy_to_fan_out() {
        let mut src = tokio_test::io::Builder::new()
            .read(b"first ")
            .read(b"second")
            .build();
        let (a, mut a_peer) = tokio::io::duplex(1024);
        let (b, mut b_peer) = tokio::io::duplex(1024);
        let mut sink = FanOut::new(vec![a, b]);

        let n = copy_to_fan_out(&mut src, &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 12);
        drop(sink);

        let mut received = Vec::new();
        a_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"first second");

        received.clear();
        b_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"first second");
    }

    #[tokio::test]
    async fn test_copy_to_fan_out_cancelled() {
        let (_client, mut idle) = tokio::io::duplex(64);
        let (a, _a_peer) = tokio::io::duplex(64);
        let mut sink = FanOut::new(vec![a]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let res = tokio::time::timeout(
            Duration::from_secs(2),
            copy_to_fan_out(&mut idle, &mut sink, &cancel),
        )
        .await
        .expect("fan-out copy did not observe cancellation");
        assert!(matches!(res, Err(ProxyError::Cancelled)));
    }
}
