//! Cancellable byte copying.
//!
//! Every copy races against the shared [`CancellationToken`]. When the token
//! wins, the copy future is dropped: tokio I/O futures stop at their next
//! suspension point, so no transfer keeps running in the background after the
//! caller has returned.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, Result};

/// Drive `fut` to completion unless `cancel` fires first.
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::select! {
        // Prefer reporting cancellation when both are ready.
        biased;
        _ = cancel.cancelled() => Err(ProxyError::Cancelled),
        res = fut => res.map_err(ProxyError::Io),
    }
}

/// Copy `src` into `dst` until EOF, an I/O error, or cancellation.
///
/// Returns the number of bytes copied. EOF on `src` is success; `dst` is not
/// shut down here, callers decide whether to propagate the half-close.
pub async fn copy_with_cancel<R, W>(
    src: &mut R,
    dst: &mut W,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    with_cancel(cancel, tokio::io::copy(src, dst)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_copy_until_eof() {
        let mut src = tokio_test::io::Builder::new()
            .read(b"hello ")
            .read(b"world")
            .build();
        let mut dst = Vec::new();

        let n = copy_with_cancel(&mut src, &mut dst, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(n, 11);
        assert_eq!(dst, b"hello world");
    }

    #[tokio::test]
    async fn test_read_error_is_returned() {
        let mut src = tokio_test::io::Builder::new()
            .read(b"partial")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let mut dst = Vec::new();

        let err = copy_with_cancel(&mut src, &mut dst, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ProxyError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_unblocks_idle_copy() {
        // Peer half stays open and silent, so the read never completes.
        let (_peer, mut idle) = tokio::io::duplex(64);
        let mut dst = Vec::new();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let res = tokio::time::timeout(
            Duration::from_secs(2),
            copy_with_cancel(&mut idle, &mut dst, &cancel),
        )
        .await
        .expect("copy did not observe cancellation");

        assert!(matches!(res, Err(ProxyError::Cancelled)));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let mut src: &[u8] = b"never copied";
        let mut dst = Vec::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = copy_with_cancel(&mut src, &mut dst, &cancel).await;
        assert!(matches!(res, Err(ProxyError::Cancelled)));
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn test_copy_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut sink = Vec::new();

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let n = copy_with_cancel(&mut server, &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(sink, b"ping");
    }
}
