//! Echo handler: sends a client's bytes straight back to it.
//!
//! No target is involved. Useful as a stand-in backend and for checking
//! that the relay moves bytes unmodified.

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::copy::copy_with_cancel;
use crate::error::Result;

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl EchoHandler {
    /// Echo until the client closes, an I/O error, or cancellation.
    ///
    /// The client stream is closed on return.
    pub async fn handle_connection(
        &self,
        cancel: &CancellationToken,
        mut client: TcpStream,
    ) -> Result<()> {
        let (mut reader, mut writer) = client.split();
        let bytes = copy_with_cancel(&mut reader, &mut writer, cancel).await?;
        trace!(bytes, "Echo finished");
        Ok(())
    }
}
