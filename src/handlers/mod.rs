//! Connection handlers.
//!
//! A handler takes ownership of one accepted client connection and relays it
//! until either side finishes, an error occurs, or the shared cancellation
//! token fires.
//!
//! ## Handlers
//! - `echo`: loops the client's bytes back to it
//! - `passthrough`: relays the client to a single target
//! - `duplicating`: mirrors the client to every target, replies come from the
//!   first target only
//!
//! The handler is chosen once at startup from the configuration.

pub mod duplicating;
pub mod echo;
pub mod fanout;
pub mod passthrough;

pub use duplicating::DuplicatingHandler;
pub use echo::EchoHandler;
pub use passthrough::PassThroughHandler;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::target::{MultiTargetSelector, TargetSelector};

/// The configured connection handler.
#[derive(Debug, Clone)]
pub enum Handler {
    Echo(EchoHandler),
    PassThrough(PassThroughHandler),
    Duplicating(DuplicatingHandler),
}

impl Handler {
    /// Pick a handler from the configuration.
    ///
    /// Echo mode ignores targets. A single target is relayed directly; two or
    /// more are duplicated with the first one as primary.
    pub fn from_config(config: &Config) -> Self {
        if config.echo {
            return Handler::Echo(EchoHandler);
        }

        match config.targets.as_slice() {
            [target] => Handler::PassThrough(
                PassThroughHandler::new(target.clone()).with_nodelay(config.nodelay),
            ),
            targets => Handler::Duplicating(DuplicatingHandler::new(
                MultiTargetSelector::new(targets.to_vec()).with_nodelay(config.nodelay),
            )),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Handler::Echo(_) => "echo",
            Handler::PassThrough(_) => "pass-through",
            Handler::Duplicating(_) => "duplicating",
        }
    }

    /// Targets this handler relays to; empty in echo mode.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Handler::Echo(_) => Vec::new(),
            Handler::PassThrough(handler) => vec![handler.target()],
            Handler::Duplicating(handler) => handler
                .selector()
                .targets()
                .iter()
                .map(String::as_str)
                .collect(),
        }
    }

    /// Handle one client connection to completion.
    pub async fn handle_connection(
        &self,
        cancel: &CancellationToken,
        client: TcpStream,
    ) -> Result<()> {
        match self {
            Handler::Echo(handler) => handler.handle_connection(cancel, client).await,
            Handler::PassThrough(handler) => handler.handle_connection(cancel, client).await,
            Handler::Duplicating(handler) => handler.handle_connection(cancel, client).await,
        }
    }
}
