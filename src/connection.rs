//! Echo handler for a single connection.
//!
//! The handler owns its stream for its whole lifetime. It reads a line,
//! writes it back with a `\n` and repeats until the connection ends:
//!
//! ```text
//! AWAITING_LINE --line--> LINE_READY --echo--> AWAITING_LINE
//!       |
//!       +--eof / error / timeout / shutdown--> CLOSED
//! ```
//!
//! Dropping the stream on return closes the connection on every exit path.

use crate::codec::{write_line, LineReader, DEFAULT_MAX_LINE_LENGTH};
use crate::error::ConnError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Per-connection limits, copied into every handler.
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    /// Maximum line length in bytes, delimiter excluded.
    pub max_line_length: usize,
    /// Close the connection when no complete line arrives in this time.
    pub idle_timeout: Option<Duration>,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            idle_timeout: None,
        }
    }
}

/// Serve one accepted TCP connection until it ends.
///
/// Never fails: every outcome is local to this connection and only logged.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    settings: HandlerSettings,
    shutdown: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();

    match echo_lines(reader, writer, &settings, shutdown).await {
        Ok(()) => debug!(peer = %peer, "Connection closed"),
        Err(e) => debug!(peer = %peer, error = %e, "Connection terminated"),
    }
}

/// Run the echo loop over a read half and a write half.
///
/// Returns `Ok(())` when the peer closes the stream or shutdown is
/// signalled. Any other way out is returned as the error.
pub async fn echo_lines<R, W>(
    reader: R,
    mut writer: W,
    settings: &HandlerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConnError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = LineReader::new(reader, settings.max_line_length);

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                trace!("Shutdown requested");
                return Ok(());
            }
            next = next_line(&mut lines, settings.idle_timeout) => next,
        };

        match next {
            Ok(line) => {
                trace!(len = line.len(), "Echoing line");
                write_line(&mut writer, &line).await?;
            }
            Err(ConnError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

async fn next_line<R>(
    lines: &mut LineReader<R>,
    idle_timeout: Option<Duration>,
) -> Result<String, ConnError>
where
    R: AsyncRead + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, lines.read_line())
            .await
            .unwrap_or_else(|_| Err(ConnError::IdleTimeout)),
        None => lines.read_line().await,
    }
}

/// Resolves once shutdown is signalled, or the server side went away.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
