//! Interactive echo client.
//!
//! Holds one connection. A reader task reports every line the server sends,
//! while the caller's input is relayed line by line. When input ends the
//! write half is shut down, the server closes its side, and the reader
//! drains the remaining echoes before `run` returns.

use crate::codec::{write_line, LineReader};
use crate::config::ClientConfig;
use crate::error::ConnError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One line crossing the connection, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relay {
    /// Read from local input and sent to the server.
    Sent(String),
    /// Received from the server.
    Received(String),
}

impl fmt::Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Relay::Sent(line) => write!(f, "client: {line}"),
            Relay::Received(line) => write!(f, "server: {line}"),
        }
    }
}

/// A connected echo client.
pub struct Client {
    stream: TcpStream,
    server: SocketAddr,
    drain_timeout: Duration,
    max_line_length: usize,
}

impl Client {
    /// Connect to the configured server. No retries.
    pub async fn connect(config: &ClientConfig) -> io::Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&config.server))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out connecting to {}", config.server),
                )
            })??;
        stream.set_nodelay(true)?;

        let server = stream.peer_addr()?;
        info!(server = %server, "Connected");

        Ok(Client {
            stream,
            server,
            drain_timeout: config.drain_timeout,
            max_line_length: config.max_line_length,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Relay `input` to the server until it ends, reporting traffic on `events`.
    ///
    /// Returns an error when either direction fails. The server closing the
    /// connection is not an error; the relay just stops.
    pub async fn run<I>(self, input: I, events: mpsc::UnboundedSender<Relay>) -> Result<(), ConnError>
    where
        I: AsyncBufRead + Unpin,
    {
        let (reader, mut writer) = self.stream.into_split();
        let mut reader_task = tokio::spawn(read_from_server(
            reader,
            self.max_line_length,
            events.clone(),
        ));
        let mut input = input.lines();

        let relayed = loop {
            tokio::select! {
                line = input.next_line() => match line {
                    Ok(Some(line)) => {
                        let _ = events.send(Relay::Sent(line.clone()));
                        if let Err(e) = write_line(&mut writer, &line).await {
                            warn!(error = %e, "Failed to send line");
                            break Err(e);
                        }
                    }
                    Ok(None) => {
                        debug!("Input ended");
                        break Ok(());
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read input");
                        break Err(ConnError::Io(e));
                    }
                },
                finished = &mut reader_task => {
                    let result = joined(finished);
                    if result.is_ok() {
                        warn!(server = %self.server, "Server closed the connection");
                    }
                    return result;
                }
            }
        };

        // Half-close: the server sees end-of-stream, echoes what it has and
        // closes, which in turn ends the reader.
        if let Err(e) = writer.shutdown().await {
            debug!(error = %e, "Failed to shut down write half");
        }

        let received = match tokio::time::timeout(self.drain_timeout, &mut reader_task).await {
            Ok(finished) => joined(finished),
            Err(_) => {
                warn!("Server did not close the connection in time");
                reader_task.abort();
                Ok(())
            }
        };

        relayed.and(received)
    }
}

async fn read_from_server(
    reader: OwnedReadHalf,
    max_line_length: usize,
    events: mpsc::UnboundedSender<Relay>,
) -> Result<(), ConnError> {
    let mut lines = LineReader::new(reader, max_line_length);

    loop {
        match lines.read_line().await {
            Ok(line) => {
                if events.send(Relay::Received(line)).is_err() {
                    return Ok(());
                }
            }
            Err(ConnError::Closed) => {
                debug!("Server closed the connection");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Lost connection to server");
                return Err(e);
            }
        }
    }
}

fn joined(
    finished: Result<Result<(), ConnError>, tokio::task::JoinError>,
) -> Result<(), ConnError> {
    finished.unwrap_or_else(|e| Err(ConnError::Io(io::Error::other(e))))
}
