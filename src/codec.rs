//! Newline framing over async byte streams.
//!
//! ```text
//! wire:    hello\nworld\r\n
//! lines:   "hello", "world"
//! ```
//!
//! Both `\n` and `\r\n` terminate a line on input; output always uses `\n`.
//! Lines are bounded: once more than `max_line_length` content bytes are
//! buffered without a delimiter, reading fails with `LineTooLong`.

use crate::error::ConnError;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default bound on a single line, delimiter excluded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Initial read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Reads newline-delimited UTF-8 lines from an async reader.
pub struct LineReader<R> {
    reader: R,
    buffer: BytesMut,
    /// Prefix of `buffer` already searched for a delimiter.
    scanned: usize,
    max_line_length: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line_length: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(BUFFER_SIZE.min(max_line_length.saturating_add(2))),
            scanned: 0,
            max_line_length,
        }
    }

    /// Read the next line with its delimiter stripped.
    ///
    /// Returns `ConnError::Closed` at end-of-stream, also when the stream
    /// ends in the middle of a line; the fragment is dropped.
    pub async fn read_line(&mut self) -> Result<String, ConnError> {
        loop {
            if let Some(offset) = find_newline(&self.buffer[self.scanned..]) {
                let end = self.scanned + offset;
                let frame = self.buffer.split_to(end + 1);
                self.scanned = 0;
                return self.decode(frame);
            }
            self.scanned = self.buffer.len();

            // One extra byte may be the `\r` of a `\r\n` pair.
            if self.buffer.len() > self.max_line_length.saturating_add(1) {
                return Err(ConnError::LineTooLong {
                    limit: self.max_line_length,
                });
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(ConnError::Closed);
            }
        }
    }

    fn decode(&self, mut frame: BytesMut) -> Result<String, ConnError> {
        frame.truncate(frame.len() - 1);
        if frame.last() == Some(&b'\r') {
            frame.truncate(frame.len() - 1);
        }
        if frame.len() > self.max_line_length {
            return Err(ConnError::LineTooLong {
                limit: self.max_line_length,
            });
        }
        String::from_utf8(frame.to_vec()).map_err(|_| ConnError::InvalidUtf8)
    }
}

/// Write `line` followed by a single `\n`, then flush.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), ConnError>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::with_capacity(line.len() + 1);
    out.extend_from_slice(line.as_bytes());
    out.put_u8(b'\n');
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

fn find_newline(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}
