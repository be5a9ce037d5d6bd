use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest request line the front end accepts, excluding the CRLF.
pub const MAX_LINE_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum ReadError {
    /// A line grew past the reader's limit before its CRLF arrived. The
    /// stream can't be resynchronised after this.
    #[error("line exceeds {0} bytes")]
    TooLong(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Provides a facility to read CRLF-terminated lines from a stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Stores data that's been read in but lacks a CRLF.
    buf: BytesMut,
    /// Index in buf from which a valid CRLF pair may appear (and before which
    /// a CRLF sequence hasn't been seen).
    maybe_crlf_from: usize,
    /// Data source
    reader: T,
    /// On a reading error, this field is set and its value returned once the
    /// buffer is drained of pending lines.
    pending_error: Option<io::Error>,
    max_len: usize,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Limits lines to `max_len` bytes, excluding the CRLF.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Reads a line from the internal buffer and/or reader. On an end-of-stream
    /// condition, returns a None result, discarding any partly-read line in the
    /// internal buffer.
    ///
    /// This function is cancel-safe: its only async operation is a `read_buf`
    /// against the internal `reader`, and so it has the same guarantees:
    /// either a complete read occurs and is processed, or this is cancelled.
    ///
    /// On a read error, the error value is returned after processing all
    /// pending lines in the internal buffer, but calling `read_line` again will
    /// attempt a new read safely.
    pub async fn read_line(&mut self) -> Result<Option<Bytes>, ReadError> {
        loop {
            // We slice and dice buf here to avoid re-reading all but the last
            // byte of the part of the line we've already seen, keeping
            // O(bytes_read) behaviour.
            // Note also we need to scan from one position earlier than the
            // start of the newest bytes in case we received a \r then \n on the
            // next read.
            // The outer loop ensures pipelined lines that arrive in the same
            // read_buf call are handled correctly: we only call read_buf once
            // all pending lines in the internal buffer have been removed.
            if let Some(eoc) = self
                .buf
                .iter()
                .skip(self.maybe_crlf_from)
                .tuple_windows::<(_, _)>()
                .position(|x| x == (&b'\r', &b'\n'))
            {
                let len = self.maybe_crlf_from + eoc;
                if len > self.max_len {
                    return Err(ReadError::TooLong(self.max_len));
                }

                // This should be a complete line. Freeze the result to make it
                // read-only.
                let line = self.buf.split_to(len + 2).freeze();

                // Zero out the maybe_crlf_from position so we restart scanning
                // for lines from the start of the unread buffer section.
                self.maybe_crlf_from = 0;

                // Drop trailing b"\r\n".
                return Ok(Some(line.slice(0..len)));
            }

            // A full-length line plus its \r can be waiting on the \n; any
            // more than that can't end in time.
            if self.buf.len() > self.max_len + 1 {
                return Err(ReadError::TooLong(self.max_len));
            }

            // Try reading from the reader and accumulating in the buffer;
            // if we receive any bytes, re-scan for a CRLF, otherwise
            // assume the connection is dead/closed.
            let n_bytes_read = self.fill().await;

            // Slightly convoluted, but all this does is set maybe_crlf_from
            // to the byte before the first byte returned in the read_buf
            // call (and 0 if buf is empty).
            self.maybe_crlf_from =
                self.buf.len().checked_sub(n_bytes_read + 1).unwrap_or(0);

            // If we didn't read any bytes this time around, assume we've
            // reached an end-of-stream condition. Return any pending error:
            // we wouldn't be able to parse out another line, given we just
            // read 0 bytes.
            if n_bytes_read == 0 {
                return match self.pending_error.take() {
                    Some(e) => Err(e.into()),
                    None => Ok(None),
                };
            }
        }
    }

    /// Reads exactly `n` bytes followed by a CRLF, as in the body of an
    /// `OK <n>` response. Returns None if the stream ends first.
    pub async fn read_chunk(
        &mut self,
        n: usize,
    ) -> Result<Option<Bytes>, ReadError> {
        while self.buf.len() < n + 2 {
            if self.fill().await == 0 {
                return match self.pending_error.take() {
                    Some(e) => Err(e.into()),
                    None => Ok(None),
                };
            }
        }

        if &self.buf[n..n + 2] != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk not terminated by CRLF",
            )
            .into());
        }

        let chunk = self.buf.split_to(n + 2).freeze();
        self.maybe_crlf_from = 0;
        Ok(Some(chunk.slice(0..n)))
    }

    /// Reads once into the buffer, stashing any error. Returns the number of
    /// bytes read.
    async fn fill(&mut self) -> usize {
        match self.reader.read_buf(&mut self.buf).await {
            Ok(n) => n,
            Err(e) => {
                self.pending_error = Some(e);
                0
            },
        }
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            maybe_crlf_from: 0,
            reader: value,
            pending_error: None,
            max_len: MAX_LINE_LEN,
        }
    }
}
