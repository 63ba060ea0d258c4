use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::Framing;
use crate::error::FrameError;

/// Smallest usable frame bound: the longest UTF-8 character.
pub const MIN_FRAME_BYTES: usize = 4;

/// Pulls messages off one connection.
///
/// Every socket read is bounded by `max_frame_bytes`. In `Lines` mode bytes
/// are buffered until a `\n` arrives, so a message split across reads is
/// reassembled and several messages in one read are returned one at a time.
/// In `Raw` mode whatever a read returns is the message.
///
/// `read_frame` only awaits the underlying read and mutates its buffer after
/// that read completes, so dropping the future mid-read loses no data.
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    max_frame_bytes: usize,
    buf: BytesMut,
    scratch: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing, max_frame_bytes: usize) -> Self {
        let max_frame_bytes = max_frame_bytes.max(MIN_FRAME_BYTES);
        Self {
            inner,
            framing,
            max_frame_bytes,
            buf: BytesMut::with_capacity(max_frame_bytes),
            scratch: vec![0; max_frame_bytes],
            eof: false,
        }
    }

    /// Next message, or `Ok(None)` once the peer has closed its side and
    /// nothing is left to deliver.
    pub async fn read_frame(&mut self) -> Result<Option<String>, FrameError> {
        match self.framing {
            Framing::Lines => self.read_line().await,
            Framing::Raw => self.read_chunk().await,
        }
    }

    async fn read_line(&mut self) -> Result<Option<String>, FrameError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                return decode(line).map(Some);
            }

            // A `\r` on the bound may be half of a line ending; read one
            // more byte before deciding.
            if self.buf.len() == self.max_frame_bytes
                && !self.eof
                && self.buf.last() == Some(&b'\r')
            {
                self.fill(1).await?;
                continue;
            }

            // No newline within the bound: hand out what we have, cut on a
            // character boundary so the rest still decodes.
            if self.buf.len() >= self.max_frame_bytes {
                let cut = utf8_cut(&self.buf[..self.max_frame_bytes]);
                let piece = self.buf.split_to(cut);
                return decode(piece).map(Some);
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let rest = self.buf.split();
                return decode(rest).map(Some);
            }

            let room = self.max_frame_bytes - self.buf.len();
            self.fill(room).await?;
        }
    }

    async fn read_chunk(&mut self) -> Result<Option<String>, FrameError> {
        loop {
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                // A dangling partial character at end of stream is a decode error.
                let rest = self.buf.split();
                return decode(rest).map(Some);
            }

            let room = self.max_frame_bytes.saturating_sub(self.buf.len()).max(1);
            let n = self.fill(room).await?;
            if n == 0 {
                continue;
            }

            // Carry an incomplete trailing character over to the next read.
            let cut = match std::str::from_utf8(&self.buf) {
                Ok(_) => self.buf.len(),
                Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
                Err(e) if e.error_len().is_none() => continue,
                Err(_) => self.buf.len(),
            };
            let chunk = self.buf.split_to(cut);
            return decode(chunk).map(Some);
        }
    }

    /// One bounded read into the buffer. Returns the byte count; 0 marks EOF.
    async fn fill(&mut self, room: usize) -> Result<usize, FrameError> {
        let room = room.min(self.scratch.len());
        let n = self.inner.read(&mut self.scratch[..room]).await?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&self.scratch[..n]);
        }
        Ok(n)
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn decode(bytes: BytesMut) -> Result<String, FrameError> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

/// Largest prefix length of `bytes` that does not end inside a multi-byte
/// character. Falls back to the full length for invalid or degenerate input.
fn utf8_cut(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}
