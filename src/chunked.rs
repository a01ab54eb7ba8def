//! HTTP/1.1 chunked-transfer decoding (spec section 4.4), used by the Gateway to pull
//! RTCM3 payload bytes out of the upstream caster's chunked response body.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::error::RelayError;

/// A stateful view over a byte stream that assembles payload bytes from HTTP/1.1
/// chunked-transfer framing. Construct with `ChunkedReader::new`, call
/// `consume_header` once to skip the HTTP response header, then repeatedly call
/// `next_chunk` for payload bytes.
pub struct ChunkedReader<R> {
    inner: BufReader<R>,
}

/// Outcome of reading the next chunk.
pub enum Chunk {
    /// A non-empty payload chunk.
    Data(Vec<u8>),
    /// The terminal zero-length chunk: the upstream body has ended cleanly.
    End,
}

impl<R: AsyncRead + Unpin> ChunkedReader<R> {
    pub fn new(inner: R) -> Self {
        ChunkedReader {
            inner: BufReader::new(inner),
        }
    }

    /// Consume the HTTP-style response header up to the blank line, per spec 4.4.
    pub async fn consume_header(&mut self) -> Result<(), RelayError> {
        let mut header = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = self.inner.read(&mut byte).await.map_err(RelayError::SocketIo)?;
            if n == 0 {
                return Err(RelayError::SocketIo(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "upstream closed before sending a response header",
                )));
            }
            header.push(byte[0]);
            if header.ends_with(b"\r\n\r\n") {
                return Ok(());
            }
        }
    }

    /// Read one chunk: a chunk-size line (ASCII hex), the payload, and the trailing
    /// CRLF. A chunk-size line that fails to parse as hex is skipped (spec 4.4 step 1:
    /// "on parse error, skip the line").
    pub async fn next_chunk(&mut self) -> Result<Chunk, RelayError> {
        loop {
            let mut size_line = String::new();
            let n = self
                .inner
                .read_line(&mut size_line)
                .await
                .map_err(RelayError::SocketIo)?;
            if n == 0 {
                return Err(RelayError::SocketIo(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "upstream closed mid-chunk",
                )));
            }

            let trimmed = size_line.trim();
            // Chunk extensions (`size;ext=val`) are not produced by NTRIP casters in
            // practice; split them off defensively rather than failing to parse.
            let size_token = trimmed.split(';').next().unwrap_or(trimmed);
            let size = match usize::from_str_radix(size_token, 16) {
                Ok(size) => size,
                Err(_) => continue,
            };

            if size == 0 {
                return Ok(Chunk::End);
            }

            let mut data = vec![0u8; size];
            self.inner
                .read_exact(&mut data)
                .await
                .map_err(RelayError::SocketIo)?;

            let mut crlf = [0u8; 2];
            self.inner
                .read_exact(&mut crlf)
                .await
                .map_err(RelayError::SocketIo)?;

            return Ok(Chunk::Data(data));
        }
    }
}
