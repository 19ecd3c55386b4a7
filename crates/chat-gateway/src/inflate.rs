//! zlib-stream transport decompression
//!
//! With `compress=zlib-stream` the server shares one deflate context across
//! the whole connection and ends every logical message with a sync flush,
//! so a message is complete once the buffered bytes end in `00 00 FF FF`.

use flate2::{Decompress, FlushDecompress, Status};

/// Marker left by a zlib sync flush
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

const MIN_OUTPUT_CHUNK: usize = 1024;

/// Errors raised while inflating a compressed frame
#[derive(Debug, thiserror::Error)]
pub enum InflateError {
    #[error("zlib decompression failed: {0}")]
    Decompress(#[from] flate2::DecompressError),

    #[error("decompressed payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("decompressor made no progress on {remaining} buffered bytes")]
    Stalled { remaining: usize },
}

/// Per-connection zlib-stream decoder
///
/// Create one per WebSocket connection; the inflate context must not be
/// reused across connections.
pub struct ZlibStreamDecoder {
    buffer: Vec<u8>,
    inflater: Decompress,
}

impl ZlibStreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            inflater: Decompress::new(true),
        }
    }

    /// Number of compressed bytes waiting for an end marker
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one binary frame
    ///
    /// Returns the decoded message once the end marker has been seen,
    /// `None` while the message is still incomplete.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<String>, InflateError> {
        self.buffer.extend_from_slice(frame);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let input = std::mem::take(&mut self.buffer);
        let mut output = Vec::with_capacity(input.len().saturating_mul(4).max(MIN_OUTPUT_CHUNK));
        let mut offset = 0;

        loop {
            if output.len() == output.capacity() {
                output.reserve(input.len().max(MIN_OUTPUT_CHUNK));
            }

            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();
            let status =
                self.inflater
                    .decompress_vec(&input[offset..], &mut output, FlushDecompress::Sync)?;
            let consumed = (self.inflater.total_in() - in_before) as usize;
            let produced = self.inflater.total_out() - out_before;
            offset += consumed;

            // spare capacity left means the inflater had nothing more to flush
            let drained = output.len() < output.capacity();
            if (offset >= input.len() && drained) || status == Status::StreamEnd {
                break;
            }
            if consumed == 0 && produced == 0 {
                return Err(InflateError::Stalled {
                    remaining: input.len() - offset,
                });
            }
        }

        Ok(Some(String::from_utf8(output)?))
    }
}

impl Default for ZlibStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ZlibStreamDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibStreamDecoder")
            .field("buffered", &self.buffer.len())
            .field("total_in", &self.inflater.total_in())
            .field("total_out", &self.inflater.total_out())
            .finish()
    }
}
