//! Frame assembly for the camera streaming protocol
//!
//! Cameras answer each frame request with a JPEG and no length prefix.
//! The frame ends at the first end-of-image marker (`FF D9`), which may be
//! split across two reads.

use bytes::{Bytes, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

/// JPEG end-of-image marker
pub const EOI_MARKER: [u8; 2] = [0xFF, 0xD9];

#[derive(Debug, thiserror::Error)]
pub enum FrameReadError {
    #[error("connection closed after {received} bytes")]
    Closed { received: usize },
    #[error("no data within {0:?}")]
    Timeout(Duration),
    #[error("frame exceeds {limit} bytes without an end marker")]
    TooLarge { limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Incremental end-of-image scanner.
///
/// Carries the last byte of the previous chunk so a marker straddling two
/// reads is found.
#[derive(Debug, Default, Clone)]
pub struct EoiScanner {
    last: Option<u8>,
}

impl EoiScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk. Returns the length of the chunk prefix that
    /// completes the frame (marker included), if the marker was seen.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        let first = *chunk.first()?;
        if self.last == Some(EOI_MARKER[0]) && first == EOI_MARKER[1] {
            self.last = None;
            return Some(1);
        }
        if let Some(pos) = chunk.windows(2).position(|w| w == EOI_MARKER) {
            self.last = None;
            return Some(pos + 2);
        }
        self.last = chunk.last().copied();
        None
    }
}

/// Read one frame, applying `read_timeout` to every individual read.
///
/// Bytes after the marker in the final chunk are discarded; the camera
/// sends nothing more until the next request.
pub async fn read_frame<R>(
    reader: &mut R,
    chunk_bytes: usize,
    read_timeout: Duration,
    max_frame_bytes: usize,
) -> Result<Bytes, FrameReadError>
where
    R: AsyncRead + Unpin,
{
    let mut frame = BytesMut::with_capacity(chunk_bytes);
    let mut chunk = vec![0u8; chunk_bytes.max(2)];
    let mut scanner = EoiScanner::new();

    loop {
        let n = match timeout(read_timeout, reader.read(&mut chunk)).await {
            Ok(Ok(0)) => return Err(FrameReadError::Closed { received: frame.len() }),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(FrameReadError::Io(e)),
            Err(_) => return Err(FrameReadError::Timeout(read_timeout)),
        };

        let data = &chunk[..n];
        if let Some(end) = scanner.feed(data) {
            frame.extend_from_slice(&data[..end]);
            return Ok(frame.freeze());
        }

        frame.extend_from_slice(data);
        if frame.len() > max_frame_bytes {
            return Err(FrameReadError::TooLarge { limit: max_frame_bytes });
        }
    }
}
