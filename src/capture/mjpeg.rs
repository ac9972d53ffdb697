//! Splits a byte stream of back-to-back JPEG images into frames.
//!
//! Works for both `ffmpeg -f image2pipe` output and HTTP
//! `multipart/x-mixed-replace` camera streams: part headers between images
//! are skipped because only SOI..EOI spans are emitted.

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use super::{Frame, FrameData, FrameSlot};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|window| window == needle)
}

#[derive(Default)]
pub struct MjpegSplitter {
    buf: Vec<u8>,
    /// Offset from which to resume the EOI search; everything before it was
    /// already scanned. Only meaningful while `buf` starts with SOI.
    scanned: usize,
}

impl MjpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            if !self.buf.starts_with(&SOI) {
                match find(&self.buf, &SOI) {
                    Some(start) => {
                        self.buf.drain(..start);
                        self.scanned = 0;
                    }
                    None => {
                        // A trailing 0xFF may be the first half of the next SOI.
                        let keep = usize::from(self.buf.last() == Some(&0xFF));
                        let cut = self.buf.len() - keep;
                        self.buf.drain(..cut);
                        self.scanned = 0;
                        break;
                    }
                }
            }

            let from = self.scanned.max(SOI.len());
            match find(&self.buf[from..], &EOI) {
                Some(offset) => {
                    let end = from + offset + EOI.len();
                    frames.push(Bytes::copy_from_slice(&self.buf[..end]));
                    self.buf.drain(..end);
                    self.scanned = 0;
                }
                None => {
                    if self.buf.len() > MAX_FRAME_BYTES {
                        log_warn!("discarding {} bytes without a JPEG end marker", self.buf.len());
                        self.buf.clear();
                        self.scanned = 0;
                    } else {
                        self.scanned = self.buf.len().saturating_sub(1);
                    }
                    break;
                }
            }
        }

        frames
    }
}

/// Reads `reader` until EOF or shutdown, publishing each complete JPEG.
/// Returns the number of frames published.
pub async fn pump<R>(
    mut reader: R,
    feed: watch::Sender<FrameSlot>,
    shutdown: CancellationToken,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut splitter = MjpegSplitter::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut published = 0u64;

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => {
                log_debug!("mjpeg pump stopped after {published} frames");
                return Ok(published);
            }
            read = reader.read(&mut chunk) => read?,
        };
        if read == 0 {
            log_debug!("mjpeg stream ended after {published} frames");
            return Ok(published);
        }
        for jpeg in splitter.push(&chunk[..read]) {
            published += 1;
            feed.send_replace(Some(Arc::new(Frame {
                seq: published,
                data: FrameData::Jpeg(jpeg),
            })));
        }
    }
}
