//! Samples the latest camera frame on a fixed cadence and compresses it for transport.
//!
//! One frame is in flight at a time: `next_frame` does not return until the
//! current encode finishes, and ticks that elapse meanwhile are skipped rather
//! than queued.

use std::{sync::Arc, time::Duration};

use image::{
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
    ImageError, RgbImage,
};
use thiserror::Error;
use tokio::{
    task::JoinError,
    time::{self, Instant, Interval, MissedTickBehavior},
};

use crate::capture::{Frame, FrameFeed, Resolution};

const ENABLE_LOGS: bool = true;

use crate::log_debug;

pub const DEFAULT_FRAME_PERIOD: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_WIDTH: u32 = 640;
pub const DEFAULT_QUALITY: f32 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderConfig {
    pub period: Duration,
    pub max_width: u32,
    /// JPEG quality in `0.0..=1.0`.
    pub quality: f32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_FRAME_PERIOD,
            max_width: DEFAULT_MAX_WIDTH,
            quality: DEFAULT_QUALITY,
        }
    }
}

impl EncoderConfig {
    fn jpeg_quality(&self) -> u8 {
        (self.quality * 100.0).round().clamp(1.0, 100.0) as u8
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("video source is gone")]
    SourceLost,
    #[error("frame encode failed: {0}")]
    Image(#[from] ImageError),
    #[error("encode worker failed: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub seq: u64,
    pub size: Resolution,
    pub jpeg: Vec<u8>,
}

/// Width capped at `max_width`, height keeping the source aspect ratio (at least 1).
pub fn transport_size(source: Resolution, max_width: u32) -> Resolution {
    let width = source.width.min(max_width).max(1);
    if source.width == 0 {
        return Resolution {
            width,
            height: source.height.max(1),
        };
    }
    let height = (f64::from(source.height) * f64::from(width) / f64::from(source.width)).round();
    Resolution {
        width,
        height: (height as u32).max(1),
    }
}

pub fn encode_jpeg(
    image: &RgbImage,
    max_width: u32,
    quality: u8,
) -> Result<(Resolution, Vec<u8>), ImageError> {
    let source = Resolution {
        width: image.width(),
        height: image.height(),
    };
    let target = transport_size(source, max_width);

    let mut jpeg = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, quality);
        if target == source {
            encoder.encode_image(image)?;
        } else {
            let scaled = imageops::resize(image, target.width, target.height, FilterType::Triangle);
            encoder.encode_image(&scaled)?;
        }
    }
    Ok((target, jpeg))
}

fn encode_frame(frame: &Frame, max_width: u32, quality: u8) -> Result<EncodedFrame, EncodeError> {
    let image = frame.decode()?;
    let (size, jpeg) = encode_jpeg(&image, max_width, quality)?;
    Ok(EncodedFrame {
        seq: frame.seq,
        size,
        jpeg,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub encoded: u64,
    pub skipped_ticks: u64,
}

pub struct FrameEncoder {
    feed: FrameFeed,
    config: EncoderConfig,
    ticker: Interval,
    last_tick: Option<Instant>,
    stats: EncoderStats,
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

impl FrameEncoder {
    pub fn new(feed: FrameFeed, config: EncoderConfig) -> Self {
        Self {
            feed,
            ticker: ticker(config.period),
            config,
            last_tick: None,
            stats: EncoderStats::default(),
        }
    }

    /// Starts the cadence over, as if freshly created.
    pub fn restart(&mut self) {
        self.ticker = ticker(self.config.period);
        self.last_tick = None;
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    /// Waits for the next tick and encodes the latest frame.
    ///
    /// Ticks with no frame available yet produce nothing and are waited out.
    /// `SourceLost` is terminal; other errors only cost the current tick.
    pub async fn next_frame(&mut self) -> Result<EncodedFrame, EncodeError> {
        loop {
            self.ticker.tick().await;
            // Measured on the wall clock: a skipped tick reports its missed deadline.
            let at = Instant::now();
            if let Some(previous) = self.last_tick.replace(at) {
                let elapsed = at.duration_since(previous).as_nanos();
                let periods = (elapsed / self.config.period.as_nanos().max(1)) as u64;
                if periods > 1 {
                    self.stats.skipped_ticks += periods - 1;
                    log_debug!("encoder skipped {} ticks under backpressure", periods - 1);
                }
            }

            if self.feed.is_lost() {
                return Err(EncodeError::SourceLost);
            }
            let Some(frame) = self.feed.latest() else {
                continue;
            };

            let max_width = self.config.max_width;
            let quality = self.config.jpeg_quality();
            let encoded = tokio::task::spawn_blocking({
                let frame = Arc::clone(&frame);
                move || encode_frame(&frame, max_width, quality)
            })
            .await??;
            self.stats.encoded += 1;
            return Ok(encoded);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameData, FrameSlot};
    use tokio::sync::watch;

    fn res(width: u32, height: u32) -> Resolution {
        Resolution { width, height }
    }

    fn frame(width: u32, height: u32) -> FrameSlot {
        Some(Arc::new(Frame {
            seq: 1,
            data: FrameData::Rgb(Arc::new(RgbImage::new(width, height))),
        }))
    }

    #[test]
    fn downscales_to_transport_width() {
        assert_eq!(transport_size(res(1920, 1080), 640), res(640, 360));
        assert_eq!(transport_size(res(1280, 720), 640), res(640, 360));
        assert_eq!(transport_size(res(854, 480), 640), res(640, 360));
    }

    #[test]
    fn small_sources_keep_their_size() {
        assert_eq!(transport_size(res(320, 240), 640), res(320, 240));
    }

    #[test]
    fn height_is_rounded_and_at_least_one() {
        assert_eq!(transport_size(res(1000, 333), 640), res(640, 213));
        assert_eq!(transport_size(res(4000, 1), 640), res(640, 1));
    }

    #[test]
    fn quality_maps_to_percent() {
        assert_eq!(EncoderConfig::default().jpeg_quality(), 80);
        let config = EncoderConfig {
            quality: 2.0,
            ..EncoderConfig::default()
        };
        assert_eq!(config.jpeg_quality(), 100);
    }

    #[test]
    fn encodes_a_decodable_jpeg() {
        let image = RgbImage::new(1280, 720);
        let (size, jpeg) = encode_jpeg(&image, 640, 80).unwrap();
        assert_eq!(size, res(640, 360));
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
    }

    #[tokio::test]
    async fn produces_frames_from_the_feed() {
        let (_tx, rx) = watch::channel(frame(64, 48));
        let mut encoder = FrameEncoder::new(
            FrameFeed::new(rx),
            EncoderConfig {
                period: Duration::from_millis(5),
                ..EncoderConfig::default()
            },
        );
        let first = encoder.next_frame().await.unwrap();
        let second = encoder.next_frame().await.unwrap();
        assert_eq!(first.size, res(64, 48));
        assert_eq!(second.seq, 1);
        assert_eq!(encoder.stats().encoded, 2);
    }

    #[tokio::test]
    async fn lost_source_is_terminal() {
        let (tx, rx) = watch::channel(frame(8, 8));
        let mut encoder = FrameEncoder::new(FrameFeed::new(rx), EncoderConfig::default());
        drop(tx);
        assert!(matches!(encoder.next_frame().await, Err(EncodeError::SourceLost)));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumers_skip_ticks() {
        let (_tx, rx) = watch::channel(frame(8, 8));
        let mut encoder = FrameEncoder::new(FrameFeed::new(rx), EncoderConfig::default());
        encoder.next_frame().await.unwrap();
        time::sleep(Duration::from_millis(450)).await;
        encoder.next_frame().await.unwrap();
        assert!(encoder.stats().skipped_ticks >= 3);
        assert_eq!(encoder.stats().encoded, 2);
    }
}
