//! Video acquisition.
//!
//! A [`VideoSource`] turns a quality tier into a live [`VideoHandle`]. Every
//! variant runs a background producer that publishes the most recent frame
//! into a `watch` channel; consumers only ever see the latest frame, and the
//! channel closing is how a device disconnect surfaces.

pub mod local;
pub mod mjpeg;
pub mod network;
pub mod synthetic;

use std::{fmt, future::Future, io::Cursor, str::FromStr, sync::Arc};

use bytes::Bytes;
use image::{ImageFormat, ImageReader, RgbImage};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::AcquisitionError;

pub use local::LocalCamera;
pub use network::NetworkCamera;
pub use synthetic::SyntheticCamera;

/// Logical quality tier requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionTier {
    #[default]
    High,
    Medium,
    Low,
}

/// Concrete capture request derived from a tier. Sources may negotiate down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl ResolutionTier {
    pub fn request(self) -> CaptureRequest {
        match self {
            ResolutionTier::High => CaptureRequest {
                width: 1920,
                height: 1080,
                fps: 30,
            },
            ResolutionTier::Medium => CaptureRequest {
                width: 1280,
                height: 720,
                fps: 30,
            },
            ResolutionTier::Low => CaptureRequest {
                width: 854,
                height: 480,
                fps: 30,
            },
        }
    }
}

impl FromStr for ResolutionTier {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" | "1080p" => Ok(ResolutionTier::High),
            "medium" | "720p" => Ok(ResolutionTier::Medium),
            "low" | "480p" => Ok(ResolutionTier::Low),
            other => Err(format!("unknown resolution '{other}' (expected 1080p, 720p or 480p)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone)]
pub enum FrameData {
    /// Compressed frame as delivered by an MJPEG producer.
    Jpeg(Bytes),
    Rgb(Arc<RgbImage>),
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub data: FrameData,
}

impl Frame {
    pub fn decode(&self) -> Result<Arc<RgbImage>, image::ImageError> {
        match &self.data {
            FrameData::Rgb(image) => Ok(Arc::clone(image)),
            FrameData::Jpeg(bytes) => {
                let image = image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?;
                Ok(Arc::new(image.to_rgb8()))
            }
        }
    }

    pub fn resolution(&self) -> Result<Resolution, image::ImageError> {
        match &self.data {
            FrameData::Rgb(image) => Ok(Resolution {
                width: image.width(),
                height: image.height(),
            }),
            FrameData::Jpeg(bytes) => {
                let (width, height) = ImageReader::with_format(Cursor::new(bytes), ImageFormat::Jpeg)
                    .into_dimensions()?;
                Ok(Resolution { width, height })
            }
        }
    }
}

pub type FrameSlot = Option<Arc<Frame>>;

/// Read side of a producer's latest-frame slot.
#[derive(Clone)]
pub struct FrameFeed {
    rx: watch::Receiver<FrameSlot>,
}

impl FrameFeed {
    pub fn new(rx: watch::Receiver<FrameSlot>) -> Self {
        Self { rx }
    }

    pub fn latest(&self) -> FrameSlot {
        self.rx.borrow().clone()
    }

    /// True once the producer has gone away.
    pub fn is_lost(&self) -> bool {
        self.rx.has_changed().is_err()
    }

    /// Waits until the first frame is published. `false` if the producer died first.
    pub async fn first_frame(&mut self) -> bool {
        loop {
            if self.rx.borrow_and_update().is_some() {
                return true;
            }
            if self.rx.changed().await.is_err() {
                return false;
            }
        }
    }
}

/// Exclusive handle on an acquired stream. Releasing stops the producer.
pub struct VideoHandle {
    resolution: Resolution,
    feed: FrameFeed,
    shutdown: CancellationToken,
    released: bool,
}

impl VideoHandle {
    pub fn new(resolution: Resolution, feed: FrameFeed, shutdown: CancellationToken) -> Self {
        Self {
            resolution,
            feed,
            shutdown,
            released: false,
        }
    }

    /// Actual resolution, which may differ from the requested tier.
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn feed(&self) -> FrameFeed {
        self.feed.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.shutdown.cancel();
        info!("Released {} video stream", self.resolution);
    }
}

impl Drop for VideoHandle {
    fn drop(&mut self) {
        self.release();
    }
}

pub trait VideoSource: Send + Sync + 'static {
    fn acquire(
        &self,
        tier: ResolutionTier,
    ) -> impl Future<Output = Result<VideoHandle, AcquisitionError>> + Send;
}

/// Waits for the first frame and builds the handle around it.
///
/// The producer is shut down on failure, and also when this future is
/// dropped before the handle exists.
pub(crate) async fn finish_acquire(
    rx: watch::Receiver<FrameSlot>,
    shutdown: CancellationToken,
) -> Option<VideoHandle> {
    let pending = shutdown.drop_guard();
    let mut feed = FrameFeed::new(rx);
    if !feed.first_frame().await {
        return None;
    }
    let resolution = match feed.latest().map(|frame| frame.resolution()) {
        Some(Ok(resolution)) => resolution,
        _ => return None,
    };
    Some(VideoHandle::new(resolution, feed, pending.disarm()))
}

/// Camera variant chosen by configuration.
pub enum CameraSource {
    Local(LocalCamera),
    Network(NetworkCamera),
    Synthetic(SyntheticCamera),
}

impl VideoSource for CameraSource {
    async fn acquire(&self, tier: ResolutionTier) -> Result<VideoHandle, AcquisitionError> {
        match self {
            CameraSource::Local(camera) => camera.acquire(tier).await,
            CameraSource::Network(camera) => camera.acquire(tier).await,
            CameraSource::Synthetic(camera) => camera.acquire(tier).await,
        }
    }
}
