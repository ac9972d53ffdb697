//! Hardware-free camera that renders a moving gradient.
//!
//! Used for development without a webcam and by the integration tests,
//! which need control over acquisition latency, failures and disconnects.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use image::{Rgb, RgbImage};
use log::info;
use tokio::{
    sync::watch,
    time::{self, Duration, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use super::{
    finish_acquire, Frame, FrameData, FrameSlot, ResolutionTier, VideoHandle, VideoSource,
};
use crate::error::AcquisitionError;

#[derive(Clone)]
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    fps: u32,
    acquire_delay: Duration,
    failure: Option<AcquisitionError>,
    frame_limit: Option<u64>,
    live: Arc<AtomicUsize>,
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 15,
            acquire_delay: Duration::ZERO,
            failure: None,
            frame_limit: None,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SyntheticCamera {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width.max(1);
        self.height = height.max(1);
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps.clamp(1, 1000);
        self
    }

    /// Simulates a slow permission prompt or device warm-up.
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    /// Every acquisition fails with `err` after the delay.
    pub fn failing_with(mut self, err: AcquisitionError) -> Self {
        self.failure = Some(err);
        self
    }

    /// The producer stops after `frames`, as if the device were unplugged.
    pub fn disconnect_after(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Producers currently running, i.e. acquired and not yet released.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

pub fn render(width: u32, height: u32, seq: u64) -> RgbImage {
    let phase = (seq % 256) as u32;
    RgbImage::from_fn(width, height, |x, y| {
        let r = ((x * 255 / width.max(1)) + phase) % 256;
        let g = (y * 255 / height.max(1)) % 256;
        Rgb([r as u8, g as u8, phase as u8])
    })
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn produce(
    camera: SyntheticCamera,
    feed: watch::Sender<FrameSlot>,
    shutdown: CancellationToken,
    _guard: LiveGuard,
) {
    let mut ticker = time::interval(Duration::from_micros(1_000_000 / u64::from(camera.fps)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if camera.frame_limit.is_some_and(|limit| seq >= limit) {
                    info!("Synthetic camera disconnecting after {} frames", seq);
                    break;
                }
                seq += 1;
                let image = render(camera.width, camera.height, seq);
                feed.send_replace(Some(Arc::new(Frame {
                    seq,
                    data: FrameData::Rgb(Arc::new(image)),
                })));
            }
        }
    }
}

impl VideoSource for SyntheticCamera {
    async fn acquire(&self, tier: ResolutionTier) -> Result<VideoHandle, AcquisitionError> {
        if !self.acquire_delay.is_zero() {
            time::sleep(self.acquire_delay).await;
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }

        self.live.fetch_add(1, Ordering::SeqCst);
        let guard = LiveGuard(Arc::clone(&self.live));
        let (tx, rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        tokio::spawn(produce(self.clone(), tx, shutdown.clone(), guard));

        let handle = finish_acquire(rx, shutdown)
            .await
            .ok_or_else(|| AcquisitionError::DeviceUnavailable("synthetic producer exited".into()))?;
        info!(
            "Synthetic camera streaming at {} ({:?} requested)",
            handle.resolution(),
            tier
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Resolution;

    #[tokio::test]
    async fn negotiates_its_own_resolution() {
        let camera = SyntheticCamera::new().with_size(160, 90).with_fps(50);
        let handle = camera.acquire(ResolutionTier::High).await.unwrap();
        assert_eq!(
            handle.resolution(),
            Resolution {
                width: 160,
                height: 90
            }
        );
        assert_eq!(camera.live_streams(), 1);
    }

    #[tokio::test]
    async fn releasing_stops_the_producer() {
        let camera = SyntheticCamera::new().with_size(8, 8).with_fps(100);
        let mut handle = camera.acquire(ResolutionTier::Low).await.unwrap();
        handle.release();
        for _ in 0..50 {
            if camera.live_streams() == 0 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(camera.live_streams(), 0);
        assert!(handle.feed().is_lost());
    }

    #[tokio::test]
    async fn configured_failure_is_returned() {
        let camera = SyntheticCamera::new()
            .failing_with(AcquisitionError::PermissionDenied("denied".into()));
        let err = camera.acquire(ResolutionTier::High).await.err().unwrap();
        assert_eq!(err, AcquisitionError::PermissionDenied("denied".into()));
        assert_eq!(camera.live_streams(), 0);
    }

    #[test]
    fn render_matches_requested_size() {
        let image = render(33, 17, 5);
        assert_eq!(image.dimensions(), (33, 17));
    }
}
