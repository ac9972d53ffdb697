//! Local camera capture through an `ffmpeg` subprocess.
//!
//! ffmpeg owns the platform camera API (v4l2, AVFoundation, DirectShow) and
//! writes MJPEG to stdout, which is split into frames by [`super::mjpeg`].

use std::{process::Stdio, sync::Arc};

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, Command},
    sync::{watch, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{finish_acquire, mjpeg, ResolutionTier, VideoHandle, VideoSource};
use crate::error::AcquisitionError;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct LocalCamera {
    ffmpeg: String,
    input_format: String,
    device: String,
}

impl LocalCamera {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            ffmpeg: "ffmpeg".into(),
            input_format: default_input_format().into(),
            device: device.into(),
        }
    }

    pub fn with_ffmpeg(mut self, path: impl Into<String>) -> Self {
        self.ffmpeg = path.into();
        self
    }

    pub fn with_input_format(mut self, format: impl Into<String>) -> Self {
        self.input_format = format.into();
        self
    }

    fn args(&self, tier: ResolutionTier) -> Vec<String> {
        let request = tier.request();
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            self.input_format.clone(),
            "-framerate".into(),
            request.fps.to_string(),
            "-video_size".into(),
            format!("{}x{}", request.width, request.height),
            "-i".into(),
            self.device.clone(),
            "-f".into(),
            "image2pipe".into(),
            "-c:v".into(),
            "mjpeg".into(),
            "-q:v".into(),
            "3".into(),
            "pipe:1".into(),
        ]
    }

    fn spawn(&self, tier: ResolutionTier) -> Result<Child> {
        Command::new(&self.ffmpeg)
            .args(self.args(tier))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.ffmpeg))
    }
}

impl Default for LocalCamera {
    fn default() -> Self {
        Self::new(default_device())
    }
}

pub fn default_input_format() -> &'static str {
    if cfg!(target_os = "macos") {
        "avfoundation"
    } else if cfg!(target_os = "windows") {
        "dshow"
    } else {
        "v4l2"
    }
}

pub fn default_device() -> &'static str {
    if cfg!(target_os = "macos") {
        "0"
    } else if cfg!(target_os = "windows") {
        "video=Integrated Camera"
    } else {
        "/dev/video0"
    }
}

/// Maps ffmpeg's last words to an acquisition failure.
fn classify_failure(stderr_tail: &str) -> AcquisitionError {
    let lowered = stderr_tail.to_ascii_lowercase();
    if lowered.contains("permission denied") || lowered.contains("not authorized") {
        return AcquisitionError::PermissionDenied(stderr_tail.trim().to_string());
    }
    let detail = stderr_tail
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("ffmpeg exited before producing a frame");
    AcquisitionError::DeviceUnavailable(detail.trim().to_string())
}

async fn collect_stderr(stderr: ChildStderr, tail: Arc<Mutex<Vec<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("ffmpeg: {}", line);
        let mut tail = tail.lock().await;
        if tail.len() == STDERR_TAIL_LINES {
            tail.remove(0);
        }
        tail.push(line);
    }
}

async fn run_device(
    mut child: Child,
    feed: watch::Sender<super::FrameSlot>,
    shutdown: CancellationToken,
) -> Result<()> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("ffmpeg stdout was not captured"))?;
    let published = mjpeg::pump(stdout, feed, shutdown.clone())
        .await
        .context("reading ffmpeg output")?;

    if let Err(err) = child.start_kill() {
        debug!("ffmpeg already exited: {}", err);
    }
    let status = child.wait().await.context("waiting for ffmpeg")?;
    info!("Local camera stopped after {} frames ({})", published, status);
    Ok(())
}

impl VideoSource for LocalCamera {
    async fn acquire(&self, tier: ResolutionTier) -> Result<VideoHandle, AcquisitionError> {
        info!(
            "Opening local camera {} via {} ({:?})",
            self.device, self.input_format, tier
        );
        let mut child = self
            .spawn(tier)
            .map_err(|err| AcquisitionError::DeviceUnavailable(format!("{err:#}")))?;

        let tail = Arc::new(Mutex::new(Vec::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(collect_stderr(stderr, Arc::clone(&tail))));

        let (tx, rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(err) = run_device(child, tx, shutdown).await {
                    error!("Local camera producer failed: {err:#}");
                }
            }
        });

        match finish_acquire(rx, shutdown).await {
            Some(handle) => {
                info!("Local camera streaming at {}", handle.resolution());
                Ok(handle)
            }
            None => {
                if let Some(task) = stderr_task {
                    let _ = task.await;
                }
                let tail = tail.lock().await.join("\n");
                let err = classify_failure(&tail);
                error!("Local camera acquisition failed: {}", err);
                Err(err)
            }
        }
    }
}
