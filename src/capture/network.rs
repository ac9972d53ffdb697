//! Networked camera: an HTTP MJPEG stream such as the ESP32-CAM `/stream` endpoint.

use futures_util::TryStreamExt;
use log::{error, info, warn};
use reqwest::{Client, StatusCode};
use tokio::sync::watch;
use tokio_util::{io::StreamReader, sync::CancellationToken};

use super::{finish_acquire, mjpeg, ResolutionTier, VideoHandle, VideoSource};
use crate::error::AcquisitionError;

pub const DEFAULT_STREAM_URL: &str = "http://192.168.3.15/stream";

#[derive(Debug, Clone)]
pub struct NetworkCamera {
    url: String,
    client: Client,
}

impl NetworkCamera {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn status_error(status: StatusCode) -> AcquisitionError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AcquisitionError::PermissionDenied(format!("stream answered {status}"))
        }
        _ => AcquisitionError::DeviceUnavailable(format!("stream answered {status}")),
    }
}

impl VideoSource for NetworkCamera {
    async fn acquire(&self, tier: ResolutionTier) -> Result<VideoHandle, AcquisitionError> {
        // The camera firmware picks its own frame size; the tier is advisory only.
        info!("Opening network camera {} ({:?} requested)", self.url, tier);
        let response = self.client.get(&self.url).send().await.map_err(|err| {
            error!("Network camera unreachable: {}", err);
            AcquisitionError::DeviceUnavailable(err.to_string())
        })?;
        if !response.status().is_success() {
            let err = status_error(response.status());
            error!("Network camera refused stream: {}", err);
            return Err(err);
        }

        let body = response.bytes_stream().map_err(std::io::Error::other);
        let (tx, rx) = watch::channel(None);
        let shutdown = CancellationToken::new();
        tokio::spawn({
            let shutdown = shutdown.clone();
            let url = self.url.clone();
            async move {
                match mjpeg::pump(StreamReader::new(Box::pin(body)), tx, shutdown).await {
                    Ok(frames) => info!("Network camera {} closed after {} frames", url, frames),
                    Err(err) => warn!("Network camera {} stream failed: {}", url, err),
                }
            }
        });

        match finish_acquire(rx, shutdown).await {
            Some(handle) => {
                info!("Network camera streaming at {}", handle.resolution());
                Ok(handle)
            }
            None => Err(AcquisitionError::DeviceUnavailable(
                "stream ended before the first frame".into(),
            )),
        }
    }
}
