//! WebSocket transport: binary JPEG frames out, JSON text messages in.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite};
use tungstenite::Message;

use super::{Connector, TelemetryChannel, TransportEnds};
use crate::error::ConnectError;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub const DEFAULT_TELEMETRY_URL: &str = "ws://localhost:8000/ws/video";

#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_TELEMETRY_URL)
    }
}

fn connect_error(url: &str, err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Url(_) => ConnectError::InvalidAddress(url.to_string()),
        other => ConnectError::Handshake(other.to_string()),
    }
}

impl Connector for WsConnector {
    async fn open(&self) -> Result<TelemetryChannel, ConnectError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConnectError::InvalidAddress(self.url.clone()));
        }

        let (stream, _response) = connect_async(self.url.as_str()).await.map_err(|err| {
            log_error!("telemetry connect to {} failed: {}", self.url, err);
            connect_error(&self.url, err)
        })?;
        log_info!("telemetry channel open at {}", self.url);

        let (channel, ends) = TelemetryChannel::open_pair();
        let TransportEnds {
            mut frames,
            messages,
            control,
        } = ends;
        let (mut sink, mut source) = stream.split();

        // Writer: the frame's slot is held until the sink has taken it.
        tokio::spawn({
            let control = control.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = control.closed() => {
                            if let Err(err) = sink.send(Message::Close(None)).await {
                                log_debug!("close frame not delivered: {}", err);
                            }
                            break;
                        }
                        frame = frames.recv() => {
                            let Some(mut frame) = frame else { break };
                            let sent = sink.send(Message::Binary(frame.take_bytes())).await;
                            drop(frame);
                            if let Err(err) = sent {
                                log_warn!("telemetry send failed: {}", err);
                                control.fail(err.to_string());
                                break;
                            }
                        }
                    }
                }
            }
        });

        // Reader: forwards text in arrival order until the peer goes away.
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = control.closed() => break,
                    next = source.next() => next,
                };
                match next {
                    Some(Ok(Message::Text(text))) => {
                        if messages.send(text).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by server".into());
                        log_info!("telemetry peer closed: {}", reason);
                        control.fail(reason);
                        break;
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        log_debug!("ignoring {} byte binary telemetry message", payload.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log_warn!("telemetry receive failed: {}", err);
                        control.fail(err.to_string());
                        break;
                    }
                    None => {
                        control.fail("connection ended");
                        break;
                    }
                }
            }
        });

        Ok(channel)
    }
}
