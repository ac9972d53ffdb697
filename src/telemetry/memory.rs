//! In-process transport. The far end is handed out as a [`MemoryPeer`] so
//! tests and the offline demo can play the vitals service.

use std::time::Duration;

use tokio::sync::mpsc;

use super::{Connector, LinkControl, OutboundFrame, TelemetryChannel, TransportEnds};
use crate::error::ConnectError;

pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    open_delay: Duration,
    failure: Option<ConnectError>,
}

impl MemoryConnector {
    /// Every successful `open` delivers its peer on the returned receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                open_delay: Duration::ZERO,
                failure: None,
            },
            rx,
        )
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn failing_with(mut self, err: ConnectError) -> Self {
        self.failure = Some(err);
        self
    }
}

impl Connector for MemoryConnector {
    async fn open(&self) -> Result<TelemetryChannel, ConnectError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }

        let (channel, ends) = TelemetryChannel::open_pair();
        let TransportEnds {
            frames,
            messages,
            control,
        } = ends;
        self.peers
            .send(MemoryPeer {
                frames,
                messages,
                control,
            })
            .map_err(|_| ConnectError::Handshake("no peer is listening".into()))?;
        Ok(channel)
    }
}

/// Service side of an in-memory link.
pub struct MemoryPeer {
    frames: mpsc::Receiver<OutboundFrame>,
    messages: mpsc::UnboundedSender<String>,
    control: LinkControl,
}

impl MemoryPeer {
    /// `false` if the link is already closed.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        !self.control.is_closed() && self.messages.send(text.into()).is_ok()
    }

    /// Next uploaded frame, or `None` once the link is closed. Receiving it
    /// frees the sender's slot.
    pub async fn recv_frame(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;
            _ = self.control.closed() => None,
            frame = self.frames.recv() => frame.map(|mut frame| frame.take_bytes()),
        }
    }

    /// Simulates the service dropping the connection.
    pub fn disconnect(&self, reason: impl Into<String>) {
        self.control.fail(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        self.control.fail("peer went away");
    }
}
