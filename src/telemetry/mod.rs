//! Bidirectional link to the remote vitals service.
//!
//! Outbound frames go through a single-slot mailbox: if the previous frame is
//! still queued or being written, or the link is not open, the new one is
//! dropped. The slot frees only when the transport drops the [`OutboundFrame`].
//! Inbound messages are delivered in arrival order and stop the moment the
//! channel is closed. There is no reconnection here; a dead link ends the
//! session.

pub mod memory;
pub mod ws;

use std::{future::Future, sync::Arc};

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectError, TransportError};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info};

pub use memory::{MemoryConnector, MemoryPeer};
pub use ws::WsConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closed { reason: Option<String> },
}

impl ChannelState {
    pub fn is_open(&self) -> bool {
        matches!(self, ChannelState::Open)
    }
}

/// A frame on its way out. Holds the link's only send slot until dropped.
pub struct OutboundFrame {
    bytes: Vec<u8>,
    _slot: OwnedSemaphorePermit,
}

impl OutboundFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Moves the payload out; the slot stays taken until `self` is dropped.
    pub fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}

/// Transport-side ends handed to whatever drives the wire.
pub struct TransportEnds {
    pub frames: mpsc::Receiver<OutboundFrame>,
    pub messages: mpsc::UnboundedSender<String>,
    pub control: LinkControl,
}

/// Shared between the transport tasks of one link.
#[derive(Clone)]
pub struct LinkControl {
    state: Arc<watch::Sender<ChannelState>>,
    shutdown: CancellationToken,
}

impl LinkControl {
    /// Resolves once either side has closed the link.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Marks the link dead and stops both directions.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.state.send_if_modified(|state| {
            if state.is_open() {
                *state = ChannelState::Closed {
                    reason: Some(reason),
                };
                true
            } else {
                false
            }
        });
        self.shutdown.cancel();
    }
}

/// An open link. Owned by the session controller for one activation.
pub struct TelemetryChannel {
    outbound: mpsc::Sender<OutboundFrame>,
    slot: Arc<Semaphore>,
    inbound: Option<mpsc::UnboundedReceiver<String>>,
    state: Arc<watch::Sender<ChannelState>>,
    shutdown: CancellationToken,
}

impl TelemetryChannel {
    /// Creates a channel in the open state together with its transport ends.
    pub fn open_pair() -> (TelemetryChannel, TransportEnds) {
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let slot = Arc::new(Semaphore::new(1));
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Open);
        let state = Arc::new(state);
        let shutdown = CancellationToken::new();

        (
            TelemetryChannel {
                outbound: frame_tx,
                slot,
                inbound: Some(message_rx),
                state: Arc::clone(&state),
                shutdown: shutdown.clone(),
            },
            TransportEnds {
                frames: frame_rx,
                messages: message_tx,
                control: LinkControl { state, shutdown },
            },
        )
    }

    pub fn state(&self) -> ChannelState {
        self.state.borrow().clone()
    }

    pub fn sender(&self) -> FrameSender {
        FrameSender {
            outbound: self.outbound.clone(),
            slot: Arc::clone(&self.slot),
            state: self.state.subscribe(),
        }
    }

    /// Takes the inbound side. Only the first call gets it.
    pub fn take_messages(&mut self) -> Option<MessageStream> {
        self.inbound.take().map(|rx| MessageStream {
            rx,
            shutdown: self.shutdown.clone(),
            state: self.state.subscribe(),
        })
    }

    /// Idempotent. No message is delivered after this returns.
    pub fn close(&self) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_open() {
                *state = ChannelState::Closed { reason: None };
                true
            } else {
                false
            }
        });
        self.shutdown.cancel();
        if changed {
            log_info!("telemetry channel closed");
        }
    }
}

impl Drop for TelemetryChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fire-and-forget frame submission.
#[derive(Clone)]
pub struct FrameSender {
    outbound: mpsc::Sender<OutboundFrame>,
    slot: Arc<Semaphore>,
    state: watch::Receiver<ChannelState>,
}

impl FrameSender {
    /// Returns whether the frame was accepted; rejected frames are gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        if !self.state.borrow().is_open() {
            log_debug!("dropping frame, channel not open");
            return false;
        }
        let Ok(slot) = Arc::clone(&self.slot).try_acquire_owned() else {
            log_debug!("dropping frame, previous one still in flight");
            return false;
        };
        match self.outbound.try_send(OutboundFrame { bytes: frame, _slot: slot }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log_debug!("dropping frame, previous one still in flight");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Inbound messages in arrival order.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    state: watch::Receiver<ChannelState>,
}

impl MessageStream {
    /// `None` once the channel is closed, locally or by the peer.
    pub async fn recv(&mut self) -> Option<String> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            message = self.rx.recv() => message,
        }
    }

    /// Why the stream ended, for reporting after `recv` returned `None`.
    pub fn termination(&self) -> TransportError {
        let reason = match &*self.state.borrow() {
            ChannelState::Closed {
                reason: Some(reason),
            } => reason.clone(),
            ChannelState::Closed { reason: None } => "closed".into(),
            ChannelState::Open => "peer stopped sending".into(),
        };
        TransportError { reason }
    }
}

pub trait Connector: Send + Sync + 'static {
    fn open(&self) -> impl Future<Output = Result<TelemetryChannel, ConnectError>> + Send;
}
