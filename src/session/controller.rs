use std::sync::{Arc, Weak};

use chrono::{Local, Utc};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    capture::{ResolutionTier, VideoHandle, VideoSource},
    encoder::{EncodeError, EncoderConfig, FrameEncoder},
    error::{AcquisitionError, PreconditionError, SessionError, TransportError},
    records::{HistoryRecord, NewHistoryRecord, RecordStore},
    report::{build_report, ReportData, Thresholds},
    telemetry::{Connector, FrameSender, MessageStream, TelemetryChannel},
    vitals::{LiveVitals, LiveVitalsWriter, VitalsIngest},
};

use super::{Session, SessionEvent, SessionState};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub tier: ResolutionTier,
    pub encoder: EncoderConfig,
}

/// Resources owned for exactly one streaming activation.
struct Active {
    video: VideoHandle,
    channel: TelemetryChannel,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

impl Active {
    fn release(&mut self) {
        self.cancel.cancel();
        self.video.release();
        self.channel.close();
    }

    /// Stops the pump and waits for it before letting go of the devices.
    async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Err(err) = (&mut self.pump).await {
            log_warn!("session pump ended abnormally: {}", err);
        }
        self.release();
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.release();
    }
}

struct ControllerState {
    state: SessionState,
    /// Bumped whenever an in-flight start must be abandoned.
    epoch: u64,
    session: Option<Session>,
    active: Option<Active>,
}

impl ControllerState {
    /// Returns to Idle if the acquisition of `epoch` is still pending.
    fn abandon(&mut self, epoch: u64) -> bool {
        if self.epoch != epoch || self.state != SessionState::Acquiring {
            return false;
        }
        self.epoch += 1;
        self.state = SessionState::Idle;
        true
    }
}

/// Armed while `start()` awaits the camera and the channel. Dropping it
/// armed means the caller gave up on the start.
struct PendingStart<S: VideoSource, C: Connector> {
    controller: SessionController<S, C>,
    epoch: u64,
    armed: bool,
}

impl<S: VideoSource, C: Connector> PendingStart<S, C> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S: VideoSource, C: Connector> Drop for PendingStart<S, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let epoch = self.epoch;
        if let Ok(mut guard) = self.controller.inner.state.try_lock() {
            let abandoned = guard.abandon(epoch);
            drop(guard);
            if abandoned {
                log_info!("start of epoch {} dropped during acquisition", epoch);
                self.controller.emit_state(SessionState::Idle);
            }
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log_warn!("start of epoch {} dropped outside a runtime", epoch);
            return;
        };
        let controller = self.controller.clone();
        runtime.spawn(async move {
            let abandoned = controller.inner.state.lock().await.abandon(epoch);
            if abandoned {
                log_info!("start of epoch {} dropped during acquisition", epoch);
                controller.emit_state(SessionState::Idle);
            }
        });
    }
}

struct Inner<S, C> {
    source: S,
    connector: C,
    options: SessionOptions,
    state: Mutex<ControllerState>,
    vitals: LiveVitalsWriter,
    events: broadcast::Sender<SessionEvent>,
}

/// Owns the start/stop lifecycle of monitoring sessions.
///
/// Cheap to clone; clones share one state machine. Dropping the last clone
/// releases whatever the current session holds.
pub struct SessionController<S, C> {
    inner: Arc<Inner<S, C>>,
}

impl<S, C> Clone for SessionController<S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: VideoSource, C: Connector> SessionController<S, C> {
    pub fn new(source: S, connector: C, options: SessionOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                source,
                connector,
                options,
                state: Mutex::new(ControllerState {
                    state: SessionState::Idle,
                    epoch: 0,
                    session: None,
                    active: None,
                }),
                vitals: LiveVitalsWriter::new(),
                events,
            }),
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.state.lock().await.state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn vitals(&self) -> watch::Receiver<LiveVitals> {
        self.inner.vitals.subscribe()
    }

    pub fn live_vitals(&self) -> LiveVitals {
        self.inner.vitals.snapshot()
    }

    /// Id of the current or most recent session.
    pub async fn session_id(&self) -> Option<Uuid> {
        self.inner
            .state
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.id)
    }

    /// Heart-rate readings received by the current or most recent session.
    pub async fn samples(&self) -> Vec<f64> {
        self.inner
            .state
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.samples.snapshot())
            .unwrap_or_default()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn emit_state(&self, state: SessionState) {
        log_info!("session state -> {:?}", state);
        self.emit(SessionEvent::StateChanged { state });
    }

    /// Acquires the camera and opens the telemetry channel, then streams
    /// until stopped or until either side fails.
    pub async fn start(&self) -> Result<Uuid, SessionError> {
        let (epoch, session) = {
            let mut guard = self.inner.state.lock().await;
            if guard.state != SessionState::Idle {
                return Err(SessionError::AlreadyActive);
            }
            guard.epoch += 1;
            let session = Session::begin(Utc::now());
            guard.session = Some(session.clone());
            guard.state = SessionState::Acquiring;
            (guard.epoch, session)
        };
        let mut pending = PendingStart {
            controller: self.clone(),
            epoch,
            armed: true,
        };
        self.emit_state(SessionState::Acquiring);
        log_info!("session {} acquiring (epoch {})", session.id, epoch);

        let (video, channel) = tokio::join!(
            self.inner.source.acquire(self.inner.options.tier),
            self.inner.connector.open()
        );

        let mut guard = self.inner.state.lock().await;
        // Nothing below awaits, so every exit settles the state itself.
        pending.disarm();
        if guard.epoch != epoch || guard.state != SessionState::Acquiring {
            drop(guard);
            if let Ok(mut video) = video {
                video.release();
            }
            if let Ok(channel) = channel {
                channel.close();
            }
            log_info!("discarded acquisition of superseded epoch {}", epoch);
            return Err(SessionError::Cancelled);
        }

        let (video, mut channel) = match (video, channel) {
            (Ok(video), Ok(channel)) => (video, channel),
            (Ok(mut video), Err(err)) => {
                video.release();
                guard.state = SessionState::Idle;
                drop(guard);
                return Err(self.fail_start(err.into()));
            }
            (Err(err), Ok(channel)) => {
                channel.close();
                guard.state = SessionState::Idle;
                drop(guard);
                return Err(self.fail_start(err.into()));
            }
            (Err(err), Err(connect_err)) => {
                log_debug!("telemetry open also failed: {}", connect_err);
                guard.state = SessionState::Idle;
                drop(guard);
                return Err(self.fail_start(err.into()));
            }
        };

        let Some(messages) = channel.take_messages() else {
            let mut video = video;
            video.release();
            channel.close();
            guard.state = SessionState::Idle;
            drop(guard);
            return Err(self.fail_start(
                TransportError {
                    reason: "inbound stream already taken".into(),
                }
                .into(),
            ));
        };

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump(
            Arc::downgrade(&self.inner),
            epoch,
            FrameEncoder::new(video.feed(), self.inner.options.encoder),
            channel.sender(),
            messages,
            VitalsIngest::new(self.inner.vitals.clone(), session.samples.clone()),
            cancel.clone(),
        ));
        log_info!(
            "session {} streaming at {} (epoch {})",
            session.id,
            video.resolution(),
            epoch
        );
        guard.active = Some(Active {
            video,
            channel,
            cancel,
            pump,
        });
        guard.state = SessionState::Streaming;
        drop(guard);
        self.emit_state(SessionState::Streaming);

        Ok(session.id)
    }

    fn fail_start(&self, err: SessionError) -> SessionError {
        log_error!("session start failed: {}", err);
        self.emit_state(SessionState::Idle);
        self.emit(SessionEvent::Failed {
            message: err.to_string(),
        });
        err
    }

    /// Ends the current session. Safe to call in any state.
    pub async fn stop(&self) {
        let mut active = {
            let mut guard = self.inner.state.lock().await;
            let current = guard.state;
            match current {
                SessionState::Idle | SessionState::Stopping => return,
                SessionState::Acquiring => {
                    guard.epoch += 1;
                    guard.state = SessionState::Idle;
                    drop(guard);
                    log_info!("stop requested during acquisition");
                    self.emit_state(SessionState::Idle);
                    return;
                }
                SessionState::Streaming => {
                    guard.epoch += 1;
                    guard.state = SessionState::Stopping;
                    guard.active.take()
                }
            }
        };
        self.emit_state(SessionState::Stopping);

        if let Some(active) = active.as_mut() {
            active.shutdown().await;
        }
        drop(active);

        self.inner.state.lock().await.state = SessionState::Idle;
        self.emit_state(SessionState::Idle);
    }

    /// Tears down after a fatal error observed by the pump of `epoch`.
    async fn end_streaming(&self, epoch: u64, err: SessionError) {
        let active = {
            let mut guard = self.inner.state.lock().await;
            if guard.epoch != epoch || guard.state != SessionState::Streaming {
                return;
            }
            guard.state = SessionState::Stopping;
            guard.active.take()
        };
        log_error!("session ended: {}", err);
        self.emit_state(SessionState::Stopping);

        // Called from the pump itself, so it is not awaited here.
        if let Some(mut active) = active {
            active.release();
        }

        self.inner.state.lock().await.state = SessionState::Idle;
        self.emit_state(SessionState::Idle);
        self.emit(SessionEvent::Failed {
            message: err.to_string(),
        });
    }

    pub async fn generate_report(
        &self,
        thresholds: Thresholds,
    ) -> Result<ReportData, PreconditionError> {
        let session = self.inner.state.lock().await.session.clone();
        let samples = session
            .as_ref()
            .map(|session| session.samples.snapshot())
            .unwrap_or_default();
        build_report(
            session.map(|session| session.started_at),
            &samples,
            &self.inner.vitals.snapshot(),
            thresholds,
            Utc::now(),
        )
    }

    /// Record for the current or most recent session, times in local time.
    pub async fn history_entry(&self) -> Result<NewHistoryRecord, PreconditionError> {
        let session = self
            .inner
            .state
            .lock()
            .await
            .session
            .clone()
            .ok_or(PreconditionError)?;
        let quality = self.inner.vitals.snapshot().signal_quality;
        Ok(session.history_entry_in(&Local, Utc::now(), quality.as_deref()))
    }

    /// Submits the session to the record store. Session state is untouched
    /// whatever the store answers.
    pub async fn save_session<R: RecordStore>(
        &self,
        store: &R,
    ) -> Result<HistoryRecord, SessionError> {
        let entry = self.history_entry().await?;
        match store.create_record(&entry).await {
            Ok(record) => {
                log_info!("saved session as record {}", record.id);
                Ok(record)
            }
            Err(err) => {
                log_warn!("saving session failed: {}", err);
                Err(err.into())
            }
        }
    }
}

async fn pump<S: VideoSource, C: Connector>(
    controller: Weak<Inner<S, C>>,
    epoch: u64,
    mut encoder: FrameEncoder,
    sender: FrameSender,
    mut messages: MessageStream,
    ingest: VitalsIngest,
    cancel: CancellationToken,
) {
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        err = frame_loop(&mut encoder, &sender) => Some(err),
        err = message_loop(&mut messages, &ingest) => Some(err),
    };
    let stats = encoder.stats();
    log_debug!(
        "pump for epoch {} done: {} frames encoded, {} ticks skipped",
        epoch,
        stats.encoded,
        stats.skipped_ticks
    );

    if let (Some(err), Some(inner)) = (outcome, controller.upgrade()) {
        SessionController { inner }.end_streaming(epoch, err).await;
    }
}

async fn frame_loop(encoder: &mut FrameEncoder, sender: &FrameSender) -> SessionError {
    loop {
        match encoder.next_frame().await {
            Ok(frame) => {
                if !sender.send(frame.jpeg) {
                    log_debug!("frame {} dropped", frame.seq);
                }
            }
            Err(EncodeError::SourceLost) => return AcquisitionError::Disconnected.into(),
            Err(err) => log_warn!("frame skipped: {}", err),
        }
    }
}

async fn message_loop(messages: &mut MessageStream, ingest: &VitalsIngest) -> SessionError {
    while let Some(raw) = messages.recv().await {
        ingest.handle(&raw);
    }
    messages.termination().into()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        capture::SyntheticCamera,
        telemetry::{MemoryConnector, MemoryPeer},
    };
    use tokio::sync::mpsc;

    fn controller(
        camera: SyntheticCamera,
    ) -> (
        SessionController<SyntheticCamera, MemoryConnector>,
        mpsc::UnboundedReceiver<MemoryPeer>,
    ) {
        let (connector, peers) = MemoryConnector::new();
        let options = SessionOptions {
            encoder: EncoderConfig {
                period: Duration::from_millis(10),
                ..EncoderConfig::default()
            },
            ..SessionOptions::default()
        };
        (
            SessionController::new(camera.with_size(32, 24).with_fps(100), connector, options),
            peers,
        )
    }

    #[tokio::test]
    async fn start_then_stop_returns_to_idle() {
        let camera = SyntheticCamera::new();
        let (controller, mut peers) = controller(camera.clone());

        controller.start().await.unwrap();
        assert_eq!(controller.state().await, SessionState::Streaming);
        let mut peer = peers.recv().await.unwrap();
        assert!(peer.recv_frame().await.is_some());

        controller.stop().await;
        assert_eq!(controller.state().await, SessionState::Idle);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_streaming() {
        let (controller, _peers) = controller(SyntheticCamera::new());
        controller.start().await.unwrap();
        assert_matches!(controller.start().await, Err(SessionError::AlreadyActive));
        controller.stop().await;
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_no_op() {
        let (controller, _peers) = controller(SyntheticCamera::new());
        controller.stop().await;
        controller.stop().await;
        assert_eq!(controller.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn report_requires_a_started_session() {
        let (controller, _peers) = controller(SyntheticCamera::new());
        let thresholds = Thresholds::default();
        assert_eq!(
            controller.generate_report(thresholds).await,
            Err(PreconditionError)
        );
        assert_eq!(controller.history_entry().await, Err(PreconditionError));
    }

    #[tokio::test]
    async fn new_activation_clears_samples() {
        let (controller, mut peers) = controller(SyntheticCamera::new());

        controller.start().await.unwrap();
        let peer = peers.recv().await.unwrap();
        peer.send_text(r#"{"bpm":80}"#);
        for _ in 0..100 {
            if !controller.samples().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(controller.samples().await, vec![80.0]);
        controller.stop().await;

        controller.start().await.unwrap();
        assert!(controller.samples().await.is_empty());
        controller.stop().await;
    }
}
