//! Telemetry in, report and saved record out.

use std::{sync::Mutex, time::Duration};

use assert_matches::assert_matches;

use pulsecam_lib::{
    capture::SyntheticCamera,
    encoder::EncoderConfig,
    error::{PreconditionError, SessionError, StoreError},
    records::{HistoryRecord, NewHistoryRecord, RecordStore},
    report::Thresholds,
    session::{SessionController, SessionOptions, SessionState},
    telemetry::{MemoryConnector, MemoryPeer},
};

type Controller = SessionController<SyntheticCamera, MemoryConnector>;

async fn streaming() -> (Controller, MemoryPeer) {
    let (connector, mut peers) = MemoryConnector::new();
    let controller = SessionController::new(
        SyntheticCamera::new().with_size(32, 24).with_fps(50),
        connector,
        SessionOptions {
            encoder: EncoderConfig {
                period: Duration::from_millis(20),
                ..EncoderConfig::default()
            },
            ..SessionOptions::default()
        },
    );
    controller.start().await.expect("start");
    let peer = tokio::time::timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("no connection")
        .expect("connector dropped");
    (controller, peer)
}

async fn wait_for_samples(controller: &Controller, count: usize) {
    for _ in 0..200 {
        if controller.samples().await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {count} samples, got {:?}", controller.samples().await);
}

#[derive(Default)]
struct FakeStore {
    saved: Mutex<Vec<NewHistoryRecord>>,
    expired: bool,
}

impl RecordStore for FakeStore {
    async fn list_records(&self) -> Result<Vec<HistoryRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn create_record(&self, record: &NewHistoryRecord) -> Result<HistoryRecord, StoreError> {
        if self.expired {
            return Err(StoreError::AuthorizationExpired);
        }
        let mut saved = self.saved.lock().unwrap();
        saved.push(record.clone());
        Ok(HistoryRecord {
            id: saved.len() as i64,
            date: record.date.clone(),
            start_time: record.start_time.clone(),
            end_time: record.end_time.clone(),
            avg_bpm: record.avg_bpm,
            signal_quality: record.signal_quality.clone(),
        })
    }
}

#[tokio::test]
async fn three_readings_produce_the_expected_report() {
    let (controller, peer) = streaming().await;
    for bpm in [100, 110, 105] {
        assert!(peer.send_text(format!(
            r#"{{"bpm":{bpm},"spo2":null,"resp_rate":null,"snr":null,"lighting":null,"quality":null}}"#
        )));
    }
    wait_for_samples(&controller, 3).await;
    controller.stop().await;

    let report = controller
        .generate_report(Thresholds::default())
        .await
        .expect("report");
    assert!((report.avg_bpm - 105.0).abs() < 1e-9);
    assert_eq!(report.min_bpm, 100.0);
    assert_eq!(report.max_bpm, 110.0);
    assert_eq!(report.sample_count, 3);
    assert_eq!((report.threshold_min, report.threshold_max), (60, 220));
    assert!(report.start_at.is_some());
    assert_eq!(report.snapshot.bpm, Some(105.0));
    assert_eq!(report.snapshot.spo2, None);
}

#[tokio::test]
async fn report_before_any_session_is_refused() {
    let (connector, _peers) = MemoryConnector::new();
    let controller: Controller =
        SessionController::new(SyntheticCamera::new(), connector, SessionOptions::default());
    assert_eq!(
        controller.generate_report(Thresholds::default()).await,
        Err(PreconditionError)
    );

    let store = FakeStore::default();
    assert_matches!(
        controller.save_session(&store).await,
        Err(SessionError::Precondition(_))
    );
    assert!(store.saved.lock().unwrap().is_empty());
}

#[tokio::test]
async fn vitals_fields_update_independently() {
    let (controller, peer) = streaming().await;
    let mut vitals = controller.vitals();

    peer.send_text(r#"{"bpm":120}"#);
    peer.send_text(r#"{"spo2":97}"#);
    tokio::time::timeout(
        Duration::from_secs(5),
        vitals.wait_for(|vitals| vitals.spo2.is_some()),
    )
    .await
    .expect("no update")
    .expect("vitals closed");

    let snapshot = controller.live_vitals();
    assert_eq!(snapshot.bpm, Some(120.0));
    assert_eq!(snapshot.spo2, Some(97.0));
    controller.stop().await;
}

#[tokio::test]
async fn malformed_messages_do_not_disturb_the_session() {
    let (controller, peer) = streaming().await;

    peer.send_text("not json");
    peer.send_text(r#"{"bpm": "#);
    peer.send_text(r#"{"bpm":90}"#);
    wait_for_samples(&controller, 1).await;

    assert_eq!(controller.samples().await, vec![90.0]);
    assert_eq!(controller.state().await, SessionState::Streaming);
    controller.stop().await;
}

#[tokio::test]
async fn saving_submits_the_session_summary() {
    let (controller, peer) = streaming().await;
    peer.send_text(r#"{"bpm":72.34,"quality":"Excellent"}"#);
    peer.send_text(r#"{"bpm":75.1}"#);
    wait_for_samples(&controller, 2).await;
    controller.stop().await;

    let store = FakeStore::default();
    let record = controller.save_session(&store).await.expect("saved");
    assert_eq!(record.id, 1);

    let saved = store.saved.lock().unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].avg_bpm, 73.7);
    assert_eq!(saved[0].signal_quality, "Excellent");
    assert_eq!(saved[0].date.len(), "2024-01-01".len());
    assert_eq!(saved[0].start_time.len(), "08:00".len());
}

#[tokio::test]
async fn expired_authorization_leaves_the_session_intact() {
    let (controller, peer) = streaming().await;
    peer.send_text(r#"{"bpm":80}"#);
    wait_for_samples(&controller, 1).await;
    controller.stop().await;

    let store = FakeStore {
        expired: true,
        ..FakeStore::default()
    };
    let err = controller.save_session(&store).await.unwrap_err();
    assert!(err.is_authorization_expired());

    assert_eq!(controller.samples().await, vec![80.0]);
    assert_eq!(controller.state().await, SessionState::Idle);
    let report = controller
        .generate_report(Thresholds::default())
        .await
        .expect("report");
    assert_eq!(report.sample_count, 1);
}
