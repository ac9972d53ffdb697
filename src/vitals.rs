//! Live vitals state and inbound telemetry ingestion.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::error::MalformedTelemetry;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

/// Latest known value of each vital. Fields stay `None` until first received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveVitals {
    pub bpm: Option<f64>,
    pub spo2: Option<f64>,
    pub resp_rate: Option<f64>,
    pub snr: Option<f64>,
    pub lighting: Option<f64>,
    pub signal_quality: Option<String>,
}

/// Wire shape of one inbound message. Any subset of fields may be present.
#[derive(Debug, Default, Deserialize)]
struct RawTelemetry {
    bpm: Option<Value>,
    spo2: Option<Value>,
    resp_rate: Option<Value>,
    snr: Option<Value>,
    lighting: Option<Value>,
    quality: Option<Value>,
}

/// Fields carried by one message after coercion; absent means "leave as is".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryUpdate {
    pub bpm: Option<f64>,
    pub spo2: Option<f64>,
    pub resp_rate: Option<f64>,
    pub snr: Option<f64>,
    pub lighting: Option<f64>,
    pub quality: Option<String>,
}

fn coerce_number(field: &str, value: Option<Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) if !text.trim().is_empty() => match text.trim().parse::<f64>() {
            Ok(number) => Some(number),
            Err(_) => {
                log_warn!("ignoring non-numeric telemetry field {field}={text:?}");
                None
            }
        },
        other => {
            log_warn!("ignoring telemetry field {field} of unexpected shape: {other}");
            None
        }
    }
}

fn coerce_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(text) => Some(text),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

pub fn parse_message(raw: &str) -> Result<TelemetryUpdate, MalformedTelemetry> {
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err(MalformedTelemetry(serde::de::Error::custom(
            "expected a JSON object",
        )));
    }
    let message: RawTelemetry = serde_json::from_value(value)?;
    Ok(TelemetryUpdate {
        bpm: coerce_number("bpm", message.bpm),
        spo2: coerce_number("spo2", message.spo2),
        resp_rate: coerce_number("resp_rate", message.resp_rate),
        snr: coerce_number("snr", message.snr),
        lighting: coerce_number("lighting", message.lighting),
        quality: coerce_text(message.quality),
    })
}

fn accept(slot: &mut Option<f64>, value: Option<f64>) {
    if let Some(value) = value {
        if value.is_finite() && value >= 0.0 {
            *slot = Some(value);
        }
    }
}

impl LiveVitals {
    /// Applies each present field independently; last write wins per field.
    pub fn apply(&mut self, update: &TelemetryUpdate) {
        accept(&mut self.bpm, update.bpm);
        accept(&mut self.spo2, update.spo2);
        accept(&mut self.resp_rate, update.resp_rate);
        accept(&mut self.snr, update.snr);
        accept(&mut self.lighting, update.lighting);
        if let Some(quality) = &update.quality {
            self.signal_quality = Some(quality.clone());
        }
    }
}

/// Write side of the shared vitals cell. Only ingestion holds one.
#[derive(Clone)]
pub struct LiveVitalsWriter {
    tx: Arc<watch::Sender<LiveVitals>>,
}

impl LiveVitalsWriter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LiveVitals::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveVitals> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> LiveVitals {
        self.tx.borrow().clone()
    }

    fn apply(&self, update: &TelemetryUpdate) {
        self.tx.send_modify(|vitals| vitals.apply(update));
    }
}

impl Default for LiveVitalsWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only heart-rate samples of one session, in arrival order.
#[derive(Clone, Default)]
pub struct SampleLog {
    inner: Arc<Mutex<Vec<f64>>>,
}

impl SampleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, bpm: f64) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bpm);
    }

    /// Frozen copy; later appends do not show up in it.
    pub fn snapshot(&self) -> Vec<f64> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Routes inbound telemetry into the live vitals and the session's samples.
#[derive(Clone)]
pub struct VitalsIngest {
    vitals: LiveVitalsWriter,
    samples: SampleLog,
}

impl VitalsIngest {
    pub fn new(vitals: LiveVitalsWriter, samples: SampleLog) -> Self {
        Self { vitals, samples }
    }

    /// Never fails: malformed payloads are logged and dropped.
    pub fn handle(&self, raw: &str) {
        match parse_message(raw) {
            Ok(update) => {
                if let Some(bpm) = update.bpm {
                    self.samples.push(bpm);
                }
                self.vitals.apply(&update);
                log_debug!("telemetry applied: {:?}", update);
            }
            Err(err) => {
                let preview: String = raw.chars().take(64).collect();
                log_warn!("{err} (payload: {preview:?})");
            }
        }
    }
}
