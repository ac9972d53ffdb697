//! Threshold evaluation and report snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    aggregate::{average, min_max, round_tenth},
    error::PreconditionError,
    vitals::LiveVitals,
};

pub const DEFAULT_MIN_HR: u32 = 60;
pub const DEFAULT_MAX_HR: u32 = 220;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ThresholdsError {
    #[error("heart-rate bounds must be positive")]
    NotPositive,
    #[error("minimum heart rate {min} must be below maximum {max}")]
    Inverted { min: u32, max: u32 },
}

/// User-configured normal heart-rate range, exclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(rename = "minHR")]
    min_hr: u32,
    #[serde(rename = "maxHR")]
    max_hr: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_hr: DEFAULT_MIN_HR,
            max_hr: DEFAULT_MAX_HR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HeartRateStatus {
    Below,
    Normal,
    Above,
}

impl Thresholds {
    pub fn new(min_hr: u32, max_hr: u32) -> Result<Self, ThresholdsError> {
        let thresholds = Self { min_hr, max_hr };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<(), ThresholdsError> {
        if self.min_hr == 0 || self.max_hr == 0 {
            return Err(ThresholdsError::NotPositive);
        }
        if self.min_hr >= self.max_hr {
            return Err(ThresholdsError::Inverted {
                min: self.min_hr,
                max: self.max_hr,
            });
        }
        Ok(())
    }

    pub fn min_hr(&self) -> u32 {
        self.min_hr
    }

    pub fn max_hr(&self) -> u32 {
        self.max_hr
    }

    pub fn is_normal(&self, bpm: f64) -> bool {
        self.classify(bpm) == HeartRateStatus::Normal
    }

    pub fn classify(&self, bpm: f64) -> HeartRateStatus {
        if bpm > f64::from(self.min_hr) && bpm < f64::from(self.max_hr) {
            HeartRateStatus::Normal
        } else if bpm >= f64::from(self.max_hr) {
            HeartRateStatus::Above
        } else {
            // NaN lands here too.
            HeartRateStatus::Below
        }
    }
}

/// Immutable summary handed to the export layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportData {
    pub created_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: DateTime<Utc>,
    pub avg_bpm: f64,
    pub min_bpm: f64,
    pub max_bpm: f64,
    /// Heart-rate readings received during the session, valid or not.
    pub sample_count: usize,
    pub threshold_min: u32,
    pub threshold_max: u32,
    pub snapshot: LiveVitals,
}

/// Builds a report from frozen inputs. Fails if no session was ever started.
pub fn build_report(
    started_at: Option<DateTime<Utc>>,
    samples: &[f64],
    vitals: &LiveVitals,
    thresholds: Thresholds,
    now: DateTime<Utc>,
) -> Result<ReportData, PreconditionError> {
    let start_at = started_at.ok_or(PreconditionError)?;
    let range = min_max(samples);

    Ok(ReportData {
        created_at: now,
        start_at: Some(start_at),
        end_at: now,
        avg_bpm: round_tenth(average(samples)),
        min_bpm: range.min,
        max_bpm: range.max,
        sample_count: samples.len(),
        threshold_min: thresholds.min_hr,
        threshold_max: thresholds.max_hr,
        snapshot: vitals.clone(),
    })
}
