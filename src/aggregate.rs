//! Session and history statistics.
//!
//! Every function here filters its input to finite, strictly positive values
//! first; a non-positive reading is a dropout from the remote estimator, not
//! a heart rate.

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::records::HistoryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

impl MinMax {
    pub const EMPTY: MinMax = MinMax { min: 0.0, max: 0.0 };
}

fn valid(samples: &[f64]) -> impl Iterator<Item = f64> + '_ {
    samples
        .iter()
        .copied()
        .filter(|value| value.is_finite() && *value > 0.0)
}

/// Arithmetic mean of the valid samples, or 0 when there are none.
pub fn average(samples: &[f64]) -> f64 {
    let (sum, count) = valid(samples).fold((0.0, 0usize), |(sum, count), value| {
        (sum + value, count + 1)
    });
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Smallest and largest valid sample, or `{0, 0}` when there are none.
pub fn min_max(samples: &[f64]) -> MinMax {
    valid(samples)
        .fold(None, |acc: Option<MinMax>, value| {
            Some(match acc {
                None => MinMax {
                    min: value,
                    max: value,
                },
                Some(range) => MinMax {
                    min: range.min.min(value),
                    max: range.max.max(value),
                },
            })
        })
        .unwrap_or(MinMax::EMPTY)
}

/// Rounds to one decimal place, the precision reports and saved records use.
pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TrendDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trend {
    pub direction: TrendDirection,
    /// Absolute percent change of the latest session against the previous one.
    pub percent: f64,
}

/// Summary across saved sessions; `None` fields mean no usable record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
    pub overall_avg: Option<f64>,
    pub max_avg: Option<f64>,
    pub min_avg: Option<f64>,
    pub trend: Option<Trend>,
}

const TREND_MIN_PERCENT: f64 = 0.1;

fn record_start(record: &HistoryRecord) -> i64 {
    let start = if record.start_time.is_empty() {
        "00:00"
    } else {
        record.start_time.as_str()
    };
    NaiveDateTime::parse_from_str(&format!("{} {}", record.date, start), "%Y-%m-%d %H:%M")
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(0)
}

pub fn summarize_history(records: &[HistoryRecord]) -> HistorySummary {
    let mut usable: Vec<&HistoryRecord> = records
        .iter()
        .filter(|record| record.avg_bpm.is_finite() && record.avg_bpm > 0.0)
        .collect();

    let averages: Vec<f64> = usable.iter().map(|record| record.avg_bpm).collect();
    let (overall_avg, max_avg, min_avg) = if averages.is_empty() {
        (None, None, None)
    } else {
        let range = min_max(&averages);
        (Some(average(&averages)), Some(range.max), Some(range.min))
    };

    usable.sort_by_key(|record| std::cmp::Reverse(record_start(record)));
    let trend = match (usable.first(), usable.get(1)) {
        (Some(latest), Some(previous)) => {
            let pct = (latest.avg_bpm - previous.avg_bpm) / previous.avg_bpm * 100.0;
            (pct.is_finite() && pct.abs() >= TREND_MIN_PERCENT).then(|| Trend {
                direction: if pct >= 0.0 {
                    TrendDirection::Up
                } else {
                    TrendDirection::Down
                },
                percent: pct.abs(),
            })
        }
        _ => None,
    };

    HistorySummary {
        overall_avg,
        max_avg,
        min_avg,
        trend,
    }
}
