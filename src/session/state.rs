use std::fmt::Display;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    aggregate::{average, round_tenth},
    records::NewHistoryRecord,
    vitals::SampleLog,
};

/// Quality recorded when the service never reported one.
pub const DEFAULT_SIGNAL_QUALITY: &str = "Good";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Idle,
    Acquiring,
    Streaming,
    Stopping,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChanged { state: SessionState },
    /// User-visible failure that ended (or prevented) a session.
    Failed { message: String },
}

/// One monitoring activation. Kept after the session ends so it can still be
/// reported on or saved.
#[derive(Clone)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub samples: SampleLog,
}

impl Session {
    pub fn begin(started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            samples: SampleLog::new(),
        }
    }

    /// Record to submit on save, with dates and times rendered in `tz`.
    pub fn history_entry_in<Tz>(
        &self,
        tz: &Tz,
        ended_at: DateTime<Utc>,
        signal_quality: Option<&str>,
    ) -> NewHistoryRecord
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let start = self.started_at.with_timezone(tz);
        let end = ended_at.with_timezone(tz);
        NewHistoryRecord {
            date: start.format("%Y-%m-%d").to_string(),
            start_time: start.format("%H:%M").to_string(),
            end_time: end.format("%H:%M").to_string(),
            avg_bpm: round_tenth(average(&self.samples.snapshot())),
            signal_quality: signal_quality
                .filter(|quality| !quality.trim().is_empty())
                .unwrap_or(DEFAULT_SIGNAL_QUALITY)
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, hour, minute, 5).unwrap()
    }

    #[test]
    fn history_entry_formats_date_and_times() {
        let session = Session::begin(at(9, 4));
        for bpm in [100.0, 110.0, 105.0, 0.0] {
            session.samples.push(bpm);
        }

        let entry = session.history_entry_in(&Utc, at(9, 31), Some("Fair"));
        assert_eq!(entry.date, "2024-03-09");
        assert_eq!(entry.start_time, "09:04");
        assert_eq!(entry.end_time, "09:31");
        assert_eq!(entry.avg_bpm, 105.0);
        assert_eq!(entry.signal_quality, "Fair");
    }

    #[test]
    fn missing_quality_defaults_to_good() {
        let session = Session::begin(at(22, 0));
        let entry = session.history_entry_in(&Utc, at(22, 10), None);
        assert_eq!(entry.signal_quality, DEFAULT_SIGNAL_QUALITY);
        assert_eq!(entry.avg_bpm, 0.0);

        let entry = session.history_entry_in(&Utc, at(22, 10), Some("  "));
        assert_eq!(entry.signal_quality, DEFAULT_SIGNAL_QUALITY);
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = SessionEvent::StateChanged {
            state: SessionState::Streaming,
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"type":"stateChanged","state":"streaming"}"#
        );
    }

    #[test]
    fn each_activation_gets_its_own_id() {
        assert_ne!(Session::begin(at(1, 0)).id, Session::begin(at(1, 0)).id);
    }
}
