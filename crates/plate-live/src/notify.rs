//! Outbound notifications.
//!
//! Wire shape: `{"type": "...", "data": {...}, "timestamp": "..."}`. Each kind
//! has its own payload struct.

use crate::error::{LiveError, LiveResult};
use crate::model::{RunId, SampleSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleUpdated {
    pub sample_no: String,
    pub summary: SampleSummary,
    /// Run whose completion or deletion caused the recompute, if known.
    pub trigger_run_id: Option<RunId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompleted {
    pub run_id: RunId,
    pub sample_no: String,
    pub run_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailed {
    pub run_id: RunId,
    pub sample_no: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub samples: usize,
    pub summaries: usize,
    pub runs_by_status: BTreeMap<String, u64>,
    pub connections: usize,
    pub sockets: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NotificationEvent {
    SampleUpdated(SampleUpdated),
    RunCompleted(RunCompleted),
    RunFailed(RunFailed),
    SystemStatsUpdated(SystemStats),
}

impl NotificationEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            NotificationEvent::SampleUpdated(_) => "sample_updated",
            NotificationEvent::RunCompleted(_) => "run_completed",
            NotificationEvent::RunFailed(_) => "run_failed",
            NotificationEvent::SystemStatsUpdated(_) => "system_stats_updated",
        }
    }
}

/// Immutable once built. The timestamp is taken at construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    #[serde(flatten)]
    event: NotificationEvent,
    timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(event: NotificationEvent) -> Self {
        Self::at(event, Utc::now())
    }

    pub fn at(event: NotificationEvent, timestamp: DateTime<Utc>) -> Self {
        Self { event, timestamp }
    }

    pub fn sample_updated(summary: SampleSummary, trigger_run_id: Option<RunId>) -> Self {
        Self::new(NotificationEvent::SampleUpdated(SampleUpdated {
            sample_no: summary.sample_no.clone(),
            summary,
            trigger_run_id,
        }))
    }

    pub fn run_completed(run_id: RunId, sample_no: &str, run_count: u64) -> Self {
        Self::new(NotificationEvent::RunCompleted(RunCompleted {
            run_id,
            sample_no: sample_no.to_string(),
            run_count,
        }))
    }

    pub fn run_failed(run_id: RunId, sample_no: &str, error: &str) -> Self {
        Self::new(NotificationEvent::RunFailed(RunFailed {
            run_id,
            sample_no: sample_no.to_string(),
            error: error.to_string(),
        }))
    }

    pub fn system_stats(stats: SystemStats) -> Self {
        Self::new(NotificationEvent::SystemStatsUpdated(stats))
    }

    pub fn event(&self) -> &NotificationEvent {
        &self.event
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn type_name(&self) -> &'static str {
        self.event.type_name()
    }

    pub fn encode(&self) -> LiveResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            LiveError::ComputationFailure(format!("encode {}: {}", self.type_name(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::SummaryAggregator;
    use crate::model::fixtures::*;
    use serde_json::Value;

    #[test]
    fn wire_shape_has_type_data_timestamp() {
        let note = Notification::at(
            NotificationEvent::RunFailed(RunFailed {
                run_id: 77,
                sample_no: "S1".to_string(),
                error: "model crashed".to_string(),
            }),
            ts(3),
        );
        let value: Value = serde_json::from_slice(&note.encode().expect("encode")).expect("json");
        assert_eq!(value["type"], "run_failed");
        assert_eq!(value["data"]["run_id"], 77);
        assert_eq!(value["data"]["error"], "model crashed");
        assert_eq!(value["timestamp"], "2026-03-01T12:03:00Z");
        assert_eq!(value.as_object().map(|o| o.len()), Some(3));
    }

    #[test]
    fn every_kind_serializes_its_type_name() {
        let summary = SummaryAggregator::summarize(
            "S1",
            &[completed_run(1, "S1", 0, &[("positive", 1)], &[])],
        )
        .expect("summary");
        let notes = vec![
            Notification::sample_updated(summary, Some(1)),
            Notification::run_completed(1, "S1", 1),
            Notification::run_failed(2, "S1", "boom"),
            Notification::system_stats(SystemStats::default()),
        ];
        for note in notes {
            let value: Value =
                serde_json::from_slice(&note.encode().expect("encode")).expect("json");
            assert_eq!(value["type"], note.type_name());
        }
    }

    #[test]
    fn sample_updated_carries_full_summary() {
        let summary = SummaryAggregator::summarize(
            "S1",
            &[completed_run(1, "S1", 0, &[("positive", 3), ("negative", 1)], &[])],
        )
        .expect("summary");
        let note = Notification::sample_updated(summary.clone(), None);
        let value: Value = serde_json::from_slice(&note.encode().expect("encode")).expect("json");
        let decoded: SampleSummary =
            serde_json::from_value(value["data"]["summary"].clone()).expect("summary decodes");
        assert_eq!(decoded, summary);
        assert!(value["data"]["trigger_run_id"].is_null());
    }
}
