//! Records read from and written to the external store.
//!
//! `RunRecord` is source of truth. `SampleSummary` is a cache derived from the
//! completed runs of one sample and can always be rebuilt from them.

use crate::error::{LiveError, LiveResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub type RunId = i64;

/// Class label the detector assigns to wells it could not read.
pub const INVALID_LABEL: &str = "invalid";
pub const POSITIVE_LABEL: &str = "positive";
pub const NEGATIVE_LABEL: &str = "negative";

/// Wells above this confidence count toward the high-confidence share.
pub const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellPrediction {
    pub well_id: String,
    pub label: String,
    pub confidence: f64,
    /// `[x, y, width, height]` in image pixels.
    #[serde(default)]
    pub bbox: [f64; 4],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub sample_no: String,
    pub status: RunStatus,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub wells: Vec<WellPrediction>,
    #[serde(default)]
    pub distribution: BTreeMap<String, u64>,
    #[serde(default)]
    pub model_version: Option<String>,
}

impl RunRecord {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed && self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concentration {
    pub positive_percentage: f64,
    pub negative_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub average_confidence: f64,
    pub high_confidence_percentage: f64,
    pub valid_detection_percentage: f64,
    pub total_wells: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub sample_no: String,
    pub distribution: BTreeMap<String, u64>,
    pub total_count: u64,
    pub concentration: Concentration,
    pub quality: QualityMetrics,
    pub run_count: u64,
    pub first_run_at: DateTime<Utc>,
    pub last_run_at: DateTime<Utc>,
    pub last_run_id: RunId,
}

impl SampleSummary {
    /// `sha256:<hex>` over the JSON encoding. Map keys are ordered, so equal
    /// summaries always hash the same.
    pub fn fingerprint(&self) -> LiveResult<String> {
        let bytes = serde_json::to_vec(self).map_err(|e| {
            LiveError::ComputationFailure(format!("encode summary {}: {}", self.sample_no, e))
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub summary: SampleSummary,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    pub fn completed_run(
        run_id: RunId,
        sample_no: &str,
        minute: u32,
        counts: &[(&str, u64)],
        wells: &[(&str, f64)],
    ) -> RunRecord {
        RunRecord {
            run_id,
            sample_no: sample_no.to_string(),
            status: RunStatus::Completed,
            completed_at: Some(ts(minute)),
            wells: wells
                .iter()
                .enumerate()
                .map(|(i, (label, confidence))| WellPrediction {
                    well_id: format!("A{}", i + 1),
                    label: label.to_string(),
                    confidence: *confidence,
                    bbox: [0.0, 0.0, 10.0, 10.0],
                })
                .collect(),
            distribution: counts
                .iter()
                .map(|(label, count)| (label.to_string(), *count))
                .collect(),
            model_version: Some("v1".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn run_status_uses_snake_case_on_the_wire() {
        let encoded = serde_json::to_string(&RunStatus::Processing).expect("encode");
        assert_eq!(encoded, "\"processing\"");
        let decoded: RunStatus = serde_json::from_str("\"failed\"").expect("decode");
        assert_eq!(decoded, RunStatus::Failed);
    }

    #[test]
    fn completed_requires_timestamp() {
        let mut run = completed_run(1, "S1", 0, &[], &[]);
        assert!(run.is_completed());
        run.completed_at = None;
        assert!(!run.is_completed());
        run.completed_at = Some(ts(1));
        run.status = RunStatus::Failed;
        assert!(!run.is_completed());
    }

    #[test]
    fn fingerprint_is_prefixed_sha256_hex() {
        let summary = crate::aggregate::SummaryAggregator::summarize(
            "S1",
            &[completed_run(1, "S1", 0, &[("positive", 2)], &[])],
        )
        .expect("summary");
        let fingerprint = summary.fingerprint().expect("fingerprint");
        let hex_part = fingerprint.strip_prefix("sha256:").expect("prefix");
        assert_eq!(hex_part.len(), 64);
        let mut changed = summary.clone();
        changed.run_count += 1;
        assert_ne!(changed.fingerprint().expect("fingerprint"), fingerprint);
    }

    #[test]
    fn run_record_defaults_optional_fields() {
        let run: RunRecord = serde_json::from_str(
            r#"{"run_id":5,"sample_no":"S9","status":"pending"}"#,
        )
        .expect("minimal run decodes");
        assert!(run.wells.is_empty());
        assert!(run.distribution.is_empty());
        assert!(run.completed_at.is_none());
    }
}
