//! Out-of-band drift detection between stored summaries and a fresh
//! recompute. Never called on the write path.

use crate::aggregate::SummaryAggregator;
use crate::error::{LiveError, LiveResult};
use crate::store::{RunSource, SummaryStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDrift {
    pub field: String,
    pub stored: String,
    pub expected: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub sample_no: String,
    pub consistent: bool,
    /// A summary is stored but the sample has no completed run left.
    pub orphaned: bool,
    pub details: Vec<FieldDrift>,
    pub stored_fingerprint: Option<String>,
    pub expected_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditReport {
    pub checked: usize,
    pub inconsistent_count: usize,
    pub inconsistent: Vec<String>,
    /// Subset of `inconsistent` whose summary has no runs behind it.
    pub orphaned: Vec<String>,
    pub errors: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct ConsistencyValidator {
    aggregator: SummaryAggregator,
    runs: Arc<dyn RunSource>,
    summaries: Arc<dyn SummaryStore>,
}

impl ConsistencyValidator {
    pub fn new(
        aggregator: SummaryAggregator,
        runs: Arc<dyn RunSource>,
        summaries: Arc<dyn SummaryStore>,
    ) -> Self {
        Self {
            aggregator,
            runs,
            summaries,
        }
    }

    /// Compare run count, last run id and last run time of the stored summary
    /// with a recompute. `NotFound` only when neither side has anything.
    pub fn check(&self, sample_no: &str) -> LiveResult<ConsistencyReport> {
        let stored = self.summaries.load(sample_no)?.map(|r| r.summary);
        let expected = match self.aggregator.recompute(sample_no) {
            Ok(summary) => Some(summary),
            Err(LiveError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };

        let details = match (&stored, &expected) {
            (None, None) => {
                return Err(LiveError::NotFound(format!(
                    "sample {} has neither runs nor a summary",
                    sample_no
                )))
            }
            (Some(_), None) => vec![FieldDrift {
                field: "summary".to_string(),
                stored: "present".to_string(),
                expected: "absent (no completed runs)".to_string(),
            }],
            (None, Some(_)) => vec![FieldDrift {
                field: "summary".to_string(),
                stored: "absent".to_string(),
                expected: "present".to_string(),
            }],
            (Some(stored), Some(expected)) => {
                let mut drift = Vec::new();
                compare(&mut drift, "run_count", stored.run_count, expected.run_count);
                compare(&mut drift, "last_run_id", stored.last_run_id, expected.last_run_id);
                compare(
                    &mut drift,
                    "last_run_at",
                    stored.last_run_at.to_rfc3339(),
                    expected.last_run_at.to_rfc3339(),
                );
                drift
            }
        };

        Ok(ConsistencyReport {
            sample_no: sample_no.to_string(),
            consistent: details.is_empty(),
            orphaned: stored.is_some() && expected.is_none(),
            details,
            stored_fingerprint: stored.as_ref().map(|s| s.fingerprint()).transpose()?,
            expected_fingerprint: expected.as_ref().map(|s| s.fingerprint()).transpose()?,
        })
    }

    /// Check every sample that has runs or a stored summary. Per-sample
    /// errors are collected, not fatal.
    pub fn check_all(&self) -> LiveResult<AuditReport> {
        let mut samples: BTreeSet<String> = self.runs.sample_ids()?.into_iter().collect();
        samples.extend(self.summaries.summary_sample_ids()?);

        let mut report = AuditReport::default();
        for sample_no in samples {
            match self.check(&sample_no) {
                Ok(check) => {
                    report.checked += 1;
                    if !check.consistent {
                        warn!(sample_no, drift = ?check.details, "summary drift detected");
                        if check.orphaned {
                            report.orphaned.push(sample_no.clone());
                        }
                        report.inconsistent.push(sample_no);
                    }
                }
                Err(err) => report.errors.push((sample_no, err.to_string())),
            }
        }
        report.inconsistent_count = report.inconsistent.len();
        info!(
            checked = report.checked,
            inconsistent = report.inconsistent_count,
            errors = report.errors.len(),
            "consistency audit finished"
        );
        Ok(report)
    }
}

fn compare<T: PartialEq + ToString>(drift: &mut Vec<FieldDrift>, field: &str, stored: T, expected: T) {
    if stored != expected {
        drift.push(FieldDrift {
            field: field.to_string(),
            stored: stored.to_string(),
            expected: expected.to_string(),
        });
    }
}
