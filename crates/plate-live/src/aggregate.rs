//! Full recompute of a sample summary from its completed runs.
//!
//! Every call folds the whole run history again. Nothing is carried over from
//! the previous summary, so two calls over the same runs return equal values.

use crate::error::{LiveError, LiveResult};
use crate::model::{
    Concentration, QualityMetrics, RunRecord, SampleSummary, HIGH_CONFIDENCE_THRESHOLD,
    INVALID_LABEL, NEGATIVE_LABEL, POSITIVE_LABEL,
};
use crate::store::RunSource;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct SummaryAggregator {
    runs: Arc<dyn RunSource>,
}

impl SummaryAggregator {
    pub fn new(runs: Arc<dyn RunSource>) -> Self {
        Self { runs }
    }

    /// Read every completed run of `sample_no` and summarize them.
    /// Fails with `NotFound` when the sample has no completed run.
    pub fn recompute(&self, sample_no: &str) -> LiveResult<SampleSummary> {
        let runs = self.runs.completed_runs(sample_no)?;
        debug!(sample_no, runs = runs.len(), "recomputing summary");
        Self::summarize(sample_no, &runs)
    }

    /// Pure part of `recompute`. Runs that are not completed are ignored.
    pub fn summarize(sample_no: &str, runs: &[RunRecord]) -> LiveResult<SampleSummary> {
        let mut completed: Vec<&RunRecord> = runs.iter().filter(|r| r.is_completed()).collect();
        if completed.is_empty() {
            return Err(LiveError::NotFound(format!(
                "sample {} has no completed runs",
                sample_no
            )));
        }
        completed.sort_by_key(|r| (r.completed_at, r.run_id));

        let mut distribution: BTreeMap<String, u64> = BTreeMap::new();
        let mut confidence_sum = 0.0;
        let mut total_wells: u64 = 0;
        let mut high_confidence: u64 = 0;
        let mut valid: u64 = 0;

        for run in &completed {
            if run.sample_no != sample_no {
                return Err(LiveError::ComputationFailure(format!(
                    "run {} belongs to sample {}, not {}",
                    run.run_id, run.sample_no, sample_no
                )));
            }
            for (label, count) in &run.distribution {
                let slot = distribution.entry(label.clone()).or_insert(0);
                *slot = slot.checked_add(*count).ok_or_else(|| {
                    LiveError::ComputationFailure(format!(
                        "count overflow for label {} in sample {}",
                        label, sample_no
                    ))
                })?;
            }
            for well in &run.wells {
                if !well.confidence.is_finite() || !(0.0..=1.0).contains(&well.confidence) {
                    return Err(LiveError::ComputationFailure(format!(
                        "run {} well {} has confidence {} outside [0, 1]",
                        run.run_id, well.well_id, well.confidence
                    )));
                }
                confidence_sum += well.confidence;
                total_wells += 1;
                if well.confidence > HIGH_CONFIDENCE_THRESHOLD {
                    high_confidence += 1;
                }
                if well.label != INVALID_LABEL {
                    valid += 1;
                }
            }
        }

        let total_count: u64 = distribution.values().sum();
        let positive = distribution.get(POSITIVE_LABEL).copied().unwrap_or(0);
        let negative = distribution.get(NEGATIVE_LABEL).copied().unwrap_or(0);

        let first = completed[0];
        let last = completed[completed.len() - 1];
        let (Some(first_run_at), Some(last_run_at)) = (first.completed_at, last.completed_at) else {
            return Err(LiveError::ComputationFailure(format!(
                "sample {} has a completed run without a completion time",
                sample_no
            )));
        };

        Ok(SampleSummary {
            sample_no: sample_no.to_string(),
            total_count,
            concentration: Concentration {
                positive_percentage: round_to(percentage(positive, total_count), 2),
                negative_percentage: round_to(percentage(negative, total_count), 2),
            },
            quality: QualityMetrics {
                average_confidence: if total_wells == 0 {
                    0.0
                } else {
                    round_to(confidence_sum / total_wells as f64, 3)
                },
                high_confidence_percentage: round_to(percentage(high_confidence, total_wells), 1),
                valid_detection_percentage: round_to(percentage(valid, total_wells), 1),
                total_wells,
            },
            distribution,
            run_count: completed.len() as u64,
            first_run_at,
            last_run_at,
            last_run_id: last.run_id,
        })
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::model::RunStatus;
    use crate::store::MemoryStore;

    fn aggregator(runs: Vec<RunRecord>) -> SummaryAggregator {
        SummaryAggregator::new(Arc::new(MemoryStore::with_runs(runs)))
    }

    #[test]
    fn two_runs_sum_their_distributions() {
        let agg = aggregator(vec![
            completed_run(1, "S1", 0, &[("positive", 3), ("negative", 2)], &[]),
            completed_run(2, "S1", 5, &[("positive", 1), ("negative", 4)], &[]),
        ]);
        let summary = agg.recompute("S1").expect("summary");
        assert_eq!(summary.distribution.get("positive"), Some(&4));
        assert_eq!(summary.distribution.get("negative"), Some(&6));
        assert_eq!(summary.total_count, 10);
        assert_eq!(summary.concentration.positive_percentage, 40.00);
        assert_eq!(summary.concentration.negative_percentage, 60.00);
        assert_eq!(summary.run_count, 2);
        assert_eq!(summary.last_run_id, 2);
        assert_eq!(summary.first_run_at, ts(0));
        assert_eq!(summary.last_run_at, ts(5));
    }

    #[test]
    fn labels_are_the_union_across_runs() {
        let agg = aggregator(vec![
            completed_run(1, "S1", 0, &[("positive", 1)], &[]),
            completed_run(2, "S1", 1, &[("invalid", 2)], &[]),
        ]);
        let summary = agg.recompute("S1").expect("summary");
        let labels: Vec<&str> = summary.distribution.keys().map(String::as_str).collect();
        assert_eq!(labels, vec!["invalid", "positive"]);
        assert_eq!(summary.total_count, 3);
        assert_eq!(summary.concentration.positive_percentage, 33.33);
        assert_eq!(summary.concentration.negative_percentage, 0.0);
    }

    #[test]
    fn quality_metrics_are_rounded() {
        let agg = aggregator(vec![completed_run(
            1,
            "S1",
            0,
            &[],
            &[
                ("positive", 0.95),
                ("negative", 0.81),
                ("invalid", 0.30),
            ],
        )]);
        let summary = agg.recompute("S1").expect("summary");
        assert_eq!(summary.quality.total_wells, 3);
        assert_eq!(summary.quality.average_confidence, 0.687);
        assert_eq!(summary.quality.high_confidence_percentage, 66.7);
        assert_eq!(summary.quality.valid_detection_percentage, 66.7);
    }

    #[test]
    fn empty_totals_yield_zero_percentages() {
        let agg = aggregator(vec![completed_run(1, "S1", 0, &[], &[])]);
        let summary = agg.recompute("S1").expect("summary");
        assert_eq!(summary.total_count, 0);
        assert_eq!(summary.concentration.positive_percentage, 0.0);
        assert_eq!(summary.quality.average_confidence, 0.0);
        assert_eq!(summary.quality.valid_detection_percentage, 0.0);
    }

    #[test]
    fn no_completed_runs_is_not_found() {
        let mut failed = completed_run(1, "S1", 0, &[("positive", 1)], &[]);
        failed.status = RunStatus::Failed;
        let err = SummaryAggregator::summarize("S1", &[failed]).expect_err("no runs");
        assert_eq!(err.kind(), "not_found");
        let err = aggregator(vec![]).recompute("S1").expect_err("unknown sample");
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn out_of_range_confidence_is_a_computation_failure() {
        let run = completed_run(1, "S1", 0, &[], &[("positive", f64::NAN)]);
        let err = SummaryAggregator::summarize("S1", &[run]).expect_err("nan");
        assert_eq!(err.kind(), "computation_failure");
        let run = completed_run(1, "S1", 0, &[], &[("positive", 1.5)]);
        assert!(SummaryAggregator::summarize("S1", &[run]).is_err());
    }

    #[test]
    fn recompute_is_idempotent() {
        let agg = aggregator(vec![
            completed_run(3, "S1", 2, &[("positive", 2)], &[("positive", 0.9)]),
            completed_run(1, "S1", 0, &[("negative", 5)], &[("negative", 0.4)]),
        ]);
        let a = agg.recompute("S1").expect("first");
        let b = agg.recompute("S1").expect("second");
        assert_eq!(
            serde_json::to_vec(&a).expect("encode"),
            serde_json::to_vec(&b).expect("encode")
        );
        assert_eq!(
            a.fingerprint().expect("fingerprint"),
            b.fingerprint().expect("fingerprint")
        );
    }

    #[test]
    fn latest_run_wins_by_completion_time_not_id() {
        let agg = aggregator(vec![
            completed_run(9, "S1", 0, &[("positive", 1)], &[]),
            completed_run(4, "S1", 30, &[("positive", 1)], &[]),
        ]);
        let summary = agg.recompute("S1").expect("summary");
        assert_eq!(summary.last_run_id, 4);
        assert_eq!(summary.last_run_at, ts(30));
    }
}
