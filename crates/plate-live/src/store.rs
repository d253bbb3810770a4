//! Seams to the durable store, plus an in-memory implementation.
//!
//! The store itself lives outside this crate. `MemoryStore` backs the CLI's
//! offline replay and the tests, and can be told to fail or stall.

use crate::error::{LiveError, LiveResult};
use crate::model::{RunId, RunRecord, SampleSummary, SummaryRecord};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

pub trait RunSource: Send + Sync {
    /// Completed runs of one sample. Empty when the sample has none.
    fn completed_runs(&self, sample_no: &str) -> LiveResult<Vec<RunRecord>>;

    /// Every sample number that has at least one run, in any status.
    fn sample_ids(&self) -> LiveResult<Vec<String>>;

    fn run_status_counts(&self) -> LiveResult<BTreeMap<String, u64>>;
}

pub trait SummaryStore: Send + Sync {
    fn load(&self, sample_no: &str) -> LiveResult<Option<SummaryRecord>>;

    fn upsert(&self, summary: &SampleSummary) -> LiveResult<SummaryRecord>;

    /// Returns `true` when a summary was stored for `sample_no`.
    fn remove(&self, sample_no: &str) -> LiveResult<bool>;

    fn summary_sample_ids(&self) -> LiveResult<Vec<String>>;

    fn summary_count(&self) -> LiveResult<usize>;
}

#[derive(Default)]
pub struct MemoryStore {
    runs: RwLock<BTreeMap<String, BTreeMap<RunId, RunRecord>>>,
    summaries: RwLock<BTreeMap<String, SummaryRecord>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    read_delay: Mutex<Option<Duration>>,
    upserts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(runs: impl IntoIterator<Item = RunRecord>) -> Self {
        let store = Self::new();
        for run in runs {
            store.put_run(run);
        }
        store
    }

    pub fn put_run(&self, run: RunRecord) {
        let mut runs = self.runs.write();
        runs.entry(run.sample_no.clone())
            .or_default()
            .insert(run.run_id, run);
    }

    pub fn delete_run(&self, run_id: RunId) -> Option<RunRecord> {
        let mut runs = self.runs.write();
        let sample_no = runs
            .iter()
            .find(|(_, by_id)| by_id.contains_key(&run_id))
            .map(|(sample_no, _)| sample_no.clone())?;
        let by_id = runs.get_mut(&sample_no)?;
        let removed = by_id.remove(&run_id);
        if by_id.is_empty() {
            runs.remove(&sample_no);
        }
        removed
    }

    /// Seed a persisted summary directly, bypassing the aggregator.
    pub fn put_summary(&self, record: SummaryRecord) {
        self.summaries
            .write()
            .insert(record.summary.sample_no.clone(), record);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Stall every `completed_runs` call, to widen race windows in tests.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::SeqCst)
    }
}

impl RunSource for MemoryStore {
    fn completed_runs(&self, sample_no: &str) -> LiveResult<Vec<RunRecord>> {
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LiveError::PersistenceFailure(format!(
                "run read rejected for sample {}",
                sample_no
            )));
        }
        let runs = self.runs.read();
        Ok(runs
            .get(sample_no)
            .map(|by_id| {
                by_id
                    .values()
                    .filter(|run| run.is_completed())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn sample_ids(&self) -> LiveResult<Vec<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LiveError::PersistenceFailure(
                "sample listing rejected".to_string(),
            ));
        }
        Ok(self.runs.read().keys().cloned().collect())
    }

    fn run_status_counts(&self) -> LiveResult<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for by_id in self.runs.read().values() {
            for run in by_id.values() {
                *counts.entry(run.status.as_str().to_string()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}

impl SummaryStore for MemoryStore {
    fn load(&self, sample_no: &str) -> LiveResult<Option<SummaryRecord>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LiveError::PersistenceFailure(format!(
                "summary read rejected for sample {}",
                sample_no
            )));
        }
        Ok(self.summaries.read().get(sample_no).cloned())
    }

    fn upsert(&self, summary: &SampleSummary) -> LiveResult<SummaryRecord> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LiveError::PersistenceFailure(format!(
                "summary write rejected for sample {}",
                summary.sample_no
            )));
        }
        let now = Utc::now();
        let mut summaries = self.summaries.write();
        let record = match summaries.get(&summary.sample_no) {
            Some(existing) => SummaryRecord {
                summary: summary.clone(),
                created_at: existing.created_at,
                updated_at: now,
            },
            None => SummaryRecord {
                summary: summary.clone(),
                created_at: now,
                updated_at: now,
            },
        };
        summaries.insert(summary.sample_no.clone(), record.clone());
        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    fn remove(&self, sample_no: &str) -> LiveResult<bool> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LiveError::PersistenceFailure(format!(
                "summary delete rejected for sample {}",
                sample_no
            )));
        }
        Ok(self.summaries.write().remove(sample_no).is_some())
    }

    fn summary_sample_ids(&self) -> LiveResult<Vec<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LiveError::PersistenceFailure(
                "summary listing rejected".to_string(),
            ));
        }
        Ok(self.summaries.read().keys().cloned().collect())
    }

    fn summary_count(&self) -> LiveResult<usize> {
        Ok(self.summaries.read().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use crate::model::RunStatus;

    #[test]
    fn completed_runs_skips_unfinished() {
        let mut pending = completed_run(2, "S1", 1, &[], &[]);
        pending.status = RunStatus::Pending;
        pending.completed_at = None;
        let store = MemoryStore::with_runs(vec![completed_run(1, "S1", 0, &[], &[]), pending]);

        let runs = store.completed_runs("S1").expect("read");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, 1);
        assert!(store.completed_runs("S404").expect("read").is_empty());

        let counts = store.run_status_counts().expect("counts");
        assert_eq!(counts.get("completed"), Some(&1));
        assert_eq!(counts.get("pending"), Some(&1));
    }

    #[test]
    fn delete_last_run_drops_sample() {
        let store = MemoryStore::with_runs(vec![completed_run(7, "S1", 0, &[], &[])]);
        assert_eq!(store.delete_run(7).map(|r| r.run_id), Some(7));
        assert!(store.delete_run(7).is_none());
        assert!(store.sample_ids().expect("ids").is_empty());
    }

    #[test]
    fn summaries_are_listed_and_removable() {
        let store = MemoryStore::new();
        let run = completed_run(1, "S1", 0, &[("positive", 1)], &[]);
        let summary = crate::aggregate::SummaryAggregator::summarize("S1", &[run])
            .expect("summary");
        store.upsert(&summary).expect("upsert");
        assert_eq!(store.summary_sample_ids().expect("ids"), vec!["S1".to_string()]);
        assert!(store.remove("S1").expect("remove"));
        assert!(!store.remove("S1").expect("remove again"));
        assert!(store.summary_sample_ids().expect("ids").is_empty());
    }

    #[test]
    fn upsert_keeps_created_at() {
        let store = MemoryStore::new();
        let run = completed_run(1, "S1", 0, &[("positive", 1)], &[]);
        let summary = crate::aggregate::SummaryAggregator::summarize("S1", &[run])
            .expect("summary");
        let first = store.upsert(&summary).expect("first upsert");
        let second = store.upsert(&summary).expect("second upsert");
        assert_eq!(first.created_at, second.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(store.upsert_count(), 2);
    }

    #[test]
    fn injected_failures_surface_as_persistence_errors() {
        let store = MemoryStore::new();
        store.set_fail_reads(true);
        let err = store.completed_runs("S1").expect_err("reads fail");
        assert_eq!(err.kind(), "persistence_failure");
        store.set_fail_reads(false);
        store.set_fail_writes(true);
        let run = completed_run(1, "S1", 0, &[], &[]);
        let summary = crate::aggregate::SummaryAggregator::summarize("S1", &[run])
            .expect("summary");
        assert!(store.upsert(&summary).is_err());
        assert_eq!(store.upsert_count(), 0);
    }
}
