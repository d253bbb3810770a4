//! Per-sample single-flight recomputation.
//!
//! `in_flight` maps a sample number to the state of the one recompute allowed
//! to run for it. A trigger that finds an entry only sets `rerun` and returns;
//! the running caller loops once more before clearing the entry. Bursts
//! therefore collapse into at most one follow-up pass, and different samples
//! never wait on each other.

use crate::aggregate::SummaryAggregator;
use crate::dispatch::BroadcastDispatcher;
use crate::error::{LiveError, LiveResult};
use crate::model::{RunId, SampleSummary};
use crate::notify::Notification;
use crate::store::SummaryStore;
use crate::topic::Topic;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Completed { sample_no: String, run_id: RunId },
    Deleted { sample_no: String, run_id: RunId },
    Failed { sample_no: String, run_id: RunId, error: String },
}

impl RunEvent {
    pub fn sample_no(&self) -> &str {
        match self {
            RunEvent::Completed { sample_no, .. }
            | RunEvent::Deleted { sample_no, .. }
            | RunEvent::Failed { sample_no, .. } => sample_no,
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::Completed { run_id, .. }
            | RunEvent::Deleted { run_id, .. }
            | RunEvent::Failed { run_id, .. } => *run_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// This caller ran the recompute; `passes` > 1 when triggers were folded in.
    Applied { summary: SampleSummary, passes: u32 },
    Coalesced,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEntry {
    pub sample_no: String,
    pub run_id: Option<RunId>,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

pub struct FailureLog {
    entries: Mutex<VecDeque<FailureEntry>>,
    capacity: usize,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    fn record(&self, sample_no: &str, run_id: Option<RunId>, err: &LiveError) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_back();
        }
        entries.push_front(FailureEntry {
            sample_no: sample_no.to_string(),
            run_id,
            kind: err.kind().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        });
    }

    pub fn recent(&self, limit: usize) -> Vec<FailureEntry> {
        self.entries.lock().iter().take(limit).cloned().collect()
    }

    pub fn for_sample(&self, sample_no: &str) -> Vec<FailureEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.sample_no == sample_no)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[derive(Default)]
struct Flight {
    rerun: bool,
    completed_runs: BTreeSet<RunId>,
    last_trigger: Option<RunId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub recomputes: u64,
    pub coalesced: u64,
    pub failures: u64,
    pub in_flight: usize,
}

pub struct UpdateCoordinator {
    aggregator: SummaryAggregator,
    summaries: Arc<dyn SummaryStore>,
    dispatcher: BroadcastDispatcher,
    in_flight: Mutex<HashMap<String, Flight>>,
    failures: FailureLog,
    recomputes: AtomicU64,
    coalesced: AtomicU64,
    failed: AtomicU64,
}

/// Clears the in-flight entry if the owning pass unwinds.
struct FlightGuard<'a> {
    coordinator: &'a UpdateCoordinator,
    sample_no: &'a str,
    done: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let dropped = self.coordinator.in_flight.lock().remove(self.sample_no);
            if dropped.map_or(false, |f| f.rerun) {
                warn!(sample_no = self.sample_no, "recompute aborted with a rerun pending");
            }
        }
    }
}

impl UpdateCoordinator {
    pub fn new(
        aggregator: SummaryAggregator,
        summaries: Arc<dyn SummaryStore>,
        dispatcher: BroadcastDispatcher,
        failure_log_capacity: usize,
    ) -> Self {
        Self {
            aggregator,
            summaries,
            dispatcher,
            in_flight: Mutex::new(HashMap::new()),
            failures: FailureLog::new(failure_log_capacity),
            recomputes: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn handle(&self, event: RunEvent) -> LiveResult<Option<UpdateOutcome>> {
        match event {
            RunEvent::Completed { sample_no, run_id } => self
                .on_sample_changed(&sample_no, Some(run_id), true)
                .map(Some),
            RunEvent::Deleted { sample_no, run_id } => self
                .on_sample_changed(&sample_no, Some(run_id), false)
                .map(Some),
            RunEvent::Failed {
                sample_no,
                run_id,
                error,
            } => {
                self.on_run_failed(&sample_no, run_id, &error)?;
                Ok(None)
            }
        }
    }

    /// Recompute, persist and announce the summary of `sample_no`.
    ///
    /// `completed` marks `trigger` as a finished run, which additionally gets a
    /// `run_completed` notice on its own topic once the summary is stored.
    /// A failed pass leaves the stored summary untouched and is not retried.
    pub fn on_sample_changed(
        &self,
        sample_no: &str,
        trigger: Option<RunId>,
        completed: bool,
    ) -> LiveResult<UpdateOutcome> {
        {
            let mut flights = self.in_flight.lock();
            if let Some(flight) = flights.get_mut(sample_no) {
                flight.rerun = true;
                flight.last_trigger = trigger.or(flight.last_trigger);
                if let (true, Some(run_id)) = (completed, trigger) {
                    flight.completed_runs.insert(run_id);
                }
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(sample_no, ?trigger, "trigger coalesced into running recompute");
                return Ok(UpdateOutcome::Coalesced);
            }
            let mut flight = Flight {
                last_trigger: trigger,
                ..Flight::default()
            };
            if let (true, Some(run_id)) = (completed, trigger) {
                flight.completed_runs.insert(run_id);
            }
            flights.insert(sample_no.to_string(), flight);
        }

        let mut guard = FlightGuard {
            coordinator: self,
            sample_no,
            done: false,
        };
        let mut passes = 0u32;
        let mut last_trigger = None;
        loop {
            let completed_runs = {
                let mut flights = self.in_flight.lock();
                match flights.get_mut(sample_no) {
                    Some(flight) => {
                        flight.rerun = false;
                        last_trigger = flight.last_trigger.take().or(last_trigger);
                        std::mem::take(&mut flight.completed_runs)
                    }
                    None => BTreeSet::new(),
                }
            };
            passes += 1;
            let result = self.run_pass(sample_no, &completed_runs, last_trigger);

            let mut flights = self.in_flight.lock();
            if let Some(flight) = flights.get_mut(sample_no).filter(|f| f.rerun) {
                // Runs whose summary never landed are announced by the follow-up.
                if result.is_err() {
                    flight.completed_runs.extend(completed_runs);
                }
                debug!(sample_no, passes, "running coalesced follow-up pass");
                continue;
            }
            flights.remove(sample_no);
            guard.done = true;
            return result.map(|summary| UpdateOutcome::Applied { summary, passes });
        }
    }

    fn run_pass(
        &self,
        sample_no: &str,
        completed_runs: &BTreeSet<RunId>,
        trigger: Option<RunId>,
    ) -> LiveResult<SampleSummary> {
        self.recomputes.fetch_add(1, Ordering::Relaxed);
        let summary = self
            .aggregator
            .recompute(sample_no)
            .and_then(|summary| {
                self.summaries.upsert(&summary)?;
                Ok(summary)
            })
            .map_err(|err| {
                self.report_failure(sample_no, trigger, &err);
                err
            })?;
        info!(
            sample_no,
            runs = summary.run_count,
            last_run_id = summary.last_run_id,
            "summary updated"
        );

        let sample_topic = Topic::Sample(sample_no.to_string());
        self.announce(
            &sample_topic,
            Notification::sample_updated(summary.clone(), trigger),
        );
        for run_id in completed_runs {
            let run_topic = Topic::Run(*run_id);
            if self.dispatcher.has_subscribers(&run_topic) {
                self.announce(
                    &run_topic,
                    Notification::run_completed(*run_id, sample_no, summary.run_count),
                );
            }
        }
        Ok(summary)
    }

    /// Announce a failed run on its own topic and on its sample's topic. The
    /// stored summary is left alone.
    pub fn on_run_failed(&self, sample_no: &str, run_id: RunId, error: &str) -> LiveResult<()> {
        warn!(sample_no, run_id, error, "run failed");
        let note = Notification::run_failed(run_id, sample_no, error);
        self.announce(&Topic::Run(run_id), note.clone());
        self.announce(&Topic::Sample(sample_no.to_string()), note);
        Ok(())
    }

    fn announce(&self, topic: &Topic, note: Notification) {
        if let Err(err) = self.dispatcher.publish(topic, &note) {
            error!(%topic, kind = note.type_name(), error = %err, "notification not published");
        }
    }

    fn report_failure(&self, sample_no: &str, run_id: Option<RunId>, err: &LiveError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.failures.record(sample_no, run_id, err);
        match err {
            LiveError::NotFound(_) => warn!(sample_no, ?run_id, error = %err, "nothing to summarize"),
            _ => error!(sample_no, ?run_id, error = %err, "summary update failed, keeping previous"),
        }
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            recomputes: self.recomputes.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failures: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
        }
    }
}

pub struct TriggerPool {
    sender: Option<mpsc::Sender<RunEvent>>,
    workers: Vec<JoinHandle<()>>,
}

impl TriggerPool {
    pub fn start(coordinator: Arc<UpdateCoordinator>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<RunEvent>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..workers.max(1))
            .map(|index| {
                let coordinator = coordinator.clone();
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("plate-trigger-{}", index))
                    .spawn(move || loop {
                        let next = receiver.lock().recv();
                        let Ok(event) = next else {
                            break;
                        };
                        let sample_no = event.sample_no().to_string();
                        if let Err(err) = coordinator.handle(event) {
                            debug!(sample_no, error = %err, "trigger finished with error");
                        }
                    })
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    error!(error = %err, "failed to spawn trigger worker");
                    None
                }
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn submit(&self, event: RunEvent) -> bool {
        match &self.sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("trigger worker panicked");
            }
        }
    }
}

impl Drop for TriggerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
