//! Composition root.
//!
//! `LiveHub` builds every component from a `LiveConfig` and the two store
//! seams, and owns the background work: trigger workers plus the sweep, audit
//! and stats tasks. Dropping the hub stops all of it.

use crate::aggregate::SummaryAggregator;
use crate::audit::{AuditReport, ConsistencyValidator};
use crate::config::LiveConfig;
use crate::connections::{
    AttachOutcome, ConnectionId, ConnectionManager, ConnectionStats, DetachOutcome, Socket,
    SocketId, SweepReport,
};
use crate::coordinator::{RunEvent, TriggerPool, UpdateCoordinator, UpdateOutcome};
use crate::dispatch::{BroadcastDispatcher, PublishReport};
use crate::error::LiveResult;
use crate::notify::{Notification, SystemStats};
use crate::periodic::PeriodicTask;
use crate::protocol::{heartbeat_frame, ClientProtocol, ServerReply};
use crate::registry::SubscriptionRegistry;
use crate::store::{RunSource, SummaryStore};
use crate::topic::Topic;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub struct LiveHub {
    config: LiveConfig,
    runs: Arc<dyn RunSource>,
    summaries: Arc<dyn SummaryStore>,
    connections: Arc<ConnectionManager>,
    dispatcher: BroadcastDispatcher,
    protocol: ClientProtocol,
    coordinator: Arc<UpdateCoordinator>,
    validator: ConsistencyValidator,
    pool: Mutex<Option<TriggerPool>>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl LiveHub {
    pub fn new(
        config: LiveConfig,
        runs: Arc<dyn RunSource>,
        summaries: Arc<dyn SummaryStore>,
    ) -> LiveResult<Self> {
        config.validate()?;
        let registry = Arc::new(SubscriptionRegistry::new());
        let connections = Arc::new(ConnectionManager::new(registry, config.max_connections));
        let dispatcher = BroadcastDispatcher::new(connections.clone());
        let aggregator = SummaryAggregator::new(runs.clone());
        let coordinator = Arc::new(UpdateCoordinator::new(
            aggregator.clone(),
            summaries.clone(),
            dispatcher.clone(),
            config.failure_log_capacity,
        ));
        let validator = ConsistencyValidator::new(aggregator, runs.clone(), summaries.clone());
        Ok(Self {
            protocol: ClientProtocol::new(connections.clone()),
            config,
            runs,
            summaries,
            connections,
            dispatcher,
            coordinator,
            validator,
            pool: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn dispatcher(&self) -> &BroadcastDispatcher {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> &Arc<UpdateCoordinator> {
        &self.coordinator
    }

    pub fn validator(&self) -> &ConsistencyValidator {
        &self.validator
    }

    /// A brand-new connection is greeted on the socket that opened it.
    pub fn attach_socket(
        &self,
        connection: &ConnectionId,
        socket: Arc<dyn Socket>,
    ) -> LiveResult<AttachOutcome> {
        let socket_id = socket.id();
        let outcome = self.connections.attach_socket(connection, socket)?;
        if outcome == AttachOutcome::Created {
            self.protocol.welcome(connection, socket_id);
        }
        Ok(outcome)
    }

    pub fn detach_socket(&self, connection: &ConnectionId, socket_id: SocketId) -> DetachOutcome {
        self.connections.detach_socket(connection, socket_id)
    }

    pub fn subscribe(&self, topic: &str, connection: &ConnectionId) -> LiveResult<bool> {
        let topic: Topic = topic.parse()?;
        self.connections.subscribe_if_alive(&topic, connection)
    }

    pub fn unsubscribe(&self, topic: &str, connection: &ConnectionId) -> LiveResult<bool> {
        let topic: Topic = topic.parse()?;
        Ok(self.connections.registry().unsubscribe(&topic, connection))
    }

    pub fn publish(&self, topic: &str, notification: &Notification) -> LiveResult<PublishReport> {
        self.dispatcher.publish_to(topic, notification)
    }

    pub fn handle_inbound(
        &self,
        connection: &ConnectionId,
        socket_id: SocketId,
        bytes: &[u8],
    ) -> LiveResult<ServerReply> {
        self.protocol.handle_frame(connection, socket_id, bytes)
    }

    /// Queue on the worker pool when it runs, otherwise handle inline.
    pub fn submit(&self, event: RunEvent) -> LiveResult<Option<UpdateOutcome>> {
        if let Some(pool) = self.pool.lock().as_ref() {
            if pool.submit(event.clone()) {
                return Ok(None);
            }
        }
        self.coordinator.handle(event)
    }

    pub fn get_connection_stats(&self) -> ConnectionStats {
        self.connections.stats()
    }

    pub fn sweep_now(&self) -> SweepReport {
        let heartbeat = if self.config.heartbeat {
            match heartbeat_frame() {
                Ok(frame) => Some(frame),
                Err(err) => {
                    warn!(error = %err, "heartbeat frame not built, sweeping without it");
                    None
                }
            }
        } else {
            None
        };
        self.connections.sweep(heartbeat.as_deref())
    }

    /// Audit every sample. With `audit_repair` set, each inconsistent sample
    /// is recomputed through the coordinator afterwards, and an orphaned
    /// summary is removed from the store.
    pub fn audit_now(&self) -> LiveResult<AuditReport> {
        let report = self.validator.check_all()?;
        if self.config.audit_repair {
            for sample_no in &report.inconsistent {
                if report.orphaned.contains(sample_no) {
                    // No run left to rebuild from; the cached summary goes.
                    match self.summaries.remove(sample_no) {
                        Ok(_) => info!(sample_no = sample_no.as_str(), "removed orphaned summary"),
                        Err(err) => {
                            warn!(sample_no = sample_no.as_str(), error = %err, "repair failed")
                        }
                    }
                    continue;
                }
                match self.coordinator.on_sample_changed(sample_no, None, false) {
                    Ok(_) => info!(sample_no = sample_no.as_str(), "repaired drifted summary"),
                    Err(err) => {
                        warn!(sample_no = sample_no.as_str(), error = %err, "repair failed")
                    }
                }
            }
        }
        Ok(report)
    }

    pub fn system_stats(&self) -> LiveResult<SystemStats> {
        let connections = self.connections.stats();
        Ok(SystemStats {
            samples: self.runs.sample_ids()?.len(),
            summaries: self.summaries.summary_count()?,
            runs_by_status: self.runs.run_status_counts()?,
            connections: connections.connections,
            sockets: connections.sockets,
        })
    }

    pub fn publish_system_stats(&self) -> LiveResult<PublishReport> {
        let stats = self.system_stats()?;
        self.dispatcher
            .publish(&Topic::System, &Notification::system_stats(stats))
    }

    /// Start the trigger workers and the periodic tasks. Calling it again is
    /// a no-op.
    pub fn start_background(self: &Arc<Self>) {
        {
            let mut pool = self.pool.lock();
            if pool.is_some() {
                return;
            }
            *pool = Some(TriggerPool::start(
                self.coordinator.clone(),
                self.config.worker_threads,
            ));
        }

        let mut tasks = self.tasks.lock();
        tasks.extend(spawn_task(self, "sweep", self.config.sweep_interval(), |hub| {
            hub.sweep_now();
        }));
        tasks.extend(spawn_task(self, "audit", self.config.audit_interval(), |hub| {
            if let Err(err) = hub.audit_now() {
                warn!(error = %err, "scheduled audit failed");
            }
        }));
        tasks.extend(spawn_task(self, "stats", self.config.stats_interval(), |hub| {
            if !hub.dispatcher.has_subscribers(&Topic::System) {
                return;
            }
            if let Err(err) = hub.publish_system_stats() {
                warn!(error = %err, "system stats not published");
            }
        }));
        info!(
            workers = self.config.worker_threads,
            tasks = tasks.len(),
            "background work started"
        );
    }

    pub fn shutdown(&self) {
        let tasks: Vec<PeriodicTask> = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            debug!(task = task.name(), "stopping");
            task.stop();
        }
        if let Some(mut pool) = self.pool.lock().take() {
            pool.shutdown();
        }
        self.connections.close_all();
    }
}

impl Drop for LiveHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_task<F>(
    hub: &Arc<LiveHub>,
    name: &str,
    interval: std::time::Duration,
    tick: F,
) -> Option<PeriodicTask>
where
    F: Fn(&LiveHub) + Send + 'static,
{
    let hub: Weak<LiveHub> = Arc::downgrade(hub);
    PeriodicTask::spawn(name, interval, move || {
        if let Some(hub) = hub.upgrade() {
            tick(&hub);
        }
    })
}
