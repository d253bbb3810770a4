//! Live connection table.
//!
//! A connection id owns one or more transport sockets. The table is the only
//! owner of sockets; the registry refers to connections by id. A connection
//! whose last socket goes away is destroyed together with its subscriptions.

use crate::error::{LiveError, LiveResult};
use crate::registry::SubscriptionRegistry;
use crate::topic::Topic;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type SocketId = u64;

pub trait Socket: Send + Sync {
    fn id(&self) -> SocketId;

    /// Write one frame. An error marks the socket dead.
    fn send(&self, bytes: &[u8]) -> LiveResult<()>;

    fn is_closed(&self) -> bool;

    fn close(&self) {}
}

struct ConnectionRecord {
    sockets: Vec<Arc<dyn Socket>>,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Created,
    Attached { sockets: usize },
    AlreadyAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    Detached { remaining: usize },
    ConnectionClosed,
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        self.delivered > 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub closed_sockets: usize,
    pub dead_connections: usize,
    pub orphan_subscriptions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub connections: usize,
    pub sockets: usize,
    pub subscriptions_by_topic_kind: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub sockets: usize,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub topics: Vec<String>,
}

pub struct ConnectionManager {
    table: Mutex<BTreeMap<ConnectionId, ConnectionRecord>>,
    registry: Arc<SubscriptionRegistry>,
    max_connections: usize,
}

impl ConnectionManager {
    /// `max_connections == 0` means unlimited.
    pub fn new(registry: Arc<SubscriptionRegistry>, max_connections: usize) -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
            registry,
            max_connections,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn attach_socket(
        &self,
        connection: &ConnectionId,
        socket: Arc<dyn Socket>,
    ) -> LiveResult<AttachOutcome> {
        let mut table = self.table.lock();
        let now = Utc::now();
        if let Some(record) = table.get_mut(connection) {
            if record.sockets.iter().any(|s| s.id() == socket.id()) {
                return Ok(AttachOutcome::AlreadyAttached);
            }
            record.sockets.push(socket);
            record.last_activity = now;
            debug!(%connection, sockets = record.sockets.len(), "socket attached");
            return Ok(AttachOutcome::Attached {
                sockets: record.sockets.len(),
            });
        }
        if self.max_connections > 0 && table.len() >= self.max_connections {
            warn!(%connection, limit = self.max_connections, "connection limit reached");
            return Err(LiveError::ConnectionLimit(table.len()));
        }
        table.insert(
            connection.clone(),
            ConnectionRecord {
                sockets: vec![socket],
                connected_at: now,
                last_activity: now,
            },
        );
        info!(%connection, connections = table.len(), "connection opened");
        Ok(AttachOutcome::Created)
    }

    pub fn detach_socket(&self, connection: &ConnectionId, socket_id: SocketId) -> DetachOutcome {
        let mut table = self.table.lock();
        let Some(record) = table.get_mut(connection) else {
            return DetachOutcome::Unknown;
        };
        let before = record.sockets.len();
        record.sockets.retain(|s| s.id() != socket_id);
        if record.sockets.len() == before {
            return DetachOutcome::Unknown;
        }
        if !record.sockets.is_empty() {
            debug!(%connection, remaining = record.sockets.len(), "socket detached");
            return DetachOutcome::Detached {
                remaining: record.sockets.len(),
            };
        }
        table.remove(connection);
        // Table lock is held so a concurrent subscribe for this id cannot land
        // between the two removals.
        let dropped = self.registry.remove_connection(connection);
        info!(
            %connection,
            subscriptions = dropped,
            connections = table.len(),
            "connection closed"
        );
        DetachOutcome::ConnectionClosed
    }

    /// Subscribe only while the connection is in the table.
    pub fn subscribe_if_alive(&self, topic: &Topic, connection: &ConnectionId) -> LiveResult<bool> {
        let table = self.table.lock();
        if !table.contains_key(connection) {
            return Err(LiveError::NotFound(format!("connection {}", connection)));
        }
        Ok(self.registry.subscribe(topic, connection))
    }

    pub fn is_alive(&self, connection: &ConnectionId) -> bool {
        self.table.lock().contains_key(connection)
    }

    pub fn send(&self, connection: &ConnectionId, bytes: &[u8]) -> DeliveryResult {
        let sockets: Vec<Arc<dyn Socket>> = match self.table.lock().get(connection) {
            Some(record) => record.sockets.clone(),
            None => return DeliveryResult::default(),
        };

        let mut result = DeliveryResult::default();
        let mut dead = Vec::new();
        for socket in &sockets {
            if socket.is_closed() {
                dead.push(socket.id());
                continue;
            }
            match socket.send(bytes) {
                Ok(()) => result.delivered += 1,
                Err(err) => {
                    debug!(%connection, socket = socket.id(), error = %err, "socket write failed");
                    dead.push(socket.id());
                }
            }
        }
        result.failed = dead.len();

        if result.delivered > 0 {
            if let Some(record) = self.table.lock().get_mut(connection) {
                record.last_activity = Utc::now();
            }
        }
        for socket_id in dead {
            self.detach_socket(connection, socket_id);
        }
        result
    }

    pub fn send_to_socket(&self, connection: &ConnectionId, socket_id: SocketId, bytes: &[u8]) -> bool {
        let socket = self
            .table
            .lock()
            .get(connection)
            .and_then(|record| record.sockets.iter().find(|s| s.id() == socket_id).cloned());
        let Some(socket) = socket else {
            return false;
        };
        if !socket.is_closed() && socket.send(bytes).is_ok() {
            if let Some(record) = self.table.lock().get_mut(connection) {
                record.last_activity = Utc::now();
            }
            return true;
        }
        self.detach_socket(connection, socket_id);
        false
    }

    /// Drop closed sockets, optionally probing the rest with `heartbeat`, then
    /// purge registry entries whose connection no longer exists.
    pub fn sweep(&self, heartbeat: Option<&[u8]>) -> SweepReport {
        let snapshot: Vec<(ConnectionId, Vec<Arc<dyn Socket>>)> = self
            .table
            .lock()
            .iter()
            .map(|(id, record)| (id.clone(), record.sockets.clone()))
            .collect();

        let mut report = SweepReport::default();
        for (connection, sockets) in snapshot {
            for socket in sockets {
                let alive = !socket.is_closed()
                    && heartbeat.map_or(true, |frame| socket.send(frame).is_ok());
                if alive {
                    continue;
                }
                report.closed_sockets += 1;
                if self.detach_socket(&connection, socket.id()) == DetachOutcome::ConnectionClosed {
                    report.dead_connections += 1;
                }
            }
        }

        let table = self.table.lock();
        for connection in self.registry.connection_ids() {
            if !table.contains_key(&connection) {
                report.orphan_subscriptions += self.registry.remove_connection(&connection);
            }
        }
        drop(table);

        if report != SweepReport::default() {
            info!(
                closed_sockets = report.closed_sockets,
                dead_connections = report.dead_connections,
                orphan_subscriptions = report.orphan_subscriptions,
                "connection sweep pruned state"
            );
        }
        report
    }

    pub fn stats(&self) -> ConnectionStats {
        let table = self.table.lock();
        ConnectionStats {
            connections: table.len(),
            sockets: table.values().map(|r| r.sockets.len()).sum(),
            subscriptions_by_topic_kind: self.registry.counts_by_kind(),
        }
    }

    pub fn connection_info(&self) -> Vec<ConnectionInfo> {
        let table = self.table.lock();
        table
            .iter()
            .map(|(id, record)| ConnectionInfo {
                connection_id: id.clone(),
                sockets: record.sockets.len(),
                connected_at: record.connected_at,
                last_activity: record.last_activity,
                topics: self
                    .registry
                    .topics_of(id)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            })
            .collect()
    }

    pub fn close_all(&self) -> usize {
        let mut table = self.table.lock();
        let closed = table.len();
        for (connection, record) in std::mem::take(&mut *table) {
            for socket in record.sockets {
                socket.close();
            }
            self.registry.remove_connection(&connection);
        }
        if closed > 0 {
            info!(connections = closed, "closed all connections");
        }
        closed
    }
}

/// Socket that records frames in memory. Used by the CLI replay and tests.
pub struct MemorySocket {
    id: SocketId,
    frames: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    rejecting: AtomicBool,
}

impl MemorySocket {
    pub fn new(id: SocketId) -> Arc<Self> {
        Arc::new(Self {
            id,
            frames: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            rejecting: AtomicBool::new(false),
        })
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    pub fn frame_values(&self) -> Vec<serde_json::Value> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| serde_json::from_slice(f).ok())
            .collect()
    }

    pub fn frames_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.frame_values()
            .into_iter()
            .filter(|v| v.get("type").and_then(|t| t.as_str()) == Some(kind))
            .collect()
    }

    /// Mark closed without telling anyone, like a network half-close.
    pub fn drop_silently(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }
}

impl Socket for MemorySocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn send(&self, bytes: &[u8]) -> LiveResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LiveError::DeliveryFailure(format!("socket {} closed", self.id)));
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(LiveError::DeliveryFailure(format!(
                "socket {} rejected write",
                self.id
            )));
        }
        self.frames.lock().push(bytes.to_vec());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
