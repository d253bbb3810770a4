//! Live result aggregation and notification for plate prediction runs.
//!
//! Completed runs trigger a per-sample summary recompute, which is persisted
//! and pushed to every connection subscribed to the sample's topic.

pub mod aggregate;
pub mod audit;
pub mod config;
pub mod connections;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod model;
pub mod notify;
pub mod periodic;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod topic;

pub use aggregate::SummaryAggregator;
pub use audit::{AuditReport, ConsistencyReport, ConsistencyValidator, FieldDrift};
pub use config::LiveConfig;
pub use connections::{
    AttachOutcome, ConnectionId, ConnectionInfo, ConnectionManager, ConnectionStats,
    DetachOutcome, MemorySocket, Socket, SocketId, SweepReport,
};
pub use coordinator::{
    CoordinatorStats, FailureEntry, RunEvent, TriggerPool, UpdateCoordinator, UpdateOutcome,
};
pub use dispatch::{BroadcastDispatcher, PublishReport};
pub use error::{LiveError, LiveResult};
pub use hub::LiveHub;
pub use model::{RunId, RunRecord, RunStatus, SampleSummary, SummaryRecord, WellPrediction};
pub use notify::{Notification, NotificationEvent};
pub use protocol::{ClientMessage, ClientProtocol, ServerReply};
pub use registry::SubscriptionRegistry;
pub use store::{MemoryStore, RunSource, SummaryStore};
pub use topic::{Topic, TopicKind};
