//! Client-facing frames.
//!
//! Inbound messages are JSON objects tagged by `type`. Every inbound message
//! gets exactly one reply on the socket it arrived on; failures are answered
//! with an `error` frame and leave subscriptions untouched.

use crate::connections::{ConnectionId, ConnectionInfo, ConnectionManager, SocketId};
use crate::error::{LiveError, LiveResult};
use crate::topic::Topic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const MESSAGE_TYPES: &[&str] = &["subscribe", "unsubscribe", "ping", "connection_info"];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    /// `timestamp` is echoed back untouched.
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },
    ConnectionInfo,
}

impl ClientMessage {
    /// Unknown or missing `type` is `UnknownChannel`. A subscribe or
    /// unsubscribe without a usable `topic` is `UnknownTopic`.
    pub fn decode(bytes: &[u8]) -> LiveResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| LiveError::UnknownChannel(format!("invalid json: {}", e)))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| LiveError::UnknownChannel("message has no type".to_string()))?
            .to_string();
        if !MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(LiveError::UnknownChannel(kind));
        }
        serde_json::from_value(value).map_err(|e| match kind.as_str() {
            "subscribe" | "unsubscribe" => LiveError::UnknownTopic(format!("{}: {}", kind, e)),
            _ => LiveError::UnknownChannel(format!("{}: {}", kind, e)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerReply {
    Welcome {
        connection_id: ConnectionId,
        server_time: DateTime<Utc>,
    },
    Subscribed {
        topic: Topic,
    },
    Unsubscribed {
        topic: Topic,
        was_subscribed: bool,
    },
    Pong {
        timestamp: Option<Value>,
        server_time: DateTime<Utc>,
    },
    ConnectionInfo(ConnectionInfo),
    Heartbeat {
        server_time: DateTime<Utc>,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl ServerReply {
    pub fn error(err: &LiveError) -> Self {
        ServerReply::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerReply::Welcome { .. } => "welcome",
            ServerReply::Subscribed { .. } => "subscribed",
            ServerReply::Unsubscribed { .. } => "unsubscribed",
            ServerReply::Pong { .. } => "pong",
            ServerReply::ConnectionInfo(_) => "connection_info",
            ServerReply::Heartbeat { .. } => "heartbeat",
            ServerReply::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> LiveResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            LiveError::ComputationFailure(format!("encode {}: {}", self.type_name(), e))
        })
    }
}

pub fn heartbeat_frame() -> LiveResult<Vec<u8>> {
    ServerReply::Heartbeat {
        server_time: Utc::now(),
    }
    .encode()
}

#[derive(Clone)]
pub struct ClientProtocol {
    connections: Arc<ConnectionManager>,
}

impl ClientProtocol {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    pub fn welcome(&self, connection: &ConnectionId, socket_id: SocketId) -> bool {
        self.reply(
            connection,
            socket_id,
            &ServerReply::Welcome {
                connection_id: connection.clone(),
                server_time: Utc::now(),
            },
        )
    }

    /// Decode, apply and answer one inbound frame. The returned error has
    /// already been sent to the client as an `error` frame.
    pub fn handle_frame(
        &self,
        connection: &ConnectionId,
        socket_id: SocketId,
        bytes: &[u8],
    ) -> LiveResult<ServerReply> {
        let outcome = ClientMessage::decode(bytes).and_then(|message| self.apply(connection, message));
        match &outcome {
            Ok(reply) => {
                self.reply(connection, socket_id, reply);
            }
            Err(err) => {
                debug!(%connection, error = %err, "rejected client message");
                self.reply(connection, socket_id, &ServerReply::error(err));
            }
        }
        outcome
    }

    pub fn apply(&self, connection: &ConnectionId, message: ClientMessage) -> LiveResult<ServerReply> {
        match message {
            ClientMessage::Subscribe { topic } => {
                let topic: Topic = topic.parse()?;
                self.connections.subscribe_if_alive(&topic, connection)?;
                Ok(ServerReply::Subscribed { topic })
            }
            ClientMessage::Unsubscribe { topic } => {
                let topic: Topic = topic.parse()?;
                let was_subscribed = self.connections.registry().unsubscribe(&topic, connection);
                Ok(ServerReply::Unsubscribed {
                    topic,
                    was_subscribed,
                })
            }
            ClientMessage::Ping { timestamp } => Ok(ServerReply::Pong {
                timestamp,
                server_time: Utc::now(),
            }),
            ClientMessage::ConnectionInfo => self
                .connections
                .connection_info()
                .into_iter()
                .find(|info| &info.connection_id == connection)
                .map(ServerReply::ConnectionInfo)
                .ok_or_else(|| LiveError::NotFound(format!("connection {}", connection))),
        }
    }

    fn reply(&self, connection: &ConnectionId, socket_id: SocketId, reply: &ServerReply) -> bool {
        match reply.encode() {
            Ok(frame) => self.connections.send_to_socket(connection, socket_id, &frame),
            Err(err) => {
                warn!(%connection, error = %err, "reply not encoded");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemorySocket;
    use crate::registry::SubscriptionRegistry;

    fn setup() -> (Arc<ConnectionManager>, ClientProtocol, Arc<MemorySocket>) {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(SubscriptionRegistry::new()),
            0,
        ));
        let socket = MemorySocket::new(1);
        manager
            .attach_socket(&ConnectionId::new("c1"), socket.clone())
            .expect("attach");
        let protocol = ClientProtocol::new(manager.clone());
        (manager, protocol, socket)
    }

    #[test]
    fn decode_accepts_known_messages() {
        assert_eq!(
            ClientMessage::decode(br#"{"type":"subscribe","topic":"sample:S1"}"#).expect("decode"),
            ClientMessage::Subscribe {
                topic: "sample:S1".to_string()
            }
        );
        assert_eq!(
            ClientMessage::decode(br#"{"type":"ping"}"#).expect("decode"),
            ClientMessage::Ping { timestamp: None }
        );
        assert_eq!(
            ClientMessage::decode(br#"{"type":"connection_info"}"#).expect("decode"),
            ClientMessage::ConnectionInfo
        );
    }

    #[test]
    fn decode_classifies_bad_input() {
        let err = ClientMessage::decode(br#"{"type":"teleport"}"#).expect_err("unknown type");
        assert_eq!(err, LiveError::UnknownChannel("teleport".to_string()));
        let err = ClientMessage::decode(b"not json").expect_err("garbage");
        assert_eq!(err.kind(), "unknown_channel");
        let err = ClientMessage::decode(br#"{"topic":"system"}"#).expect_err("untyped");
        assert_eq!(err.kind(), "unknown_channel");
        let err = ClientMessage::decode(br#"{"type":"subscribe"}"#).expect_err("no topic");
        assert_eq!(err.kind(), "unknown_topic");
    }

    #[test]
    fn subscribe_and_unsubscribe_round_trip() {
        let (manager, protocol, socket) = setup();
        let c1 = ConnectionId::new("c1");
        protocol
            .handle_frame(&c1, 1, br#"{"type":"subscribe","topic":"run:42"}"#)
            .expect("subscribe");
        assert!(manager.registry().subscribers_of(&Topic::Run(42)).contains(&c1));
        let replies = socket.frames_of_type("subscribed");
        assert_eq!(replies[0]["topic"], "run:42");

        let reply = protocol
            .handle_frame(&c1, 1, br#"{"type":"unsubscribe","topic":"run:42"}"#)
            .expect("unsubscribe");
        assert_eq!(
            reply,
            ServerReply::Unsubscribed {
                topic: Topic::Run(42),
                was_subscribed: true
            }
        );
        assert!(!manager.registry().has_subscribers(&Topic::Run(42)));
    }

    #[test]
    fn bad_topic_gets_error_reply_and_changes_nothing() {
        let (manager, protocol, socket) = setup();
        let c1 = ConnectionId::new("c1");
        let err = protocol
            .handle_frame(&c1, 1, br#"{"type":"subscribe","topic":"plate:7"}"#)
            .expect_err("bad topic");
        assert_eq!(err.kind(), "unknown_topic");
        assert_eq!(manager.registry().subscription_count(), 0);
        let errors = socket.frames_of_type("error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["kind"], "unknown_topic");
    }

    #[test]
    fn bad_unsubscribe_topic_keeps_existing_subscriptions() {
        let (manager, protocol, socket) = setup();
        let c1 = ConnectionId::new("c1");
        protocol
            .handle_frame(&c1, 1, br#"{"type":"subscribe","topic":"sample:S1"}"#)
            .expect("subscribe");
        assert_eq!(manager.registry().subscription_count(), 1);

        for frame in [
            &br#"{"type":"unsubscribe","topic":"plate:7"}"#[..],
            &br#"{"type":"unsubscribe"}"#[..],
        ] {
            let err = protocol
                .handle_frame(&c1, 1, frame)
                .expect_err("bad unsubscribe topic");
            assert_eq!(err.kind(), "unknown_topic");
        }
        assert_eq!(manager.registry().subscription_count(), 1);
        let errors = socket.frames_of_type("error");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e["kind"] == "unknown_topic"));
    }

    #[test]
    fn ping_echoes_client_timestamp() {
        let (_, protocol, socket) = setup();
        let c1 = ConnectionId::new("c1");
        protocol
            .handle_frame(&c1, 1, br#"{"type":"ping","timestamp":1712345}"#)
            .expect("ping");
        let pongs = socket.frames_of_type("pong");
        assert_eq!(pongs[0]["timestamp"], 1712345);
        assert!(pongs[0]["server_time"].is_string());
    }

    #[test]
    fn connection_info_lists_own_topics() {
        let (_, protocol, socket) = setup();
        let c1 = ConnectionId::new("c1");
        protocol
            .handle_frame(&c1, 1, br#"{"type":"subscribe","topic":"system"}"#)
            .expect("subscribe");
        protocol
            .handle_frame(&c1, 1, br#"{"type":"connection_info"}"#)
            .expect("info");
        let info = socket.frames_of_type("connection_info");
        assert_eq!(info[0]["connection_id"], "c1");
        assert_eq!(info[0]["sockets"], 1);
        assert_eq!(info[0]["topics"][0], "system");
    }

    #[test]
    fn messages_from_closed_connections_are_refused() {
        let (manager, protocol, _) = setup();
        manager.detach_socket(&ConnectionId::new("c1"), 1);
        let err = protocol
            .apply(
                &ConnectionId::new("c1"),
                ClientMessage::Subscribe {
                    topic: "system".to_string(),
                },
            )
            .expect_err("connection gone");
        assert_eq!(err.kind(), "not_found");
        assert_eq!(manager.registry().subscription_count(), 0);
    }

    #[test]
    fn welcome_and_heartbeat_frames() {
        let (_, protocol, socket) = setup();
        assert!(protocol.welcome(&ConnectionId::new("c1"), 1));
        assert_eq!(socket.frames_of_type("welcome")[0]["connection_id"], "c1");
        let beat: Value =
            serde_json::from_slice(&heartbeat_frame().expect("frame")).expect("json");
        assert_eq!(beat["type"], "heartbeat");
    }
}
