//! Heartbeat protocol message kinds and timer keys.

use crate::message::MessageType;
use crate::InstanceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Messages of the heartbeat protocol.
///
/// Network messages are `IAmAlive` and `Suspicions`; `TimedOut`,
/// `SendHeartbeat` and `ResetSendHeartbeat` are delivered internally by
/// timers; `Join`/`Leave` come from the membership layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeartbeatMessage {
    /// This instance joined the cluster and starts exchanging heartbeats.
    Join,
    /// This instance left the cluster.
    Leave,
    /// Heartbeat from `server`.
    IAmAlive { server: InstanceId },
    /// No heartbeat arrived from `server` in time.
    TimedOut { server: InstanceId },
    /// Time to send a heartbeat to `server`.
    SendHeartbeat { server: InstanceId },
    /// Restart the send timer for `server`.
    ResetSendHeartbeat { server: InstanceId },
    /// The sender's complete current set of suspected instances.
    Suspicions { suspects: BTreeSet<InstanceId> },
}

impl MessageType for HeartbeatMessage {
    fn name(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::IAmAlive { .. } => "i_am_alive",
            Self::TimedOut { .. } => "timed_out",
            Self::SendHeartbeat { .. } => "send_heartbeat",
            Self::ResetSendHeartbeat { .. } => "reset_send_heartbeat",
            Self::Suspicions { .. } => "suspicions",
        }
    }
}

/// Which of the two per-peer timers a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeartbeatTimerKind {
    /// Expect a heartbeat from the peer before this fires.
    ReceiveTimeout,
    /// Send the next heartbeat to the peer when this fires.
    SendHeartbeat,
}

/// Timer key: one timer per (kind, peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeartbeatTimer {
    pub kind: HeartbeatTimerKind,
    pub peer: InstanceId,
}

impl HeartbeatTimer {
    pub fn receive(peer: InstanceId) -> Self {
        Self {
            kind: HeartbeatTimerKind::ReceiveTimeout,
            peer,
        }
    }

    pub fn send(peer: InstanceId) -> Self {
        Self {
            kind: HeartbeatTimerKind::SendHeartbeat,
            peer,
        }
    }
}
