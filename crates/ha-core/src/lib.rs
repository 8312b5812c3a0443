//! ha-core: Quorum heartbeat failure detection for a clustered service.
//!
//! This crate provides:
//! - An addressed message envelope and the processor contract protocols share
//! - Keyed timeout engines driven by a logical clock or by real time
//! - The heartbeat protocol and its quorum-based failure detector
//! - A panic-isolating listener registry

pub mod cluster;
pub mod heartbeat;
pub mod instance_id;
pub mod listeners;
pub mod message;
pub mod processor;
pub mod timeouts;

pub use cluster::{ClusterConfiguration, ClusterView, SharedClusterConfiguration, COORDINATOR};
pub use heartbeat::{
    HeartbeatConfig, HeartbeatContext, HeartbeatListener, HeartbeatMachine, HeartbeatMessage,
    HeartbeatState, HeartbeatTimer,
};
pub use instance_id::{InstanceId, InstanceIdError};
pub use listeners::Listeners;
pub use message::{Message, MessageError, MessageType};
pub use processor::{MessageProcessor, MessageQueue, ProcessError};
pub use timeouts::{LogicalTimeouts, RealTimeTimeouts, TimeoutStrategy, Timeouts};
