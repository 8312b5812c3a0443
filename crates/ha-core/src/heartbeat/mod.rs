//! Heartbeat failure detection.
//!
//! Every instance periodically sends `i_am_alive` to each peer and expects
//! one back before a receive timeout fires:
//! 1. A receive timeout makes this instance suspect the peer
//! 2. The instance sends its full suspicion set to every live peer
//! 3. A peer suspected by more than half the members is failed
//! 4. A heartbeat from a suspected peer withdraws the suspicion
//!
//! [`HeartbeatContext`] holds the suspicion state, [`HeartbeatMachine`]
//! maps incoming messages and fired timers onto it.

pub mod config;
pub mod context;
pub mod machine;
pub mod messages;

pub use config::HeartbeatConfig;
pub use context::{HeartbeatContext, HeartbeatListener, HeartbeatTransition, PendingNotifications};
pub use machine::{HeartbeatMachine, HeartbeatState};
pub use messages::{HeartbeatMessage, HeartbeatTimer, HeartbeatTimerKind};
