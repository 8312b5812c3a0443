//! ha-sim library: deterministic cluster simulation for the heartbeat
//! failure detector.
//!
//! Exposes the harness so integration tests can drive scenarios directly.

pub mod config;
pub mod network;
pub mod node;
pub mod simulation;

pub use config::{NodeAction, ScheduledEvent, SimulationConfig};
pub use network::{NetworkStats, SimNetwork};
pub use node::SimNode;
pub use simulation::{Simulation, SimulationReport, Transition, TransitionKind};
