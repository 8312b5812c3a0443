//! Deterministic cluster simulation on a shared logical clock.
//!
//! Each step advances every running node's clock by `step_ms`, applies the
//! events scheduled up to that time, then shuttles messages between nodes
//! until nobody has anything left to handle.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ha_core::{HeartbeatConfig, HeartbeatListener, InstanceId};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{NodeAction, ScheduledEvent, SimulationConfig};
use crate::network::{NetworkStats, SimNetwork};
use crate::node::SimNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Failed,
    Alive,
}

/// A failure detector notification seen by one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub time_ms: u64,
    pub observer: InstanceId,
    pub subject: InstanceId,
    pub kind: TransitionKind,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub duration_ms: u64,
    pub members: Vec<InstanceId>,
    /// Every failed/alive notification, in the order they happened
    pub transitions: Vec<Transition>,
    /// Failed set of each instance still running at the end
    pub failed: BTreeMap<InstanceId, BTreeSet<InstanceId>>,
    pub network: NetworkStats,
}

impl SimulationReport {
    /// How many times `observer` reported `subject` as `kind`.
    pub fn count(&self, observer: InstanceId, subject: InstanceId, kind: TransitionKind) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.observer == observer && t.subject == subject && t.kind == kind)
            .count()
    }

    pub fn transitions_seen_by(&self, observer: InstanceId) -> Vec<Transition> {
        self.transitions
            .iter()
            .copied()
            .filter(|t| t.observer == observer)
            .collect()
    }
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Simulated {}ms with {} member(s)",
            self.duration_ms,
            self.members.len()
        )?;
        for t in &self.transitions {
            let kind = match t.kind {
                TransitionKind::Failed => "failed",
                TransitionKind::Alive => "alive",
            };
            writeln!(f, "  {:>8}ms  {} sees {} {}", t.time_ms, t.observer, t.subject, kind)?;
        }
        for (observer, failed) in &self.failed {
            let failed: Vec<String> = failed.iter().map(ToString::to_string).collect();
            writeln!(f, "  final: {} failed = [{}]", observer, failed.join(", "))?;
        }
        write!(
            f,
            "  messages: {} sent, {} delivered, {} lost, {} unreachable",
            self.network.sent, self.network.delivered, self.network.lost, self.network.unreachable
        )
    }
}

/// Records notifications into the shared transition log.
struct TransitionRecorder {
    observer: InstanceId,
    clock: Arc<AtomicU64>,
    log: Arc<Mutex<Vec<Transition>>>,
}

impl TransitionRecorder {
    fn record(&self, subject: InstanceId, kind: TransitionKind) {
        let transition = Transition {
            time_ms: self.clock.load(Ordering::SeqCst),
            observer: self.observer,
            subject,
            kind,
        };
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(transition);
    }
}

impl HeartbeatListener for TransitionRecorder {
    fn failed(&self, server: InstanceId) {
        self.record(server, TransitionKind::Failed);
    }

    fn alive(&self, server: InstanceId) {
        self.record(server, TransitionKind::Alive);
    }
}

/// A simulated cluster.
pub struct Simulation {
    config: SimulationConfig,
    heartbeat: HeartbeatConfig,
    members: Vec<InstanceId>,
    nodes: BTreeMap<InstanceId, SimNode>,
    network: SimNetwork,
    events: Vec<ScheduledEvent>,
    next_event: usize,
    clock: Arc<AtomicU64>,
    log: Arc<Mutex<Vec<Transition>>>,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;

        let mut events = config.events.clone();
        events.sort_by_key(|event| event.at_ms);

        let mut simulation = Self {
            heartbeat: config.heartbeat_config(),
            members: config.member_ids(),
            nodes: BTreeMap::new(),
            network: SimNetwork::new(config.seed, config.drop_probability),
            events,
            next_event: 0,
            clock: Arc::new(AtomicU64::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
            config,
        };
        for id in simulation.members.clone() {
            simulation.start_node(id);
        }
        Ok(simulation)
    }

    /// Current simulated time.
    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn node(&self, id: InstanceId) -> Option<&SimNode> {
        self.nodes.get(&id)
    }

    /// Run until the configured duration has elapsed.
    pub fn run(mut self) -> SimulationReport {
        info!(
            members = self.members.len(),
            duration_ms = self.config.duration_ms,
            "Starting simulation"
        );
        while self.now() < self.config.duration_ms {
            self.step();
        }
        self.report()
    }

    /// Advance the clock by one step.
    pub fn step(&mut self) {
        let now = self.now() + self.config.step_ms;
        self.clock.store(now, Ordering::SeqCst);

        while let Some(event) = self.events.get(self.next_event).copied() {
            if event.at_ms > now {
                break;
            }
            self.next_event += 1;
            self.apply(event);
        }

        for node in self.nodes.values() {
            node.tick(now);
        }
        self.settle();
    }

    pub fn report(&self) -> SimulationReport {
        SimulationReport {
            duration_ms: self.now(),
            members: self.members.clone(),
            transitions: self
                .log
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            failed: self
                .nodes
                .iter()
                .map(|(id, node)| (*id, node.failed()))
                .collect(),
            network: self.network.stats(),
        }
    }

    fn start_node(&mut self, id: InstanceId) {
        let recorder = Arc::new(TransitionRecorder {
            observer: id,
            clock: self.clock.clone(),
            log: self.log.clone(),
        });
        let node = SimNode::new(id, &self.members, &self.heartbeat, recorder, self.now());
        node.join();
        self.nodes.insert(id, node);
    }

    fn apply(&mut self, event: ScheduledEvent) {
        let id = InstanceId::new(event.instance);
        info!(at_ms = event.at_ms, instance = %id, action = ?event.action, "Applying event");
        match event.action {
            NodeAction::Crash => {
                if self.nodes.remove(&id).is_none() {
                    debug!(instance = %id, "Already stopped");
                }
            }
            NodeAction::Restart => {
                if self.nodes.contains_key(&id) {
                    debug!(instance = %id, "Already running");
                } else if self.members.contains(&id) {
                    self.start_node(id);
                }
            }
            NodeAction::Leave => {
                if let Some(node) = self.nodes.get(&id) {
                    node.leave();
                }
                self.members.retain(|member| *member != id);
                for node in self.nodes.values() {
                    node.forget_member(id);
                }
            }
        }
    }

    /// Deliver messages until every node is idle.
    fn settle(&mut self) {
        loop {
            let mut handled = 0;
            for node in self.nodes.values() {
                handled += node.pump();
            }

            let running: BTreeSet<InstanceId> = self.nodes.keys().copied().collect();
            let mut routed = 0;
            for node in self.nodes.values() {
                for message in node.take_outgoing() {
                    for (to, message) in self.network.route(node.id(), message, &running) {
                        if let Some(target) = self.nodes.get(&to) {
                            target.receive(message);
                            routed += 1;
                        }
                    }
                }
            }

            if handled == 0 && routed == 0 {
                break;
            }
        }
    }
}
