//! Simulation configuration loading

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use ha_core::{HeartbeatConfig, InstanceId};
use serde::{Deserialize, Serialize};

/// Configuration of one simulated cluster run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Instance ids of the cluster members (default: 1, 2, 3)
    #[serde(default = "default_members")]
    pub members: Vec<u32>,

    /// Interval between heartbeats to each peer
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a peer is suspected
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,

    /// Clock resolution of the simulation
    #[serde(default = "default_step")]
    pub step_ms: u64,

    /// Total simulated time
    #[serde(default = "default_duration")]
    pub duration_ms: u64,

    /// Seed for message loss
    #[serde(default)]
    pub seed: u64,

    /// Chance that any single network message is lost (0.0 - 1.0)
    #[serde(default)]
    pub drop_probability: f64,

    /// Crashes, restarts and departures, in any order
    #[serde(default)]
    pub events: Vec<ScheduledEvent>,
}

/// Something that happens to an instance at a fixed simulated time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub at_ms: u64,
    pub instance: u32,
    pub action: NodeAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    /// Stop processing; every message to the instance is lost
    Crash,
    /// Come back with fresh state and rejoin
    Restart,
    /// Leave the cluster for good
    Leave,
}

impl NodeAction {
    fn as_str(&self) -> &'static str {
        match self {
            NodeAction::Crash => "crash",
            NodeAction::Restart => "restart",
            NodeAction::Leave => "leave",
        }
    }
}

impl ScheduledEvent {
    pub fn new(at_ms: u64, instance: u32, action: NodeAction) -> Self {
        Self {
            at_ms,
            instance,
            action,
        }
    }
}

/// Parses the CLI form `INSTANCE@MS`, e.g. `3@10000`, as a crash.
impl FromStr for ScheduledEvent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((instance, at)) = s.split_once('@') else {
            bail!("Expected INSTANCE@MS, got {:?}", s);
        };
        let instance = instance
            .trim()
            .parse()
            .with_context(|| format!("Invalid instance in {:?}", s))?;
        let at_ms = at
            .trim()
            .parse()
            .with_context(|| format!("Invalid time in {:?}", s))?;
        Ok(Self::new(at_ms, instance, NodeAction::Crash))
    }
}

fn default_members() -> Vec<u32> {
    vec![1, 2, 3]
}

fn default_heartbeat_interval() -> u64 {
    5_000
}

fn default_heartbeat_timeout() -> u64 {
    11_000
}

fn default_step() -> u64 {
    100
}

fn default_duration() -> u64 {
    60_000
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            members: default_members(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            step_ms: default_step(),
            duration_ms: default_duration(),
            seed: 0,
            drop_probability: 0.0,
            events: Vec::new(),
        }
    }
}

impl SimulationConfig {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {:?}", path))?;
        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Parse and validate a YAML configuration.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: SimulationConfig =
            serde_yaml::from_str(content).context("Failed to parse simulation config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.members.is_empty(), "At least one member is required");
        ensure!(self.step_ms > 0, "step_ms must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.drop_probability),
            "drop_probability must be between 0 and 1, got {}",
            self.drop_probability
        );
        for event in &self.events {
            ensure!(
                self.members.contains(&event.instance),
                "Event {} at {}ms names unknown instance {}",
                event.action.as_str(),
                event.at_ms,
                event.instance
            );
        }
        Ok(())
    }

    pub fn member_ids(&self) -> Vec<InstanceId> {
        self.members.iter().copied().map(InstanceId::new).collect()
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
        }
    }
}
