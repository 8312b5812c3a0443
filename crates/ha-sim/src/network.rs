//! Simulated network: routes heartbeat envelopes between nodes by their
//! `to` header, with seeded message loss.

use std::collections::BTreeSet;

use ha_core::message::BROADCAST;
use ha_core::{HeartbeatMessage, InstanceId, Message};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{trace, warn};

/// Message counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    /// Messages handed to the network
    pub sent: u64,
    /// Messages that reached a running recipient
    pub delivered: u64,
    /// Messages lost at random
    pub lost: u64,
    /// Messages addressed to an instance that is not running
    pub unreachable: u64,
}

/// Deterministic network between simulated nodes.
pub struct SimNetwork {
    rng: StdRng,
    drop_probability: f64,
    stats: NetworkStats,
}

impl SimNetwork {
    pub fn new(seed: u64, drop_probability: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            drop_probability,
            stats: NetworkStats::default(),
        }
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    /// Resolve the recipients of `message` sent by `from`.
    ///
    /// - internal messages go back to the sender
    /// - broadcasts go to every other running instance
    /// - directed messages go to their recipient if it is running
    ///
    /// Each copy that leaves the sender may be lost.
    pub fn route(
        &mut self,
        from: InstanceId,
        message: Message<HeartbeatMessage>,
        running: &BTreeSet<InstanceId>,
    ) -> Vec<(InstanceId, Message<HeartbeatMessage>)> {
        let targets: Vec<InstanceId> = match message.recipient() {
            None => return vec![(from, message)],
            Some(BROADCAST) => running.iter().copied().filter(|id| *id != from).collect(),
            Some(to) => match to.parse::<InstanceId>() {
                Ok(to) => vec![to],
                Err(e) => {
                    warn!(%from, "Dropping message with bad recipient: {}", e);
                    return Vec::new();
                }
            },
        };

        let mut deliveries = Vec::with_capacity(targets.len());
        for to in targets {
            self.stats.sent += 1;
            if !running.contains(&to) {
                trace!(%from, %to, "Recipient not running");
                self.stats.unreachable += 1;
                continue;
            }
            if self.should_drop() {
                trace!(%from, %to, "Message lost");
                self.stats.lost += 1;
                continue;
            }
            self.stats.delivered += 1;
            deliveries.push((to, message.clone()));
        }
        deliveries
    }

    fn should_drop(&mut self) -> bool {
        self.drop_probability > 0.0 && self.rng.random::<f64>() < self.drop_probability
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> InstanceId {
        InstanceId::new(n)
    }

    fn running(ids: &[u32]) -> BTreeSet<InstanceId> {
        ids.iter().copied().map(InstanceId::new).collect()
    }

    fn join() -> HeartbeatMessage {
        HeartbeatMessage::Join
    }

    #[test]
    fn test_directed_message_reaches_recipient() {
        let mut network = SimNetwork::new(0, 0.0);
        let out = network.route(id(1), Message::to(join(), id(2)), &running(&[1, 2, 3]));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, id(2));
        assert_eq!(network.stats().delivered, 1);
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let mut network = SimNetwork::new(0, 0.0);
        let out = network.route(id(1), Message::broadcast(join()), &running(&[1, 2, 3]));
        let targets: Vec<_> = out.iter().map(|(to, _)| *to).collect();
        assert_eq!(targets, vec![id(2), id(3)]);
    }

    #[test]
    fn test_internal_returns_to_sender() {
        let mut network = SimNetwork::new(0, 0.0);
        let out = network.route(id(2), Message::internal(join()), &running(&[1, 2]));
        assert_eq!(out[0].0, id(2));
        assert_eq!(network.stats().sent, 0);
    }

    #[test]
    fn test_stopped_recipient_is_unreachable() {
        let mut network = SimNetwork::new(0, 0.0);
        let out = network.route(id(1), Message::to(join(), id(3)), &running(&[1, 2]));
        assert!(out.is_empty());
        assert_eq!(network.stats().unreachable, 1);
    }

    #[test]
    fn test_total_loss() {
        let mut network = SimNetwork::new(0, 1.0);
        let out = network.route(id(1), Message::broadcast(join()), &running(&[1, 2, 3]));
        assert!(out.is_empty());
        assert_eq!(network.stats().lost, 2);
    }

    #[test]
    fn test_loss_is_deterministic_per_seed() {
        let outcome = |seed| {
            let mut network = SimNetwork::new(seed, 0.5);
            (0..64)
                .map(|_| {
                    !network
                        .route(id(1), Message::to(join(), id(2)), &running(&[1, 2]))
                        .is_empty()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(outcome(9), outcome(9));
    }
}
