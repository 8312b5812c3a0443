//! Suspicion bookkeeping and quorum-based failure decisions.
//!
//! Every instance reports the set of peers it currently suspects. Reports
//! replace the reporter's previous report wholesale. A peer is failed once
//! strictly more than half of the cluster's members suspect it:
//!
//! ```text
//! failed(n)  <=>  |{ r : n in suspicions[r] }| > members / 2
//! ```
//!
//! The failed set is updated incrementally as reports arrive and when the
//! membership changes. Each failed/alive transition is queued and handed to
//! listeners exactly once by [`PendingNotifications::deliver`], which callers
//! run after releasing any lock around the context.

use super::messages::{HeartbeatMessage, HeartbeatTimer};
use crate::cluster::{ClusterView, COORDINATOR};
use crate::listeners::Listeners;
use crate::message::Message;
use crate::timeouts::Timeouts;
use crate::InstanceId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Receives failed/alive transitions.
pub trait HeartbeatListener: Send + Sync {
    fn failed(&self, server: InstanceId);

    fn alive(&self, server: InstanceId);
}

/// A failed/alive change of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTransition {
    Failed(InstanceId),
    Alive(InstanceId),
}

/// Transitions taken out of a context, ready to be delivered.
#[must_use = "transitions are lost unless delivered"]
pub struct PendingNotifications {
    listeners: Arc<Listeners<dyn HeartbeatListener>>,
    transitions: Vec<HeartbeatTransition>,
}

impl PendingNotifications {
    pub fn transitions(&self) -> &[HeartbeatTransition] {
        &self.transitions
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Notify every listener of every transition, in the order they happened.
    pub fn deliver(self) {
        for transition in self.transitions {
            self.listeners.notify(|listener| match transition {
                HeartbeatTransition::Failed(server) => listener.failed(server),
                HeartbeatTransition::Alive(server) => listener.alive(server),
            });
        }
    }
}

/// Failure detector state of one instance.
pub struct HeartbeatContext {
    cluster: Arc<dyn ClusterView>,
    timeouts: Arc<dyn Timeouts<HeartbeatTimer, HeartbeatMessage>>,
    /// Reporter -> instances that reporter suspects
    node_suspicions: HashMap<InstanceId, BTreeSet<InstanceId>>,
    /// Instances currently failed by quorum
    failed: BTreeSet<InstanceId>,
    /// Membership the failed set was last derived against
    members: Vec<InstanceId>,
    /// Transitions not yet handed to listeners
    pending: Vec<HeartbeatTransition>,
    listeners: Arc<Listeners<dyn HeartbeatListener>>,
}

impl HeartbeatContext {
    pub fn new(
        cluster: Arc<dyn ClusterView>,
        timeouts: Arc<dyn Timeouts<HeartbeatTimer, HeartbeatMessage>>,
    ) -> Self {
        let members = cluster.members();
        Self {
            cluster,
            timeouts,
            node_suspicions: HashMap::new(),
            failed: BTreeSet::new(),
            members,
            pending: Vec::new(),
            listeners: Arc::new(Listeners::new()),
        }
    }

    pub fn me(&self) -> InstanceId {
        self.cluster.me()
    }

    pub fn is_me(&self, id: InstanceId) -> bool {
        self.cluster.is_me(id)
    }

    pub fn is_member(&self, id: InstanceId) -> bool {
        self.cluster.is_member(id)
    }

    pub fn add_heartbeat_listener(&self, listener: Arc<dyn HeartbeatListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_heartbeat_listener(&self, listener: &Arc<dyn HeartbeatListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Take the queued transitions for delivery outside any lock.
    pub fn take_notifications(&mut self) -> PendingNotifications {
        PendingNotifications {
            listeners: Arc::clone(&self.listeners),
            transitions: std::mem::take(&mut self.pending),
        }
    }

    /// Deliver queued transitions right away.
    ///
    /// Only for a context nobody else can reach while listeners run.
    pub fn notify_listeners(&mut self) {
        self.take_notifications().deliver();
    }

    /// The cluster view gained or lost members: re-derive the failed set
    /// against the new quorum.
    pub fn members_changed(&mut self) {
        self.members = self.cluster.members();
        self.reconcile();
    }

    /// Call [`HeartbeatContext::members_changed`] if the cluster view differs
    /// from the membership the failed set was derived against.
    ///
    /// Returns whether it did.
    pub fn check_membership(&mut self) -> bool {
        let members = self.cluster.members();
        if members == self.members {
            return false;
        }
        debug!(observer = %self.me(), ?members, "Membership changed");
        self.members_changed();
        true
    }

    /// Called when this instance (re)joins: forget which peers were failed.
    pub fn started(&mut self) {
        self.failed.clear();
    }

    /// A heartbeat arrived from `node`.
    ///
    /// Returns whether this instance had been suspecting `node`.
    pub fn alive(&mut self, node: InstanceId) -> bool {
        let me = self.me();
        let was_suspected = self
            .node_suspicions
            .get_mut(&me)
            .is_some_and(|suspects| suspects.remove(&node));

        if was_suspected {
            debug!(observer = %me, %node, "No longer suspecting");
        }
        self.clear_failed_if_below_quorum(node);
        was_suspected
    }

    /// This instance stopped hearing from `node`.
    ///
    /// Self-suspicion is ignored.
    pub fn suspect(&mut self, node: InstanceId) {
        let me = self.me();
        if node == me {
            debug!(observer = %me, "Ignoring suspicion of self");
            return;
        }

        if self.suspicions_for_mut(me).insert(node) {
            debug!(observer = %me, %node, "Suspecting");
        }
        self.mark_failed_if_quorum(node);
    }

    /// `from` reported its complete set of suspects.
    ///
    /// The report replaces whatever `from` reported before. Suspicions of
    /// this instance are dropped: it is evidently running.
    pub fn suspicions(&mut self, from: InstanceId, mut suspects: BTreeSet<InstanceId>) {
        let me = self.me();
        suspects.remove(&me);

        debug!(observer = %me, reporter = %from, ?suspects, "Suspicion report");
        let previous = std::mem::replace(self.suspicions_for_mut(from), suspects.clone());

        for node in &suspects {
            self.mark_failed_if_quorum(*node);
        }
        for node in previous.difference(&suspects) {
            self.clear_failed_if_below_quorum(*node);
        }
    }

    /// Whether strictly more than half of the members suspect `node`.
    pub fn is_failed(&self, node: InstanceId) -> bool {
        let reporters = self
            .node_suspicions
            .values()
            .filter(|suspects| suspects.contains(&node))
            .count();
        reporters > self.cluster.members().len() / 2
    }

    pub fn failed(&self) -> &BTreeSet<InstanceId> {
        &self.failed
    }

    /// Members, in canonical order, that are not failed.
    pub fn alive_members(&self) -> Vec<InstanceId> {
        self.cluster
            .members()
            .into_iter()
            .filter(|member| !self.is_failed(*member))
            .collect()
    }

    /// What `reporter` currently suspects.
    pub fn suspicions_for(&self, reporter: InstanceId) -> BTreeSet<InstanceId> {
        self.node_suspicions
            .get(&reporter)
            .cloned()
            .unwrap_or_default()
    }

    /// Reporters currently suspecting `node`.
    pub fn suspicions_of(&self, node: InstanceId) -> BTreeSet<InstanceId> {
        self.node_suspicions
            .iter()
            .filter(|(_, suspects)| suspects.contains(&node))
            .map(|(reporter, _)| *reporter)
            .collect()
    }

    /// Whether this instance should take over as coordinator.
    ///
    /// True when the coordinator is failed and no member ahead of this one in
    /// the canonical order also suspects it, i.e. this instance is next in
    /// line.
    pub fn should_promote_me_to_coordinator(&self) -> bool {
        let me = self.me();
        let members = self.cluster.members();
        let Some(coordinator) = self
            .cluster
            .elected(COORDINATOR)
            .or_else(|| members.first().copied())
        else {
            return false;
        };

        if coordinator == me || !self.is_failed(coordinator) {
            return false;
        }

        for member in members {
            if member == me {
                return true;
            }
            if member == coordinator {
                continue;
            }
            if self
                .node_suspicions
                .get(&member)
                .is_some_and(|suspects| suspects.contains(&coordinator))
            {
                return false;
            }
        }
        false
    }

    /// `node` left the cluster for good: forget everything about it.
    pub fn server_left_cluster(&mut self, node: InstanceId) {
        debug!(observer = %self.me(), %node, "Instance left cluster");
        self.failed.remove(&node);
        self.node_suspicions.remove(&node);
        for suspects in self.node_suspicions.values_mut() {
            suspects.remove(&node);
        }
        self.timeouts.cancel_timeout(&HeartbeatTimer::receive(node));
        self.timeouts.cancel_timeout(&HeartbeatTimer::send(node));
        self.members_changed();
    }

    /// Arm the receive timeout and send timer for every peer.
    pub fn start_heartbeat_timers(&self, cause: &Message<HeartbeatMessage>) {
        for peer in self.peers() {
            self.timeouts.set_timeout(
                HeartbeatTimer::receive(peer),
                Message::timeout(HeartbeatMessage::TimedOut { server: peer }, cause),
            );
            self.timeouts.set_timeout(
                HeartbeatTimer::send(peer),
                Message::timeout(HeartbeatMessage::SendHeartbeat { server: peer }, cause),
            );
        }
    }

    /// Cancel both timers of every peer.
    pub fn stop_heartbeat_timers(&self) {
        for peer in self.peers() {
            self.timeouts.cancel_timeout(&HeartbeatTimer::receive(peer));
            self.timeouts.cancel_timeout(&HeartbeatTimer::send(peer));
        }
    }

    pub fn set_timeout(&self, key: HeartbeatTimer, message: Message<HeartbeatMessage>) {
        self.timeouts.set_timeout(key, message);
    }

    pub fn cancel_timeout(&self, key: &HeartbeatTimer) {
        self.timeouts.cancel_timeout(key);
    }

    fn peers(&self) -> Vec<InstanceId> {
        let me = self.me();
        self.cluster
            .members()
            .into_iter()
            .filter(|member| *member != me)
            .collect()
    }

    fn suspicions_for_mut(&mut self, reporter: InstanceId) -> &mut BTreeSet<InstanceId> {
        self.node_suspicions.entry(reporter).or_default()
    }

    fn mark_failed_if_quorum(&mut self, node: InstanceId) {
        if self.is_failed(node) && self.failed.insert(node) {
            info!(observer = %self.me(), %node, "Instance failed");
            self.pending.push(HeartbeatTransition::Failed(node));
        }
    }

    fn clear_failed_if_below_quorum(&mut self, node: InstanceId) {
        if self.failed.contains(&node) && !self.is_failed(node) {
            self.failed.remove(&node);
            info!(observer = %self.me(), %node, "Instance alive");
            self.pending.push(HeartbeatTransition::Alive(node));
        }
    }

    /// Re-derive the failed set after the membership or reports changed
    /// shape.
    fn reconcile(&mut self) {
        let failed: Vec<InstanceId> = self.failed.iter().copied().collect();
        for node in failed {
            self.clear_failed_if_below_quorum(node);
        }
        let suspected: BTreeSet<InstanceId> =
            self.node_suspicions.values().flatten().copied().collect();
        for node in suspected {
            self.mark_failed_if_quorum(node);
        }
    }
}
