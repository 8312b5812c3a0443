//! One simulated cluster instance.
//!
//! Fired timers and network input share the node's inbound queue, so
//! everything the machine handles goes through [`SimNode::pump`].

use std::collections::BTreeSet;
use std::sync::Arc;

use ha_core::{
    ClusterConfiguration, HeartbeatConfig, HeartbeatContext, HeartbeatListener, HeartbeatMachine,
    HeartbeatMessage, HeartbeatState, HeartbeatTimer, InstanceId, LogicalTimeouts, Message,
    MessageQueue, SharedClusterConfiguration, Timeouts,
};

pub struct SimNode {
    id: InstanceId,
    cluster: Arc<SharedClusterConfiguration>,
    timeouts: Arc<LogicalTimeouts<HeartbeatTimer, HeartbeatMessage>>,
    machine: HeartbeatMachine,
    inbound: Arc<MessageQueue<HeartbeatMessage>>,
    outgoing: Arc<MessageQueue<HeartbeatMessage>>,
}

impl SimNode {
    /// Create a node whose clock starts at `now`.
    pub fn new(
        id: InstanceId,
        members: &[InstanceId],
        config: &HeartbeatConfig,
        listener: Arc<dyn HeartbeatListener>,
        now: u64,
    ) -> Self {
        let cluster = Arc::new(SharedClusterConfiguration::new(ClusterConfiguration::new(
            id,
            members.iter().copied(),
        )));
        let timeouts: Arc<LogicalTimeouts<HeartbeatTimer, HeartbeatMessage>> =
            Arc::new(LogicalTimeouts::new(Arc::new(config.timeout_strategy())));
        timeouts.tick(now);

        let inbound = Arc::new(MessageQueue::new());
        timeouts.register_processor(inbound.clone());

        let context = HeartbeatContext::new(cluster.clone(), timeouts.clone());
        context.add_heartbeat_listener(listener);

        let outgoing = Arc::new(MessageQueue::new());
        let machine = HeartbeatMachine::new(context, outgoing.clone());

        Self {
            id,
            cluster,
            timeouts,
            machine,
            inbound,
            outgoing,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn state(&self) -> HeartbeatState {
        self.machine.state()
    }

    pub fn join(&self) {
        self.machine.handle(Message::internal(HeartbeatMessage::Join));
    }

    pub fn leave(&self) {
        self.machine.handle(Message::internal(HeartbeatMessage::Leave));
    }

    /// Drop `member` from this node's view of the cluster and re-derive
    /// failures against the smaller quorum.
    pub fn forget_member(&self, member: InstanceId) -> bool {
        let removed = self.cluster.update(|cluster| cluster.leave(member));
        if removed {
            self.machine
                .with_context(|context| context.server_left_cluster(member));
        }
        removed
    }

    /// Advance the clock; fired timers queue up for [`SimNode::pump`].
    pub fn tick(&self, now: u64) {
        self.timeouts.tick(now);
    }

    /// Queue a message arriving from the network.
    pub fn receive(&self, message: Message<HeartbeatMessage>) {
        self.inbound.push(message);
    }

    /// Handle every queued message. Returns how many were handled.
    pub fn pump(&self) -> usize {
        let mut handled = 0;
        while let Some(message) = self.inbound.pop() {
            self.machine.handle(message);
            handled += 1;
        }
        handled
    }

    pub fn take_outgoing(&self) -> Vec<Message<HeartbeatMessage>> {
        self.outgoing.drain()
    }

    pub fn failed(&self) -> BTreeSet<InstanceId> {
        self.machine.with_context(|context| context.failed().clone())
    }

    pub fn suspects(&self) -> BTreeSet<InstanceId> {
        self.machine
            .with_context(|context| context.suspicions_for(context.me()))
    }

    pub fn pending_timers(&self) -> usize {
        self.timeouts.pending_count()
    }
}
