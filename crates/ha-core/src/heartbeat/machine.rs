//! Heartbeat protocol state machine.
//!
//! Dispatches [`HeartbeatMessage`]s (from the network or from fired timers)
//! onto a [`HeartbeatContext`] and emits outgoing heartbeats and suspicion
//! reports through the outgoing processor.
//!
//! The outgoing processor must not call back into the machine synchronously;
//! hand messages off to a queue or transport instead. Listeners are notified
//! after the machine lock is released, so they may call back in.

use super::context::HeartbeatContext;
use super::messages::{HeartbeatMessage, HeartbeatTimer};
use crate::message::{headers, Message, MessageType};
use crate::processor::{self, MessageProcessor};
use crate::InstanceId;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Protocol state of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Not participating; waiting for `join`.
    Start,
    /// Exchanging heartbeats with every peer.
    Heartbeat,
}

struct MachineState {
    state: HeartbeatState,
    context: HeartbeatContext,
    next_conversation: u64,
}

/// Heartbeat state machine of one instance.
pub struct HeartbeatMachine {
    inner: Mutex<MachineState>,
    outgoing: Arc<dyn MessageProcessor<HeartbeatMessage>>,
}

impl HeartbeatMachine {
    pub fn new(
        context: HeartbeatContext,
        outgoing: Arc<dyn MessageProcessor<HeartbeatMessage>>,
    ) -> Self {
        Self {
            inner: Mutex::new(MachineState {
                state: HeartbeatState::Start,
                context,
                next_conversation: 0,
            }),
            outgoing,
        }
    }

    pub fn state(&self) -> HeartbeatState {
        self.lock().state
    }

    /// Run `f` against the failure detector state.
    ///
    /// Transitions caused by `f` reach listeners once `f` has returned.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut HeartbeatContext) -> R) -> R {
        let (result, notifications) = {
            let mut inner = self.lock();
            let result = f(&mut inner.context);
            (result, inner.context.take_notifications())
        };
        notifications.deliver();
        result
    }

    /// The cluster view gained or lost members.
    pub fn members_changed(&self) {
        self.with_context(HeartbeatContext::members_changed);
    }

    /// Handle one message.
    pub fn handle(&self, message: Message<HeartbeatMessage>) {
        let notifications = {
            let mut inner = self.lock();
            inner.context.check_membership();

            let current = inner.state;
            let next = match current {
                HeartbeatState::Start => inner.on_start(message),
                HeartbeatState::Heartbeat => inner.on_heartbeat(message, self.outgoing.as_ref()),
            };
            if next != current {
                debug!(me = %inner.context.me(), from = ?current, to = ?next, "Heartbeat state changed");
                inner.state = next;
            }
            inner.context.take_notifications()
        };
        notifications.deliver();
    }

    fn lock(&self) -> MutexGuard<'_, MachineState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MessageProcessor<HeartbeatMessage> for HeartbeatMachine {
    fn process(&self, message: Message<HeartbeatMessage>) -> processor::Result<()> {
        self.handle(message);
        Ok(())
    }
}

impl MachineState {
    fn on_start(&mut self, message: Message<HeartbeatMessage>) -> HeartbeatState {
        match message.message_type() {
            HeartbeatMessage::Join => {
                self.context.started();
                self.context.start_heartbeat_timers(&message);
                HeartbeatState::Heartbeat
            }
            other => {
                debug!(me = %self.context.me(), kind = other.name(), "Ignoring message before join");
                HeartbeatState::Start
            }
        }
    }

    fn on_heartbeat(
        &mut self,
        message: Message<HeartbeatMessage>,
        outgoing: &dyn MessageProcessor<HeartbeatMessage>,
    ) -> HeartbeatState {
        match message.message_type() {
            HeartbeatMessage::IAmAlive { server } => {
                let server = *server;
                if self.context.is_me(server) {
                    return HeartbeatState::Heartbeat;
                }
                if !self.context.is_member(server) {
                    debug!(me = %self.context.me(), %server, "Heartbeat from non-member");
                    return HeartbeatState::Heartbeat;
                }
                if self.context.alive(server) {
                    self.send_suspicions(outgoing);
                }
                self.context.set_timeout(
                    HeartbeatTimer::receive(server),
                    Message::timeout(HeartbeatMessage::TimedOut { server }, &message),
                );
            }

            HeartbeatMessage::TimedOut { server } => {
                let server = *server;
                if self.context.is_member(server) {
                    self.context.suspect(server);
                    self.context.set_timeout(
                        HeartbeatTimer::receive(server),
                        Message::timeout(HeartbeatMessage::TimedOut { server }, &message),
                    );
                    self.send_suspicions(outgoing);
                } else {
                    self.context.server_left_cluster(server);
                }
            }

            HeartbeatMessage::SendHeartbeat { server } => {
                let server = *server;
                if !self.context.is_me(server) && self.context.is_member(server) {
                    let me = self.context.me();
                    self.send(outgoing, Message::to(HeartbeatMessage::IAmAlive { server: me }, server));
                    self.context.set_timeout(
                        HeartbeatTimer::send(server),
                        Message::timeout(HeartbeatMessage::SendHeartbeat { server }, &message),
                    );
                }
            }

            HeartbeatMessage::ResetSendHeartbeat { server } => {
                let server = *server;
                if !self.context.is_me(server) {
                    let key = HeartbeatTimer::send(server);
                    self.context.cancel_timeout(&key);
                    self.context.set_timeout(
                        key,
                        Message::timeout(HeartbeatMessage::SendHeartbeat { server }, &message),
                    );
                }
            }

            HeartbeatMessage::Suspicions { suspects } => match sender(&message) {
                Some(from) => self.context.suspicions(from, suspects.clone()),
                None => warn!(me = %self.context.me(), "Dropping suspicions without a valid sender"),
            },

            HeartbeatMessage::Leave => {
                self.context.stop_heartbeat_timers();
                return HeartbeatState::Start;
            }

            HeartbeatMessage::Join => {
                debug!(me = %self.context.me(), "Already joined");
            }
        }
        HeartbeatState::Heartbeat
    }

    /// Send this instance's suspicion set to every live peer.
    fn send_suspicions(&mut self, outgoing: &dyn MessageProcessor<HeartbeatMessage>) {
        let me = self.context.me();
        let suspects = self.context.suspicions_for(me);
        for peer in self.context.alive_members() {
            if peer != me {
                let report = HeartbeatMessage::Suspicions {
                    suspects: suspects.clone(),
                };
                self.send(outgoing, Message::to(report, peer));
            }
        }
    }

    fn send(
        &mut self,
        outgoing: &dyn MessageProcessor<HeartbeatMessage>,
        message: Message<HeartbeatMessage>,
    ) {
        let me = self.context.me().to_string();
        let mut message = message.set_header(headers::FROM, me.clone());
        if !message.has_header(headers::CONVERSATION_ID) {
            self.next_conversation += 1;
            message = message
                .set_header(headers::CONVERSATION_ID, format!("{}/{}", me, self.next_conversation))
                .set_header(headers::CREATED_BY, me);
        }
        if let Err(e) = outgoing.process(message) {
            warn!("Failed to send heartbeat message: {}", e);
        }
    }
}

/// Sender of a network message, from its `from` header.
fn sender(message: &Message<HeartbeatMessage>) -> Option<InstanceId> {
    match message.header(headers::FROM) {
        Ok(from) => match from.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Invalid sender header: {}", e);
                None
            }
        },
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}
