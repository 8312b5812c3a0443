//! MessageProcessor trait: the single entry point every protocol layer
//! exposes, and the contract used to hand messages back out.
//!
//! Implementations:
//! - Protocol state machines (e.g. [`crate::heartbeat::HeartbeatMachine`])
//! - [`MessageQueue`]: FIFO buffer used as an outgoing sink or to re-inject
//!   fired timeouts into a dispatch loop

use crate::message::Message;
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Processor closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Consumer of messages.
pub trait MessageProcessor<T>: Send + Sync {
    fn process(&self, message: Message<T>) -> Result<()>;
}

/// Processor that buffers messages in arrival order.
pub struct MessageQueue<T> {
    queue: Mutex<VecDeque<Message<T>>>,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message<T>) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(message);
    }

    /// Take the oldest buffered message.
    pub fn pop(&self) -> Option<Message<T>> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    /// Take every buffered message, oldest first.
    pub fn drain(&self) -> Vec<Message<T>> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> MessageProcessor<T> for MessageQueue<T> {
    fn process(&self, message: Message<T>) -> Result<()> {
        self.push(message);
        Ok(())
    }
}
