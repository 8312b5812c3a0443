//! Timeout strategies: how long a timer armed for a given message waits.
//!
//! Strategies also observe ticks, triggers and cancellations so that adaptive
//! policies (or test instrumentation) can track what the engine does.

use crate::message::{Message, MessageType};
use std::collections::HashMap;
use std::time::Duration;

/// Policy computing the duration of a timeout.
pub trait TimeoutStrategy<T>: Send + Sync {
    /// Duration before the timer armed with `message` fires.
    fn timeout_for(&self, message: &Message<T>) -> Duration;

    /// A timer fired and `message` is about to be delivered.
    fn timeout_triggered(&self, _message: &Message<T>) {}

    /// A pending timer was cancelled before firing.
    fn timeout_cancelled(&self, _message: &Message<T>) {}

    /// The logical clock moved to `now_ms`.
    fn tick(&self, _now_ms: u64) {}
}

/// Same duration for every message.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeoutStrategy {
    timeout: Duration,
}

impl FixedTimeoutStrategy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<T> TimeoutStrategy<T> for FixedTimeoutStrategy {
    fn timeout_for(&self, _message: &Message<T>) -> Duration {
        self.timeout
    }
}

/// Per message-kind durations with a fallback.
///
/// Kinds are matched by [`MessageType::name`].
#[derive(Debug, Clone)]
pub struct MessageTimeoutStrategy {
    default: Duration,
    timeouts: HashMap<&'static str, Duration>,
}

impl MessageTimeoutStrategy {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            timeouts: HashMap::new(),
        }
    }

    /// Use `timeout` for messages whose kind is named `kind`.
    pub fn timeout(mut self, kind: &'static str, timeout: Duration) -> Self {
        self.timeouts.insert(kind, timeout);
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default
    }
}

impl<T: MessageType> TimeoutStrategy<T> for MessageTimeoutStrategy {
    fn timeout_for(&self, message: &Message<T>) -> Duration {
        self.timeouts
            .get(message.message_type().name())
            .copied()
            .unwrap_or(self.default)
    }
}
