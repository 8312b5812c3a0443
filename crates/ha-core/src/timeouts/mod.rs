//! Timer engine: maps keys to pending timeout messages.
//!
//! When a timer fires, its message is handed to the registered
//! [`MessageProcessor`], the same entry point network input arrives
//! through, so a fired timeout looks like any other message to the
//! protocol above.
//!
//! Two interchangeable engines implement [`Timeouts`]:
//! - [`LogicalTimeouts`]: time only moves when `tick` is called
//!   (deterministic simulation and tests)
//! - [`RealTimeTimeouts`]: wall-clock timers on a tokio runtime

pub mod logical;
pub mod realtime;
pub mod strategy;

pub use logical::LogicalTimeouts;
pub use realtime::RealTimeTimeouts;
pub use strategy::{FixedTimeoutStrategy, MessageTimeoutStrategy, TimeoutStrategy};

use crate::message::{Message, MessageType};
use crate::processor::MessageProcessor;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Contract shared by the timer engines.
///
/// At most one timer is pending per key. Setting a timer under a key that
/// already has one replaces it; the replaced message is never delivered.
pub trait Timeouts<K, T>: Send + Sync {
    /// Arm (or re-arm) the timer for `key`.
    fn set_timeout(&self, key: K, message: Message<T>);

    /// Remove the pending timer for `key` without delivering it.
    ///
    /// Unknown keys are ignored.
    fn cancel_timeout(&self, key: &K);

    /// Cancel every pending timer.
    fn cancel_all(&self);

    fn is_pending(&self, key: &K) -> bool;

    fn pending_count(&self) -> usize;
}

/// Registered receiver of fired timeouts.
pub(crate) struct Delivery<T> {
    processor: RwLock<Option<Arc<dyn MessageProcessor<T>>>>,
}

impl<T: MessageType> Delivery<T> {
    pub(crate) fn new() -> Self {
        Self {
            processor: RwLock::new(None),
        }
    }

    pub(crate) fn register(&self, processor: Arc<dyn MessageProcessor<T>>) {
        *self.processor.write().unwrap_or_else(|e| e.into_inner()) = Some(processor);
    }

    /// Hand a fired message to the processor. Bookkeeping for the timer must
    /// already be complete; failures here are only logged.
    pub(crate) fn deliver(&self, key: &dyn Debug, message: Message<T>) {
        let processor = self
            .processor
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let kind = message.message_type().name();

        match processor {
            Some(processor) => {
                if let Err(e) = processor.process(message) {
                    warn!(?key, kind, "Timeout delivery failed: {}", e);
                }
            }
            None => {
                warn!(?key, kind, "Timeout fired with no processor registered, dropping");
            }
        }
    }
}
