//! Logical-clock timer engine.
//!
//! Time is a millisecond counter that only advances when [`LogicalTimeouts::tick`]
//! is called. Nothing blocks, so runs are reproducible.

use super::{Delivery, TimeoutStrategy, Timeouts};
use crate::message::{Message, MessageType};
use crate::processor::MessageProcessor;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

struct PendingTimeout<T> {
    deadline: u64,
    /// Arm order, breaks ties between equal deadlines
    seq: u64,
    message: Message<T>,
}

struct LogicalState<K, T> {
    now: u64,
    next_seq: u64,
    timeouts: HashMap<K, PendingTimeout<T>>,
}

/// Timer engine driven by an explicit logical clock.
pub struct LogicalTimeouts<K, T> {
    state: Mutex<LogicalState<K, T>>,
    strategy: Arc<dyn TimeoutStrategy<T>>,
    delivery: Delivery<T>,
}

impl<K, T> LogicalTimeouts<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    T: MessageType,
{
    /// Create an engine at logical time 0.
    pub fn new(strategy: Arc<dyn TimeoutStrategy<T>>) -> Self {
        Self {
            state: Mutex::new(LogicalState {
                now: 0,
                next_seq: 0,
                timeouts: HashMap::new(),
            }),
            strategy,
            delivery: Delivery::new(),
        }
    }

    /// Register the processor fired timeouts are delivered to.
    pub fn register_processor(&self, processor: Arc<dyn MessageProcessor<T>>) {
        self.delivery.register(processor);
    }

    /// Current logical time in milliseconds.
    pub fn now(&self) -> u64 {
        self.lock().now
    }

    /// Deadline of the pending timer for `key`, if any.
    pub fn deadline(&self, key: &K) -> Option<u64> {
        self.lock().timeouts.get(key).map(|p| p.deadline)
    }

    /// Advance the clock to `now` and fire every timer whose deadline has
    /// passed.
    ///
    /// Expired entries are removed before any of them is delivered, so
    /// timers re-armed by a handler belong to the next tick. Delivery is in
    /// deadline order. Moving the clock backwards is ignored.
    ///
    /// The strategy sees the new time before expiry is evaluated, without
    /// the engine lock held, so it may query the engine.
    pub fn tick(&self, now: u64) {
        let now = {
            let mut state = self.lock();
            state.now = state.now.max(now);
            state.now
        };
        self.strategy.tick(now);

        let expired = {
            let mut state = self.lock();
            let keys: Vec<K> = state
                .timeouts
                .iter()
                .filter(|(_, pending)| pending.deadline <= now)
                .map(|(key, _)| key.clone())
                .collect();

            let mut expired: Vec<(K, PendingTimeout<T>)> = keys
                .into_iter()
                .filter_map(|key| state.timeouts.remove(&key).map(|p| (key, p)))
                .collect();
            expired.sort_by_key(|(_, pending)| (pending.deadline, pending.seq));
            expired
        };

        for (key, pending) in expired {
            trace!(?key, deadline = pending.deadline, "Timeout fired");
            self.strategy.timeout_triggered(&pending.message);
            self.delivery.deliver(&key, pending.message);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogicalState<K, T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K, T> Timeouts<K, T> for LogicalTimeouts<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    T: MessageType,
{
    fn set_timeout(&self, key: K, message: Message<T>) {
        let duration = self.strategy.timeout_for(&message);
        let mut state = self.lock();
        let deadline = state.now.saturating_add(duration.as_millis() as u64);
        let seq = state.next_seq;
        state.next_seq += 1;

        debug!(?key, kind = message.message_type().name(), deadline, "Timeout set");
        state.timeouts.insert(
            key,
            PendingTimeout {
                deadline,
                seq,
                message,
            },
        );
    }

    fn cancel_timeout(&self, key: &K) {
        let removed = self.lock().timeouts.remove(key);
        if let Some(pending) = removed {
            debug!(?key, "Timeout cancelled");
            self.strategy.timeout_cancelled(&pending.message);
        }
    }

    fn cancel_all(&self) {
        let removed: Vec<_> = self.lock().timeouts.drain().collect();
        for (key, pending) in removed {
            trace!(?key, "Timeout cancelled (all)");
            self.strategy.timeout_cancelled(&pending.message);
        }
    }

    fn is_pending(&self, key: &K) -> bool {
        self.lock().timeouts.contains_key(key)
    }

    fn pending_count(&self) -> usize {
        self.lock().timeouts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{MessageQueue, ProcessError};
    use crate::timeouts::{FixedTimeoutStrategy, MessageTimeoutStrategy};
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum Tick {
        First,
        Second,
        Slow,
    }

    impl MessageType for Tick {
        fn name(&self) -> &'static str {
            match self {
                Tick::First => "first",
                Tick::Second => "second",
                Tick::Slow => "slow",
            }
        }
    }

    /// Records every hook call the engine makes.
    #[derive(Default)]
    struct RecordingStrategy {
        events: Mutex<Vec<String>>,
    }

    impl RecordingStrategy {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl TimeoutStrategy<Tick> for RecordingStrategy {
        fn timeout_for(&self, _message: &Message<Tick>) -> Duration {
            Duration::from_millis(100)
        }

        fn timeout_triggered(&self, message: &Message<Tick>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("triggered:{}", message.message_type().name()));
        }

        fn timeout_cancelled(&self, message: &Message<Tick>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("cancelled:{}", message.message_type().name()));
        }

        fn tick(&self, now_ms: u64) {
            self.events.lock().unwrap().push(format!("tick:{}", now_ms));
        }
    }

    struct FailingProcessor;

    impl MessageProcessor<Tick> for FailingProcessor {
        fn process(&self, _message: Message<Tick>) -> crate::processor::Result<()> {
            Err(ProcessError::Rejected("boom".into()))
        }
    }

    fn engine() -> (LogicalTimeouts<&'static str, Tick>, Arc<MessageQueue<Tick>>) {
        let strategy = MessageTimeoutStrategy::new(Duration::from_millis(100))
            .timeout("slow", Duration::from_millis(500));
        let timeouts = LogicalTimeouts::new(Arc::new(strategy));
        let queue = Arc::new(MessageQueue::new());
        timeouts.register_processor(queue.clone());
        (timeouts, queue)
    }

    fn delivered(queue: &MessageQueue<Tick>) -> Vec<Tick> {
        queue.drain().into_iter().map(|m| m.into_type()).collect()
    }

    // ==================== Firing ====================

    #[test]
    fn test_fires_at_deadline() {
        let (timeouts, queue) = engine();
        timeouts.set_timeout("a", Message::internal(Tick::First));
        assert_eq!(timeouts.deadline(&"a"), Some(100));

        timeouts.tick(99);
        assert!(queue.is_empty());
        assert!(timeouts.is_pending(&"a"));

        timeouts.tick(100);
        assert_eq!(delivered(&queue), vec![Tick::First]);
        assert!(!timeouts.is_pending(&"a"));
    }

    #[test]
    fn test_fires_once() {
        let (timeouts, queue) = engine();
        timeouts.set_timeout("a", Message::internal(Tick::First));

        timeouts.tick(150);
        timeouts.tick(300);
        assert_eq!(delivered(&queue), vec![Tick::First]);
    }

    #[test]
    fn test_delivers_in_deadline_order() {
        let (timeouts, queue) = engine();
        timeouts.set_timeout("slow", Message::internal(Tick::Slow));
        timeouts.tick(50);
        timeouts.set_timeout("first", Message::internal(Tick::First));
        timeouts.set_timeout("second", Message::internal(Tick::Second));

        timeouts.tick(1000);
        assert_eq!(delivered(&queue), vec![Tick::First, Tick::Second, Tick::Slow]);
    }

    #[test]
    fn test_deadline_relative_to_current_time() {
        let (timeouts, _queue) = engine();
        timeouts.tick(1_000);
        timeouts.set_timeout("a", Message::internal(Tick::First));
        assert_eq!(timeouts.deadline(&"a"), Some(1_100));
    }

    #[test]
    fn test_clock_never_moves_backwards() {
        let (timeouts, _queue) = engine();
        timeouts.tick(500);
        timeouts.tick(200);
        assert_eq!(timeouts.now(), 500);
    }

    // ==================== Replacement and cancellation ====================

    #[test]
    fn test_set_twice_only_delivers_replacement() {
        let (timeouts, queue) = engine();
        timeouts.set_timeout("a", Message::internal(Tick::First));
        timeouts.tick(60);
        timeouts.set_timeout("a", Message::internal(Tick::Second));

        // Past the first timer's deadline, before the replacement's
        timeouts.tick(110);
        assert!(queue.is_empty());

        timeouts.tick(160);
        assert_eq!(delivered(&queue), vec![Tick::Second]);
        assert_eq!(timeouts.pending_count(), 0);
    }

    #[test]
    fn test_cancel_prevents_delivery_in_same_tick() {
        let (timeouts, queue) = engine();
        timeouts.set_timeout("a", Message::internal(Tick::First));
        timeouts.set_timeout("b", Message::internal(Tick::Second));
        timeouts.cancel_timeout(&"a");

        timeouts.tick(100);
        assert_eq!(delivered(&queue), vec![Tick::Second]);
    }

    #[test]
    fn test_cancel_unknown_key_is_noop() {
        let (timeouts, queue) = engine();
        timeouts.cancel_timeout(&"missing");
        timeouts.tick(1_000);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let (timeouts, queue) = engine();
        timeouts.set_timeout("a", Message::internal(Tick::First));
        timeouts.set_timeout("b", Message::internal(Tick::Slow));
        timeouts.cancel_all();

        assert_eq!(timeouts.pending_count(), 0);
        timeouts.tick(10_000);
        assert!(queue.is_empty());
    }

    // ==================== Strategy hooks ====================

    #[test]
    fn test_strategy_observes_tick_trigger_and_cancel() {
        let strategy = Arc::new(RecordingStrategy::default());
        let timeouts: LogicalTimeouts<u32, Tick> = LogicalTimeouts::new(strategy.clone());
        timeouts.register_processor(Arc::new(MessageQueue::new()));

        timeouts.set_timeout(1, Message::internal(Tick::First));
        timeouts.set_timeout(2, Message::internal(Tick::Second));
        timeouts.cancel_timeout(&2);
        timeouts.cancel_timeout(&2);
        timeouts.tick(100);

        assert_eq!(
            strategy.events(),
            vec!["cancelled:second", "tick:100", "triggered:first"]
        );
    }

    // ==================== Re-entrancy and failures ====================

    /// Re-arms the same key every time it is delivered.
    struct Rearming {
        timeouts: Arc<LogicalTimeouts<&'static str, Tick>>,
        count: Mutex<u32>,
    }

    impl MessageProcessor<Tick> for Rearming {
        fn process(&self, message: Message<Tick>) -> crate::processor::Result<()> {
            *self.count.lock().unwrap() += 1;
            self.timeouts.set_timeout("loop", message);
            Ok(())
        }
    }

    #[test]
    fn test_handler_rearm_belongs_to_next_tick() {
        let timeouts: Arc<LogicalTimeouts<&'static str, Tick>> = Arc::new(LogicalTimeouts::new(
            Arc::new(FixedTimeoutStrategy::new(Duration::from_millis(100))),
        ));
        let processor = Arc::new(Rearming {
            timeouts: timeouts.clone(),
            count: Mutex::new(0),
        });
        timeouts.register_processor(processor.clone());

        timeouts.set_timeout("loop", Message::internal(Tick::First));
        timeouts.tick(100);
        assert_eq!(*processor.count.lock().unwrap(), 1);
        assert_eq!(timeouts.deadline(&"loop"), Some(200));

        timeouts.tick(200);
        assert_eq!(*processor.count.lock().unwrap(), 2);
    }

    #[test]
    fn test_failing_processor_leaves_state_consistent() {
        let timeouts: LogicalTimeouts<&'static str, Tick> =
            LogicalTimeouts::new(Arc::new(FixedTimeoutStrategy::new(Duration::from_millis(10))));
        timeouts.register_processor(Arc::new(FailingProcessor));

        timeouts.set_timeout("a", Message::internal(Tick::First));
        timeouts.set_timeout("b", Message::internal(Tick::Second));
        timeouts.tick(10);

        assert_eq!(timeouts.pending_count(), 0);

        timeouts.set_timeout("a", Message::internal(Tick::First));
        assert!(timeouts.is_pending(&"a"));
    }

    #[test]
    fn test_fire_without_processor_drops_message() {
        let timeouts: LogicalTimeouts<&'static str, Tick> =
            LogicalTimeouts::new(Arc::new(FixedTimeoutStrategy::new(Duration::from_millis(10))));
        timeouts.set_timeout("a", Message::internal(Tick::First));
        timeouts.tick(10);
        assert_eq!(timeouts.pending_count(), 0);
    }

    // ==================== Strategy re-entry ====================

    /// Reads the engine it is attached to on every tick.
    #[derive(Default)]
    struct InspectingStrategy {
        engine: OnceLock<Weak<LogicalTimeouts<&'static str, Tick>>>,
        seen: Mutex<Vec<(u64, usize, Option<u64>)>>,
    }

    impl TimeoutStrategy<Tick> for InspectingStrategy {
        fn timeout_for(&self, _message: &Message<Tick>) -> Duration {
            Duration::from_millis(100)
        }

        fn tick(&self, now_ms: u64) {
            if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
                let pending = engine.pending_count();
                let deadline = engine.deadline(&"a");
                self.seen.lock().unwrap().push((now_ms, pending, deadline));
            }
        }
    }

    #[test]
    fn test_strategy_may_query_engine_on_tick() {
        let strategy = Arc::new(InspectingStrategy::default());
        let timeouts: Arc<LogicalTimeouts<&'static str, Tick>> =
            Arc::new(LogicalTimeouts::new(strategy.clone()));
        let _ = strategy.engine.set(Arc::downgrade(&timeouts));
        let queue = Arc::new(MessageQueue::new());
        timeouts.register_processor(queue.clone());

        timeouts.set_timeout("a", Message::internal(Tick::First));
        timeouts.tick(100);

        // Tick is observed before the expired timer is removed
        assert_eq!(*strategy.seen.lock().unwrap(), vec![(100, 1, Some(100))]);
        assert_eq!(delivered(&queue), vec![Tick::First]);
    }
}
