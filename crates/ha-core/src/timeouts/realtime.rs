//! Wall-clock timer engine on a tokio runtime.
//!
//! Each armed timer is a task that sleeps for the strategy's duration and
//! then tries to fire. Firing re-checks, under the engine lock, that the
//! task's entry is still the live one for its key: a timer that was
//! cancelled or replaced while the task was waking up finds a different (or
//! no) entry and does nothing.
//!
//! There is no dedicated scheduler thread: the tokio runtime's timer wheel
//! does the scheduling and each armed timer costs one task. Strategy hooks
//! run without the engine lock held.

use super::{Delivery, TimeoutStrategy, Timeouts};
use crate::message::{Message, MessageType};
use crate::processor::MessageProcessor;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

struct ScheduledTimeout<T> {
    /// Unique per armed timer; identifies the live entry at fire time
    id: u64,
    message: Message<T>,
    task: JoinHandle<()>,
}

struct Inner<K, T> {
    timeouts: Mutex<HashMap<K, ScheduledTimeout<T>>>,
    next_id: AtomicU64,
    strategy: Arc<dyn TimeoutStrategy<T>>,
    delivery: Delivery<T>,
}

impl<K, T> Inner<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: MessageType,
{
    fn lock(&self) -> MutexGuard<'_, HashMap<K, ScheduledTimeout<T>>> {
        self.timeouts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire(&self, key: K, id: u64) {
        let message = {
            let mut timeouts = self.lock();
            match timeouts.get(&key) {
                Some(scheduled) if scheduled.id == id => {
                    timeouts.remove(&key).map(|scheduled| scheduled.message)
                }
                _ => None,
            }
        };

        let Some(message) = message else {
            trace!(?key, id, "Stale timer woke up, ignoring");
            return;
        };

        trace!(?key, id, "Timeout fired");
        self.strategy.timeout_triggered(&message);
        self.delivery.deliver(&key, message);
    }
}

/// Timer engine backed by tokio timers.
pub struct RealTimeTimeouts<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: MessageType,
{
    inner: Arc<Inner<K, T>>,
    runtime: Handle,
}

impl<K, T> RealTimeTimeouts<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: MessageType,
{
    /// Create an engine scheduling its timers on `runtime`.
    pub fn new(runtime: Handle, strategy: Arc<dyn TimeoutStrategy<T>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                timeouts: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                strategy,
                delivery: Delivery::new(),
            }),
            runtime,
        }
    }

    /// Register the processor fired timeouts are delivered to.
    pub fn register_processor(&self, processor: Arc<dyn MessageProcessor<T>>) {
        self.inner.delivery.register(processor);
    }
}

impl<K, T> Timeouts<K, T> for RealTimeTimeouts<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: MessageType,
{
    fn set_timeout(&self, key: K, message: Message<T>) {
        let duration = self.inner.strategy.timeout_for(&message);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = message.message_type().name();

        // Hold the lock across spawn so the task can never look up its key
        // before the entry exists.
        let mut timeouts = self.inner.lock();
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            inner.fire(task_key, id);
        });

        debug!(?key, kind, ?duration, "Timeout set");
        if let Some(replaced) = timeouts.insert(key, ScheduledTimeout { id, message, task }) {
            replaced.task.abort();
        }
    }

    fn cancel_timeout(&self, key: &K) {
        let removed = self.inner.lock().remove(key);
        if let Some(scheduled) = removed {
            scheduled.task.abort();
            debug!(?key, "Timeout cancelled");
            self.inner.strategy.timeout_cancelled(&scheduled.message);
        }
    }

    fn cancel_all(&self) {
        let removed: Vec<_> = self.inner.lock().drain().collect();
        for (key, scheduled) in removed {
            scheduled.task.abort();
            trace!(?key, "Timeout cancelled (all)");
            self.inner.strategy.timeout_cancelled(&scheduled.message);
        }
    }

    fn is_pending(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }

    fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl<K, T> Drop for RealTimeTimeouts<K, T>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    T: MessageType,
{
    fn drop(&mut self) {
        for (_, scheduled) in self.inner.lock().drain() {
            scheduled.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Result as ProcessResult;
    use crate::timeouts::{FixedTimeoutStrategy, MessageTimeoutStrategy};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, PartialEq)]
    enum Alarm {
        Quick(u32),
        Slow(u32),
    }

    impl MessageType for Alarm {
        fn name(&self) -> &'static str {
            match self {
                Alarm::Quick(_) => "quick",
                Alarm::Slow(_) => "slow",
            }
        }
    }

    struct ChannelProcessor(mpsc::UnboundedSender<Alarm>);

    impl MessageProcessor<Alarm> for ChannelProcessor {
        fn process(&self, message: Message<Alarm>) -> ProcessResult<()> {
            let _ = self.0.send(message.into_type());
            Ok(())
        }
    }

    fn engine(
        strategy: Arc<dyn TimeoutStrategy<Alarm>>,
    ) -> (RealTimeTimeouts<u32, Alarm>, mpsc::UnboundedReceiver<Alarm>) {
        let timeouts = RealTimeTimeouts::new(Handle::current(), strategy);
        let (tx, rx) = mpsc::unbounded_channel();
        timeouts.register_processor(Arc::new(ChannelProcessor(tx)));
        (timeouts, rx)
    }

    fn quick_and_slow() -> Arc<dyn TimeoutStrategy<Alarm>> {
        Arc::new(
            MessageTimeoutStrategy::new(Duration::from_millis(10))
                .timeout("slow", Duration::from_millis(200)),
        )
    }

    #[tokio::test]
    async fn test_timer_fires() {
        let (timeouts, mut rx) = engine(quick_and_slow());
        timeouts.set_timeout(1, Message::internal(Alarm::Quick(1)));

        let fired = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");

        assert_eq!(fired, Alarm::Quick(1));
        assert_eq!(timeouts.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timer_cancel() {
        let (timeouts, mut rx) = engine(quick_and_slow());
        timeouts.set_timeout(1, Message::internal(Alarm::Quick(1)));
        timeouts.cancel_timeout(&1);

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "Cancelled timer should not fire");
        assert!(!timeouts.is_pending(&1));
    }

    #[tokio::test]
    async fn test_timer_replace_discards_old_message() {
        let (timeouts, mut rx) = engine(quick_and_slow());

        // Quick one would fire first if it were not replaced
        timeouts.set_timeout(1, Message::internal(Alarm::Quick(1)));
        timeouts.set_timeout(1, Message::internal(Alarm::Slow(2)));
        assert_eq!(timeouts.pending_count(), 1);

        let fired = tokio::time::timeout(Duration::from_millis(1000), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed");
        assert_eq!(fired, Alarm::Slow(2));

        let again = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(again.is_err(), "Replaced timer must never fire");
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (timeouts, mut rx) = engine(quick_and_slow());
        timeouts.set_timeout(1, Message::internal(Alarm::Quick(1)));
        timeouts.set_timeout(2, Message::internal(Alarm::Quick(2)));
        assert_eq!(timeouts.pending_count(), 2);

        timeouts.cancel_all();
        assert_eq!(timeouts.pending_count(), 0);

        let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "No timers should have fired");
    }

    #[tokio::test]
    async fn test_cancel_unknown_key_is_noop() {
        let (timeouts, _rx) = engine(quick_and_slow());
        timeouts.cancel_timeout(&42);
        assert_eq!(timeouts.pending_count(), 0);
    }

    /// Counts cancellations reported by the engine, by alarm number.
    struct CancelLog {
        inner: FixedTimeoutStrategy,
        cancelled: Mutex<HashSet<u32>>,
    }

    impl TimeoutStrategy<Alarm> for CancelLog {
        fn timeout_for(&self, message: &Message<Alarm>) -> Duration {
            self.inner.timeout_for(message)
        }

        fn timeout_cancelled(&self, message: &Message<Alarm>) {
            if let Alarm::Quick(n) | Alarm::Slow(n) = message.message_type() {
                self.cancelled.lock().unwrap().insert(*n);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancel_racing_fire_delivers_at_most_once() {
        let strategy = Arc::new(CancelLog {
            inner: FixedTimeoutStrategy::new(Duration::ZERO),
            cancelled: Mutex::new(HashSet::new()),
        });
        let (timeouts, mut rx) = engine(strategy.clone());

        for n in 0..200 {
            timeouts.set_timeout(n, Message::internal(Alarm::Quick(n)));
            if n % 3 == 0 {
                tokio::task::yield_now().await;
            }
            timeouts.cancel_timeout(&n);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut fired = Vec::new();
        while let Ok(Alarm::Quick(n)) = rx.try_recv() {
            fired.push(n);
        }

        let cancelled = strategy.cancelled.lock().unwrap().clone();
        let unique: HashSet<u32> = fired.iter().copied().collect();
        assert_eq!(unique.len(), fired.len(), "A timer fired twice");
        for n in &fired {
            assert!(!cancelled.contains(n), "Timer {} fired after being cancelled", n);
        }
        assert_eq!(fired.len() + cancelled.len(), 200);
        assert_eq!(timeouts.pending_count(), 0);
    }
}
