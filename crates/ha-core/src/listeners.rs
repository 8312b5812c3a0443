//! Multi-listener notification.
//!
//! [`Listeners`] keeps an immutable snapshot of its listeners. Adding or
//! removing builds a new snapshot and swaps it in, so a notification pass
//! always iterates a list nobody else can change, even when a callback
//! registers or removes listeners while it runs.
//!
//! Each callback runs in isolation: a panicking listener is reported through
//! `tracing` and the remaining listeners are still notified.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use tracing::error;

/// Copy-on-write registry of listeners of type `L`.
pub struct Listeners<L: ?Sized> {
    snapshot: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> Default for Listeners<L> {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }
}

impl<L: ?Sized> Listeners<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Notification order is registration order.
    pub fn add(&self, listener: Arc<L>) {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = Vec::with_capacity(snapshot.len() + 1);
        next.extend(snapshot.iter().cloned());
        next.push(listener);
        *snapshot = Arc::new(next);
    }

    /// Remove a previously added listener (compared by identity).
    ///
    /// Returns false if it was not registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut snapshot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        if !snapshot.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return false;
        }
        let next: Vec<Arc<L>> = snapshot
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        *snapshot = Arc::new(next);
        true
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `notify` once for every listener registered when the pass starts.
    pub fn notify(&self, notify: impl Fn(&L)) {
        let listeners = self.current();
        for (index, listener) in listeners.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| notify(&**listener)));
            if let Err(panic) = result {
                error!(
                    index,
                    "Listener panicked during notification: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    fn current(&self) -> Arc<Vec<Arc<L>>> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    trait Greeter: Send + Sync {
        fn greet(&self, name: &str);
    }

    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Greeter for Recorder {
        fn greet(&self, name: &str) {
            self.log.lock().unwrap().push(format!("{}:{}", self.tag, name));
        }
    }

    struct Panicker;

    impl Greeter for Panicker {
        fn greet(&self, _name: &str) {
            panic!("listener failure");
        }
    }

    fn recorder(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Greeter> {
        Arc::new(Recorder {
            tag,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn test_notify_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners: Listeners<dyn Greeter> = Listeners::new();
        listeners.add(recorder("a", &log));
        listeners.add(recorder("b", &log));

        listeners.notify(|l| l.greet("x"));

        assert_eq!(*log.lock().unwrap(), vec!["a:x", "b:x"]);
    }

    #[test]
    fn test_remove_by_identity() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners: Listeners<dyn Greeter> = Listeners::new();
        let a = recorder("a", &log);
        let b = recorder("b", &log);
        listeners.add(a.clone());
        listeners.add(b);

        assert!(listeners.remove(&a));
        assert!(!listeners.remove(&a));
        assert_eq!(listeners.len(), 1);

        listeners.notify(|l| l.greet("y"));
        assert_eq!(*log.lock().unwrap(), vec!["b:y"]);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let listeners: Listeners<dyn Greeter> = Listeners::new();
        listeners.add(recorder("a", &log));
        listeners.add(Arc::new(Panicker));
        listeners.add(recorder("c", &log));

        listeners.notify(|l| l.greet("z"));

        assert_eq!(*log.lock().unwrap(), vec!["a:z", "c:z"]);
    }

    /// Adds another listener every time it is notified.
    struct SelfReplicating {
        registry: Arc<Listeners<dyn Greeter>>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Greeter for SelfReplicating {
        fn greet(&self, name: &str) {
            self.log.lock().unwrap().push(format!("replicator:{}", name));
            self.registry.add(recorder("late", &self.log));
        }
    }

    #[test]
    fn test_mutation_during_notify_affects_next_pass_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry: Arc<Listeners<dyn Greeter>> = Arc::new(Listeners::new());
        registry.add(Arc::new(SelfReplicating {
            registry: Arc::clone(&registry),
            log: Arc::clone(&log),
        }));

        registry.notify(|l| l.greet("1"));
        assert_eq!(*log.lock().unwrap(), vec!["replicator:1"]);
        assert_eq!(registry.len(), 2);

        registry.notify(|l| l.greet("2"));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["replicator:1", "replicator:2", "late:2"]
        );
    }
}
