use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};

/// Observable value container.
///
/// Cloning produces another handle to the same underlying value. Observers
/// either poll with `get`/`read` or `subscribe` to receive every distinct
/// value published after the subscription. Updates are gated on equality, so
/// republishing an unchanged value does not notify anybody.
#[derive(Clone)]
pub struct WatchedValue<T: Clone + PartialEq> {
    inner: Arc<Mutex<WatchInner<T>>>,
}

struct WatchInner<T> {
    value: T,
    subscribers: Vec<Sender<T>>,
}

impl<T: Clone + PartialEq> WatchedValue<T> {
    pub fn new(initial: T) -> WatchedValue<T> {
        WatchedValue {
            inner: Arc::new(Mutex::new(WatchInner {
                value: initial,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Returns a clone of the current value.
    pub fn get(&self) -> T {
        let inner = self.inner.lock().expect("watch lock is not poisoned");

        inner.value.clone()
    }

    /// Applies a closure to the current value without cloning it.
    pub fn read<R>(&self, read_fn: impl FnOnce(&T) -> R) -> R {
        let inner = self.inner.lock().expect("watch lock is not poisoned");

        read_fn(&inner.value)
    }

    /// Publishes a new value, notifying subscribers if it differs from the
    /// current one.
    pub fn set(&self, new_value: T) {
        let mut inner = self.inner.lock().expect("watch lock is not poisoned");

        if inner.value == new_value {
            return;
        }
        inner.value = new_value.clone();
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(new_value.clone()).is_ok());
    }

    /// Returns a channel receiving every subsequent distinct value.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut inner = self.inner.lock().expect("watch lock is not poisoned");

        inner.subscribers.push(tx);

        rx
    }
}

impl<T: Clone + PartialEq + std::fmt::Debug> std::fmt::Debug for WatchedValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.read(|value| f.debug_tuple("WatchedValue").field(value).finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_initial_value() {
        let watch = WatchedValue::new(7u64);

        assert_eq!(7, watch.get());
    }

    #[test]
    fn set_updates_all_handles() {
        let watch = WatchedValue::new(0u64);
        let handle = watch.clone();

        watch.set(42);

        assert_eq!(42, handle.get());
    }

    #[test]
    fn subscriber_receives_distinct_updates_only() {
        let watch = WatchedValue::new(0u64);
        let rx = watch.subscribe();

        watch.set(1);
        watch.set(1);
        watch.set(2);

        assert_eq!(1, rx.recv().unwrap());
        assert_eq!(2, rx.recv().unwrap());
        assert!(rx.try_recv().is_err());
    }
}
