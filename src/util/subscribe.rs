use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

/// Guard returned by every `subscribe`/`watch` style API. Dropping it removes the registration.
#[must_use = "dropping a Subscription immediately unregisters the listener"]
pub struct Subscription {
    cleanup: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Subscription {
    /// Creates a subscription with a cleanup callback that runs on drop.
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Returns a subscription that performs no cleanup work.
    pub fn noop() -> Self {
        Self { cleanup: None }
    }

    /// Merges several registrations into one guard.
    pub fn combine(subscriptions: Vec<Subscription>) -> Self {
        Self::new(move || drop(subscriptions))
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    /// Keeps the listener registered for the lifetime of its owner.
    pub fn keep_alive(mut self) {
        self.cleanup.take();
    }
}

impl Default for Subscription {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cleanup.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

struct ListenerEntries<E> {
    next_id: u64,
    entries: Vec<(u64, Listener<E>)>,
}

/// Ordered set of listeners. Listeners are always invoked outside the internal lock so they may
/// register or unregister listeners re-entrantly.
pub struct ListenerSet<E> {
    inner: Arc<Mutex<ListenerEntries<E>>>,
}

impl<E> Clone for ListenerSet<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for ListenerSet<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerEntries {
                next_id: 1,
                entries: Vec::new(),
            })),
        }
    }
}

impl<E: 'static> ListenerSet<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener<E>) -> Subscription {
        let id = {
            let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let id = guard.next_id;
            guard.next_id += 1;
            guard.entries.push((id, listener));
            id
        };

        let entries = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(entries) = entries.upgrade() {
                entries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .entries
                    .retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dropping_subscription_removes_listener() {
        let set: ListenerSet<u32> = ListenerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let subscription = set.add(Arc::new(move |value| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        }));

        set.emit(&2);
        drop(subscription);
        set.emit(&5);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(set.is_empty());
    }

    #[test]
    fn keep_alive_leaves_listener_registered() {
        let set: ListenerSet<()> = ListenerSet::new();
        set.add(Arc::new(|_| {})).keep_alive();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let set: ListenerSet<&'static str> = ListenerSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut guards = Vec::new();
        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            guards.push(set.add(Arc::new(move |event| {
                order.lock().unwrap().push(format!("{label}:{event}"));
            })));
        }

        set.emit(&"go");
        assert_eq!(
            order.lock().unwrap().as_slice(),
            ["first:go", "second:go", "third:go"]
        );
    }
}
