//! # Cross-tab notifier
//!
//! One process-wide listener on the durable store's change signal, fanned out to at most one callback per
//! logical store id. Callbacks receive the raw `state` field of the new envelope; validating it is the
//! receiving store's job, so this module knows nothing about domain schemas.
//!
//! Deletions (`new_value == None`) are not forwarded: a store that loses its entry keeps its in-memory state
//! until it writes again.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, Weak};

use serde_json::Value;

use crate::durable::{DurableStore, Envelope, StorageEvent, StorageResult};
use crate::logger::Logger;
use crate::util::Subscription;

static NOTIFIER_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/notifier"));

pub type SyncCallback = Arc<dyn Fn(Value) + Send + Sync + 'static>;

#[derive(Clone)]
pub struct CrossTabNotifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    key_prefix: String,
    callbacks: Mutex<HashMap<String, SyncCallback>>,
    watch: Mutex<Option<Subscription>>,
}

impl fmt::Debug for CrossTabNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossTabNotifier")
            .field("key_prefix", &self.inner.key_prefix)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl CrossTabNotifier {
    /// Starts listening on `durable`'s change signal. The listener lives as long as the notifier.
    pub fn new(durable: &DurableStore) -> StorageResult<Self> {
        let inner = Arc::new(NotifierInner {
            key_prefix: format!("{}-", durable.prefix()),
            callbacks: Mutex::new(HashMap::new()),
            watch: Mutex::new(None),
        });

        let weak: Weak<NotifierInner> = Arc::downgrade(&inner);
        let subscription = durable.watch(Arc::new(move |event: &StorageEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(event);
            }
        }))?;
        *inner.watch.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);

        Ok(Self { inner })
    }

    /// Registers `callback` for `store_id`, replacing any previous callback for the same id.
    pub fn subscribe(&self, store_id: impl Into<String>, callback: SyncCallback) {
        let store_id = store_id.into();
        let replaced = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(store_id.clone(), callback);
        if replaced.is_some() {
            NOTIFIER_LOGGER.debug(format!("replaced cross-tab subscriber for '{store_id}'"));
        }
    }

    pub fn unsubscribe(&self, store_id: &str) {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(store_id);
    }

    pub fn has_subscriber(&self, store_id: &str) -> bool {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(store_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl NotifierInner {
    fn store_id<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.key_prefix.as_str())
            .filter(|id| !id.is_empty())
    }

    fn dispatch(&self, event: &StorageEvent) {
        let Some(store_id) = event.key.as_deref().and_then(|key| self.store_id(key)) else {
            return;
        };
        let Some(raw) = event.new_value.as_deref() else {
            return;
        };

        let callback = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(store_id)
            .cloned();
        let Some(callback) = callback else {
            return;
        };

        match Envelope::parse(raw) {
            Ok(envelope) => callback(envelope.state),
            Err(err) => NOTIFIER_LOGGER.debug(format!("ignoring unreadable change for '{store_id}': {err}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::{MemoryOrigin, StorageArea};
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, SyncCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, Arc::new(move |state| sink.lock().unwrap().push(state)))
    }

    #[test]
    fn delivers_raw_state_from_other_tabs() {
        let origin = MemoryOrigin::new();
        let writer = DurableStore::new(Arc::new(origin.tab()), "storefront", "1.0");
        let reader = DurableStore::new(Arc::new(origin.tab()), "storefront", "1.0");
        let notifier = CrossTabNotifier::new(&reader).unwrap();
        let (seen, callback) = recorder();
        notifier.subscribe("cart", callback);

        writer.write_state("cart", &json!({"items": "not validated here"}));
        writer.write_state("tenant", &json!({"id": "t1"}));

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [json!({"items": "not validated here"})]
        );
    }

    #[test]
    fn last_subscribe_wins() {
        let origin = MemoryOrigin::new();
        let durable = DurableStore::new(Arc::new(origin.tab()), "storefront", "1.0");
        let notifier = CrossTabNotifier::new(&durable).unwrap();
        let (first, first_callback) = recorder();
        let (second, second_callback) = recorder();

        notifier.subscribe("auth", first_callback);
        notifier.subscribe("auth", second_callback);
        durable.write_state("auth", &json!({"token": null}));

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[test]
    fn ignores_foreign_keys_removals_and_unsubscribed_ids() {
        let origin = MemoryOrigin::new();
        let durable = DurableStore::new(Arc::new(origin.tab()), "storefront", "1.0");
        let other_tab = origin.tab();
        let notifier = CrossTabNotifier::new(&durable).unwrap();
        let (seen, callback) = recorder();
        notifier.subscribe("cart", callback);

        other_tab.set_item("storefront_backups", "[]").unwrap();
        other_tab.set_item("other-cart", r#"{"state":{},"version":"1.0"}"#).unwrap();
        other_tab.set_item("storefront-cart", "{broken").unwrap();
        durable.write_state("cart", &json!({"items": []}));
        durable.remove("cart");
        notifier.unsubscribe("cart");
        durable.write_state("cart", &json!({"items": [1]}));

        assert_eq!(seen.lock().unwrap().as_slice(), [json!({"items": []})]);
        assert!(!notifier.has_subscriber("cart"));
    }
}
