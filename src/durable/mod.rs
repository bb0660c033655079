//! # Durable store adapter
//!
//! Key/value persistence for logical stores. Each logical store (`auth`, `cart`, `tenant`, …) is kept
//! under `"<prefix>-<id>"` as an [`Envelope`] carrying the payload, the schema version and the write
//! time.
//!
//! Reads are defensive: a stored value that does not parse as an envelope is deleted on sight and
//! reported as absent. Writes stamp the envelope and synthesize a change event for listeners in the
//! current tab, so same-tab observers see their own writes exactly like other tabs do.
//!
//! The [`StorageArea`] trait is the seam to the platform: [`MemoryOrigin`] for tests and embedded use,
//! [`FileStorage`] on desktop and `WebStorage` (feature `wasm-web`) in the browser.

mod area;
mod envelope;
pub mod error;
#[cfg(not(target_arch = "wasm32"))]
mod file;
mod memory;
#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
mod web;

use std::fmt;
use std::sync::{Arc, LazyLock};

use serde_json::{json, Value};

pub use area::{StorageArea, StorageEvent, StorageListener};
pub use envelope::Envelope;
pub use error::{StorageError, StorageErrorCode, StorageResult};
#[cfg(not(target_arch = "wasm32"))]
pub use file::FileStorage;
pub use memory::{MemoryOrigin, MemoryStorage};
#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
pub use web::{WebStorage, WebStorageDriver};

use crate::durable::error::serialization_error;
use crate::logger::Logger;
use crate::util::{system_clock, Clock, ListenerSet, Subscription};

static DURABLE_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/durable"));

/// Envelope-aware adapter over a [`StorageArea`]. Cheap to clone; clones share the same area and
/// same-tab listeners.
#[derive(Clone)]
pub struct DurableStore {
    inner: Arc<DurableInner>,
}

struct DurableInner {
    area: Arc<dyn StorageArea>,
    prefix: String,
    version: String,
    clock: Arc<dyn Clock>,
    local_listeners: ListenerSet<StorageEvent>,
}

impl fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableStore")
            .field("prefix", &self.inner.prefix)
            .field("version", &self.inner.version)
            .finish()
    }
}

impl DurableStore {
    pub fn new(area: Arc<dyn StorageArea>, prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self::with_clock(area, prefix, version, system_clock())
    }

    pub fn with_clock(
        area: Arc<dyn StorageArea>,
        prefix: impl Into<String>,
        version: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(DurableInner {
                area,
                prefix: prefix.into(),
                version: version.into(),
                clock,
                local_listeners: ListenerSet::new(),
            }),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Version tag stamped on every envelope written by this adapter.
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn now_millis(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    pub fn key_for(&self, name: &str) -> String {
        format!("{}-{}", self.inner.prefix, name)
    }

    /// Maps a namespaced storage key back to its logical store id.
    pub fn store_id_for_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.inner.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|id| !id.is_empty())
    }

    /// Returns the raw envelope string stored for `name`, or `None` when it is missing, unreadable or
    /// corrupt. Corrupt entries are deleted.
    pub fn get(&self, name: &str) -> Option<String> {
        let key = self.key_for(name);
        let raw = match self.inner.area.get_item(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                DURABLE_LOGGER.warn(format!("failed to read '{key}': {err}"));
                return None;
            }
        };

        match Envelope::parse(&raw) {
            Ok(_) => Some(raw),
            Err(err) => {
                DURABLE_LOGGER.warn(format!("discarding corrupt entry '{key}': {err}"));
                if let Err(err) = self.inner.area.remove_item(&key) {
                    DURABLE_LOGGER.error(format!("failed to delete corrupt entry '{key}': {err}"));
                }
                None
            }
        }
    }

    /// Stores a serialized `{ "state": … }` payload for `name`, stamping it with the current time
    /// and this adapter's version tag. Failures are logged and leave storage untouched.
    pub fn set(&self, name: &str, raw: &str) {
        let key = self.key_for(name);
        if let Err(err) = self.try_set(&key, raw) {
            DURABLE_LOGGER.error(format!("failed to persist '{key}': {err}"));
        }
    }

    fn try_set(&self, key: &str, raw: &str) -> StorageResult<()> {
        let mut incoming: Value = serde_json::from_str(raw)?;
        let state = incoming
            .get_mut("state")
            .map(Value::take)
            .filter(|state| !state.is_null())
            .ok_or_else(|| serialization_error("payload has no state"))?;
        let serialized = Envelope::new(state, self.inner.version.clone(), self.now_millis()).to_json()?;

        let old_value = self.inner.area.get_item(key).unwrap_or_default();
        self.inner.area.set_item(key, &serialized)?;
        self.inner.local_listeners.emit(&StorageEvent {
            key: Some(key.to_owned()),
            old_value,
            new_value: Some(serialized),
        });
        Ok(())
    }

    /// Deletes the entry for `name` and notifies same-tab listeners with a `None` value.
    pub fn remove(&self, name: &str) {
        let key = self.key_for(name);
        let old_value = self.inner.area.get_item(&key).unwrap_or_default();
        match self.inner.area.remove_item(&key) {
            Ok(()) => self.inner.local_listeners.emit(&StorageEvent {
                key: Some(key),
                old_value,
                new_value: None,
            }),
            Err(err) => DURABLE_LOGGER.error(format!("failed to remove '{key}': {err}")),
        }
    }

    pub fn read_envelope(&self, name: &str) -> Option<Envelope> {
        self.get(name).and_then(|raw| Envelope::parse(&raw).ok())
    }

    /// Serializes `state` and writes it through [`DurableStore::set`].
    pub fn write_state(&self, name: &str, state: &Value) {
        match serde_json::to_string(&json!({ "state": state })) {
            Ok(raw) => self.set(name, &raw),
            Err(err) => DURABLE_LOGGER.error(format!("failed to serialize state for '{name}': {err}")),
        }
    }

    /// Logical store ids that currently have an entry in the area.
    pub fn stored_ids(&self) -> Vec<String> {
        match self.inner.area.keys() {
            Ok(keys) => keys
                .iter()
                .filter_map(|key| self.store_id_for_key(key))
                .map(str::to_owned)
                .collect(),
            Err(err) => {
                DURABLE_LOGGER.warn(format!("failed to list storage keys: {err}"));
                Vec::new()
            }
        }
    }

    /// Reads a bare key outside the envelope namespace.
    pub fn get_plain(&self, key: &str) -> StorageResult<Option<String>> {
        self.inner.area.get_item(key)
    }

    /// Writes a bare key outside the envelope namespace. No change event is synthesized.
    pub fn set_plain(&self, key: &str, value: &str) -> StorageResult<()> {
        self.inner.area.set_item(key, value)
    }

    pub fn remove_plain(&self, key: &str) -> StorageResult<()> {
        self.inner.area.remove_item(key)
    }

    /// Registers for change events from other tabs (through the platform) and from this tab (through
    /// the events synthesized by `set`/`remove`).
    pub fn watch(&self, listener: StorageListener) -> StorageResult<Subscription> {
        let platform = self.inner.area.subscribe(Arc::clone(&listener))?;
        let local = self.inner.local_listeners.add(listener);
        Ok(Subscription::combine(vec![platform, local]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::ManualClock;
    use serde_json::json;
    use std::sync::Mutex;

    fn store_on(origin: &MemoryOrigin) -> DurableStore {
        DurableStore::with_clock(
            Arc::new(origin.tab()),
            "storefront",
            "1.0",
            Arc::new(ManualClock::new(5_000)),
        )
    }

    fn record(store: &DurableStore) -> (Arc<Mutex<Vec<StorageEvent>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = store
            .watch(Arc::new(move |event: &StorageEvent| {
                sink.lock().unwrap().push(event.clone());
            }))
            .unwrap();
        (events, subscription)
    }

    #[test]
    fn round_trips_state_through_envelope() {
        let origin = MemoryOrigin::new();
        let store = store_on(&origin);
        let payload = json!({"items": [{"productId": "p1", "quantity": 2}], "total": 10.0, "itemCount": 2});

        store.set("cart", &json!({ "state": payload, "version": "0.1" }).to_string());
        let envelope = Envelope::parse(&store.get("cart").unwrap()).unwrap();

        assert_eq!(envelope.state, payload);
        assert_eq!(envelope.version, "1.0");
        assert_eq!(envelope.timestamp, 5_000);
    }

    #[test]
    fn corrupt_entries_are_deleted_on_read() {
        let origin = MemoryOrigin::new();
        let store = store_on(&origin);
        let raw_area = origin.tab();

        raw_area.set_item("storefront-auth", "{not json").unwrap();
        assert_eq!(store.get("auth"), None);
        assert_eq!(raw_area.get_item("storefront-auth").unwrap(), None);
        assert_eq!(store.get("auth"), None);

        raw_area
            .set_item("storefront-tenant", r#"{"version":"1.0"}"#)
            .unwrap();
        assert_eq!(store.get("tenant"), None);
        assert!(origin.is_empty());
    }

    #[test]
    fn set_and_remove_emit_exactly_one_local_event() {
        let origin = MemoryOrigin::new();
        let store = store_on(&origin);
        let (events, _subscription) = record(&store);

        store.write_state("tenant", &json!({"id": "t1", "branding": {}}));
        store.remove("tenant");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key.as_deref(), Some("storefront-tenant"));
        assert!(events[0].new_value.is_some());
        assert_eq!(events[1].new_value, None);
        assert_eq!(events[1].old_value, events[0].new_value);
    }

    #[test]
    fn rejected_writes_do_not_notify() {
        let origin = MemoryOrigin::new();
        let store = store_on(&origin);
        let (events, _subscription) = record(&store);

        store.set("cart", "garbage");
        store.set("cart", r#"{"version":"1.0"}"#);
        origin.set_quota_bytes(Some(4));
        store.write_state("cart", &json!({"items": []}));

        assert!(events.lock().unwrap().is_empty());
        assert_eq!(store.get("cart"), None);
    }

    #[test]
    fn watch_receives_writes_from_other_tabs() {
        let origin = MemoryOrigin::new();
        let first = store_on(&origin);
        let second = store_on(&origin);
        let (events, _subscription) = record(&second);

        first.write_state("auth", &json!({"user": null, "token": null, "isAuthenticated": false}));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key.as_deref(), Some("storefront-auth"));
    }

    #[test]
    fn plain_keys_live_outside_the_envelope_namespace() {
        let origin = MemoryOrigin::new();
        let store = store_on(&origin);
        store.set_plain("storefront_auth_token", "t1").unwrap();
        store.write_state("cart", &json!({"items": []}));

        assert_eq!(store.get_plain("storefront_auth_token").unwrap().as_deref(), Some("t1"));
        assert_eq!(store.stored_ids(), vec!["cart".to_string()]);
        assert_eq!(store.store_id_for_key("storefront-"), None);
        assert_eq!(store.store_id_for_key("storefront_backups"), None);
    }
}
