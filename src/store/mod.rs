//! # State stores
//!
//! [`StateStore`] is the observable in-memory container behind every logical store. One instance exists per
//! store id per tab. It
//!
//! - restores itself from the durable store on [`StateStore::initialize`] (migrating, validating and
//!   checking staleness on the way, degrading to the domain default on any failure);
//! - writes every mutation through to the durable store, which fans the change out to other tabs;
//! - accepts payloads from other tabs only through [`StateStore::sync_from_other_tab`], after validation.
//!
//! Domains plug in through [`PersistedDomain`]; the auth, cart and tenant domains add their mutation
//! operations as inherent methods on their `StateStore` instantiation.
//!
//! ```
//! use std::sync::Arc;
//! use storefront_state::durable::{DurableStore, MemoryStorage};
//! use storefront_state::options::SyncOptions;
//! use storefront_state::schema::SchemaRegistry;
//! use storefront_state::store::{CartState, CartStore, LineItem, PersistedDomain, StoreContext};
//!
//! let options = SyncOptions::default();
//! let durable = DurableStore::new(Arc::new(MemoryStorage::new()), &options.prefix, &options.schema_version);
//! let mut registry = SchemaRegistry::new(&options.schema_version);
//! CartState::register(&mut registry);
//! let context = StoreContext::new(durable, registry, options).unwrap();
//!
//! let cart = CartStore::new(context);
//! cart.initialize();
//! let state = cart.add_item(LineItem::new("sku-1", "Mug", 12.5, 2));
//! assert_eq!(state.item_count, 2);
//! assert_eq!(state.total, 25.0);
//! ```

mod auth;
mod cart;
mod tenant;

use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

pub use auth::{AuthState, AuthStore, User, UserPatch};
pub use cart::{CartState, CartStore, LineItem};
pub use tenant::{TenantState, TenantStore};

use crate::durable::{DurableStore, StorageResult};
use crate::logger::Logger;
use crate::notifier::CrossTabNotifier;
use crate::options::SyncOptions;
use crate::schema::{SchemaRegistry, StoreSchema};
use crate::util::{ListenerSet, Subscription};

static STORE_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/store"));

/// A state domain that can be persisted, validated and synced across tabs.
pub trait PersistedDomain:
    Serialize + DeserializeOwned + Clone + Default + PartialEq + Send + Sync + 'static
{
    /// Logical store id; namespaces the durable key, the cross-tab channel and the schema lookup.
    const STORE_ID: &'static str;

    fn schema() -> StoreSchema {
        StoreSchema::for_type::<Self>()
    }

    /// Re-establishes derived fields. Runs after every mutation, restore and cross-tab merge.
    fn normalize(&mut self) {}

    fn register(registry: &mut SchemaRegistry) {
        registry.register(Self::STORE_ID, Self::schema());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorePhase {
    Uninitialized,
    Loading,
    Ready,
}

/// Services shared by every store of one tab.
#[derive(Clone, Debug)]
pub struct StoreContext {
    pub durable: DurableStore,
    pub registry: Arc<SchemaRegistry>,
    pub notifier: CrossTabNotifier,
    pub options: Arc<SyncOptions>,
}

impl StoreContext {
    /// Wires a notifier onto `durable`. `registry` must already hold the schemas of the stores that will
    /// use this context.
    pub fn new(durable: DurableStore, registry: SchemaRegistry, options: SyncOptions) -> StorageResult<Self> {
        let notifier = CrossTabNotifier::new(&durable)?;
        Ok(Self {
            durable,
            registry: Arc::new(registry),
            notifier,
            options: Arc::new(options),
        })
    }
}

struct Slot<D> {
    state: D,
    phase: StorePhase,
}

struct StoreInner<D: PersistedDomain> {
    context: StoreContext,
    slot: Mutex<Slot<D>>,
    writes: Mutex<()>,
    listeners: ListenerSet<D>,
}

pub struct StateStore<D: PersistedDomain> {
    inner: Arc<StoreInner<D>>,
}

impl<D: PersistedDomain> Clone for StateStore<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: PersistedDomain + fmt::Debug> fmt::Debug for StateStore<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot();
        f.debug_struct("StateStore")
            .field("store_id", &D::STORE_ID)
            .field("phase", &slot.phase)
            .field("state", &slot.state)
            .finish()
    }
}

impl<D: PersistedDomain> StateStore<D> {
    pub fn new(context: StoreContext) -> Self {
        if !context.registry.contains(D::STORE_ID) {
            STORE_LOGGER.warn(format!(
                "no schema registered for '{}'; every restored or synced payload will be rejected",
                D::STORE_ID
            ));
        }
        Self {
            inner: Arc::new(StoreInner {
                context,
                slot: Mutex::new(Slot {
                    state: D::default(),
                    phase: StorePhase::Uninitialized,
                }),
                writes: Mutex::new(()),
                listeners: ListenerSet::new(),
            }),
        }
    }

    pub fn store_id(&self) -> &'static str {
        D::STORE_ID
    }

    pub fn context(&self) -> &StoreContext {
        &self.inner.context
    }

    fn slot(&self) -> MutexGuard<'_, Slot<D>> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> D {
        self.slot().state.clone()
    }

    pub fn phase(&self) -> StorePhase {
        self.slot().phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase() != StorePhase::Ready
    }

    /// Restores persisted state and subscribes to cross-tab changes.
    ///
    /// Safe to call repeatedly: a store that is already loading returns immediately, and a ready store only
    /// refreshes its cross-tab subscription (which replaces, never duplicates, the previous one).
    pub fn initialize(&self) -> D {
        {
            let mut slot = self.slot();
            match slot.phase {
                StorePhase::Loading => return slot.state.clone(),
                StorePhase::Ready => {
                    let state = slot.state.clone();
                    drop(slot);
                    self.attach();
                    return state;
                }
                StorePhase::Uninitialized => slot.phase = StorePhase::Loading,
            }
        }

        let restored = self.restore();
        let (state, changed) = {
            let mut slot = self.slot();
            let changed = match restored {
                Some(restored) if restored != slot.state => {
                    slot.state = restored;
                    true
                }
                _ => false,
            };
            slot.phase = StorePhase::Ready;
            (slot.state.clone(), changed)
        };

        self.attach();
        if changed {
            self.inner.listeners.emit(&state);
        }
        state
    }

    fn attach(&self) {
        let store = Arc::downgrade(&self.inner);
        self.inner.context.notifier.subscribe(
            D::STORE_ID,
            Arc::new(move |candidate| {
                if let Some(inner) = store.upgrade() {
                    StateStore { inner }.sync_from_other_tab(candidate);
                }
            }),
        );
    }

    fn restore(&self) -> Option<D> {
        let context = &self.inner.context;
        let envelope = context.durable.read_envelope(D::STORE_ID)?;

        if let Some(max_age) = context.options.max_state_age_millis {
            let age = envelope.age_millis(context.durable.now_millis());
            if age > max_age {
                STORE_LOGGER.debug(format!("persisted '{}' state is {age}ms old; using defaults", D::STORE_ID));
                return None;
            }
        }

        let Some(state) = context.registry.restore(D::STORE_ID, &envelope) else {
            STORE_LOGGER.warn(format!(
                "persisted '{}' state (version {}) could not be migrated or validated; using defaults",
                D::STORE_ID,
                envelope.version
            ));
            return None;
        };

        match serde_json::from_value::<D>(state) {
            Ok(mut restored) => {
                restored.normalize();
                Some(restored)
            }
            Err(err) => {
                STORE_LOGGER.warn(format!("failed to decode persisted '{}' state: {err}", D::STORE_ID));
                None
            }
        }
    }

    /// Applies `mutate` to a copy of the current state, then stores, persists and publishes the result.
    ///
    /// Updates are serialized; `mutate` must not call back into the same store's `update`.
    pub fn update<F>(&self, mutate: F) -> D
    where
        F: FnOnce(&mut D),
    {
        let writes = self.inner.writes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = self.state();
        mutate(&mut next);
        next.normalize();
        self.slot().state = next.clone();
        self.persist(&next);
        drop(writes);

        self.inner.listeners.emit(&next);
        next
    }

    /// Replaces the whole state.
    pub fn replace(&self, next: D) -> D {
        self.update(move |state| *state = next)
    }

    /// Resets to the domain default and persists it.
    pub fn reset(&self) -> D {
        self.replace(D::default())
    }

    /// Resets to the domain default and deletes the persisted entry.
    pub fn purge(&self) -> D {
        let writes = self.inner.writes.lock().unwrap_or_else(PoisonError::into_inner);
        let state = D::default();
        self.slot().state = state.clone();
        self.inner.context.durable.remove(D::STORE_ID);
        drop(writes);

        self.inner.listeners.emit(&state);
        state
    }

    fn persist(&self, state: &D) {
        match serde_json::to_value(state) {
            Ok(value) => self.inner.context.durable.write_state(D::STORE_ID, &value),
            Err(err) => STORE_LOGGER.error(format!("failed to serialize '{}' state: {err}", D::STORE_ID)),
        }
    }

    /// Merges a payload written by another tab. Invalid payloads are dropped without touching the
    /// in-memory state; valid ones overwrite it field by field. Nothing is written back to storage.
    ///
    /// Returns whether the in-memory state changed.
    pub fn sync_from_other_tab(&self, candidate: Value) -> bool {
        if !self.inner.context.registry.validate(D::STORE_ID, &candidate) {
            STORE_LOGGER.debug(format!("rejected cross-tab payload for '{}'", D::STORE_ID));
            return false;
        }

        let merged = match (serde_json::to_value(self.state()), candidate) {
            (Ok(Value::Object(mut base)), Value::Object(incoming)) => {
                base.extend(incoming);
                Value::Object(base)
            }
            (_, candidate) => candidate,
        };
        let mut next = match serde_json::from_value::<D>(merged) {
            Ok(next) => next,
            Err(err) => {
                STORE_LOGGER.debug(format!("failed to merge cross-tab payload for '{}': {err}", D::STORE_ID));
                return false;
            }
        };
        next.normalize();

        {
            let mut slot = self.slot();
            if slot.state == next {
                return false;
            }
            slot.state = next.clone();
        }
        self.inner.listeners.emit(&next);
        true
    }

    /// Calls `listener` with the new state after every in-memory change.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&D) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(listener))
    }
}
