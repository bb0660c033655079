use std::sync::{Arc, Mutex, PoisonError};

use crate::durable::error::StorageResult;
use crate::util::{Listener, Subscription};

/// Change signal emitted by a storage area, shaped after the browser `StorageEvent`.
///
/// `key` is `None` when the whole area was cleared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

pub type StorageListener = Listener<StorageEvent>;

/// Raw string key/value backend shared by every tab of an origin.
///
/// Implementations must deliver change events to `subscribe` listeners for writes made by *other*
/// tabs (or processes) only, mirroring the platform `storage` event. Same-tab delivery is synthesized
/// by [`DurableStore`](crate::durable::DurableStore).
pub trait StorageArea: Send + Sync {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove_item(&self, key: &str) -> StorageResult<()>;
    fn keys(&self) -> StorageResult<Vec<String>>;

    fn subscribe(&self, _listener: StorageListener) -> StorageResult<Subscription> {
        Ok(Subscription::noop())
    }
}

struct TabListener {
    id: u64,
    tab: u64,
    listener: StorageListener,
}

#[derive(Default)]
struct FanoutState {
    next_id: u64,
    next_tab: u64,
    listeners: Vec<TabListener>,
}

/// Routes change events between tab handles that share one origin. A write made through one tab is
/// delivered to the listeners of every other tab.
#[derive(Clone, Default)]
pub(crate) struct TabFanout {
    state: Arc<Mutex<FanoutState>>,
}

impl TabFanout {
    pub(crate) fn next_tab(&self) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.next_tab += 1;
        state.next_tab
    }

    pub(crate) fn add(&self, tab: u64, listener: StorageListener) -> Subscription {
        let id = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.next_id += 1;
            let id = state.next_id;
            state.listeners.push(TabListener { id, tab, listener });
            id
        };

        let state = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                state
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .listeners
                    .retain(|entry| entry.id != id);
            }
        })
    }

    pub(crate) fn emit_from(&self, origin_tab: u64, event: &StorageEvent) {
        let targets: Vec<StorageListener> = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .iter()
            .filter(|entry| entry.tab != origin_tab)
            .map(|entry| Arc::clone(&entry.listener))
            .collect();

        for listener in targets {
            listener(event);
        }
    }
}
