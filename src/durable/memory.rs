use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::durable::area::{StorageArea, StorageEvent, StorageListener, TabFanout};
use crate::durable::error::{quota_exceeded, StorageResult};
use crate::util::Subscription;

#[derive(Default)]
struct OriginEntries {
    entries: BTreeMap<String, String>,
    quota_bytes: Option<usize>,
}

impl OriginEntries {
    fn used_bytes_with(&self, key: &str, value: &str) -> usize {
        self.entries
            .iter()
            .filter(|(existing, _)| existing.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>()
            + key.len()
            + value.len()
    }
}

/// In-process stand-in for a browser origin's `localStorage`.
///
/// Every call to [`MemoryOrigin::tab`] returns a handle behaving like one browser tab: all handles
/// share the same entries, and a write through one handle fires change events on the others only.
#[derive(Clone, Default)]
pub struct MemoryOrigin {
    entries: Arc<Mutex<OriginEntries>>,
    fanout: TabFanout,
}

impl fmt::Debug for MemoryOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("MemoryOrigin")
            .field("keys", &guard.entries.keys().collect::<Vec<_>>())
            .field("quota_bytes", &guard.quota_bytes)
            .finish()
    }
}

impl MemoryOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new tab handle on this origin.
    pub fn tab(&self) -> MemoryStorage {
        MemoryStorage {
            entries: Arc::clone(&self.entries),
            fanout: self.fanout.clone(),
            tab: self.fanout.next_tab(),
        }
    }

    /// Caps the total size (keys plus values, in bytes) the origin accepts, like a browser quota.
    pub fn set_quota_bytes(&self, quota: Option<usize>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .quota_bytes = quota;
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One tab's view of a [`MemoryOrigin`].
#[derive(Clone)]
pub struct MemoryStorage {
    entries: Arc<Mutex<OriginEntries>>,
    fanout: TabFanout,
    tab: u64,
}

impl fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage").field("tab", &self.tab).finish()
    }
}

impl MemoryStorage {
    /// Creates a standalone single-tab storage area.
    pub fn new() -> Self {
        MemoryOrigin::new().tab()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageArea for MemoryStorage {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(key)
            .cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let old_value = {
            let mut guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(quota) = guard.quota_bytes {
                let needed = guard.used_bytes_with(key, value);
                if needed > quota {
                    return Err(quota_exceeded(format!(
                        "writing '{key}' needs {needed} bytes, quota is {quota}"
                    )));
                }
            }
            guard.entries.insert(key.to_owned(), value.to_owned())
        };

        self.fanout.emit_from(
            self.tab,
            &StorageEvent {
                key: Some(key.to_owned()),
                old_value,
                new_value: Some(value.to_owned()),
            },
        );
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        let old_value = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .remove(key);

        if old_value.is_some() {
            self.fanout.emit_from(
                self.tab,
                &StorageEvent {
                    key: Some(key.to_owned()),
                    old_value,
                    new_value: None,
                },
            );
        }
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .keys()
            .cloned()
            .collect())
    }

    fn subscribe(&self, listener: StorageListener) -> StorageResult<Subscription> {
        Ok(self.fanout.add(self.tab, listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::error::StorageErrorCode;

    fn recorder(area: &MemoryStorage) -> (Arc<Mutex<Vec<StorageEvent>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = area
            .subscribe(Arc::new(move |event: &StorageEvent| {
                sink.lock().unwrap().push(event.clone());
            }))
            .unwrap();
        (events, subscription)
    }

    #[test]
    fn writes_are_shared_across_tabs() {
        let origin = MemoryOrigin::new();
        let first = origin.tab();
        let second = origin.tab();

        first.set_item("k", "v").unwrap();
        assert_eq!(second.get_item("k").unwrap().as_deref(), Some("v"));
        assert_eq!(second.keys().unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn events_fire_only_in_other_tabs() {
        let origin = MemoryOrigin::new();
        let writer = origin.tab();
        let reader = origin.tab();
        let (own_events, _own) = recorder(&writer);
        let (other_events, _other) = recorder(&reader);

        writer.set_item("k", "1").unwrap();
        writer.set_item("k", "2").unwrap();
        writer.remove_item("k").unwrap();

        assert!(own_events.lock().unwrap().is_empty());
        let other = other_events.lock().unwrap();
        assert_eq!(other.len(), 3);
        assert_eq!(other[1].old_value.as_deref(), Some("1"));
        assert_eq!(other[1].new_value.as_deref(), Some("2"));
        assert_eq!(other[2].new_value, None);
    }

    #[test]
    fn removing_missing_key_is_silent() {
        let origin = MemoryOrigin::new();
        let writer = origin.tab();
        let (events, _subscription) = recorder(&origin.tab());
        writer.remove_item("absent").unwrap();
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn quota_rejects_oversized_writes() {
        let origin = MemoryOrigin::new();
        origin.set_quota_bytes(Some(8));
        let tab = origin.tab();

        tab.set_item("a", "1234").unwrap();
        let err = tab.set_item("b", "123456").unwrap_err();
        assert_eq!(err.code, StorageErrorCode::QuotaExceeded);
        assert_eq!(tab.get_item("b").unwrap(), None);
        // Replacing an existing value only counts the new size.
        tab.set_item("a", "1234567").unwrap();
    }
}
