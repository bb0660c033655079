use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use crate::durable::area::{StorageArea, StorageEvent, StorageListener, TabFanout};
use crate::durable::error::{unavailable, StorageResult};
use crate::logger::Logger;
use crate::util::Subscription;

static FILE_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/durable/file"));

/// Desktop storage area keeping the whole origin in one JSON document.
///
/// Writes replace the document atomically (temp file + rename). Change events reach sibling handles
/// created with [`FileStorage::tab`] in the same process; other processes only observe the new
/// contents on their next read.
#[derive(Clone)]
pub struct FileStorage {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
    fanout: TabFanout,
    tab: u64,
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .field("tab", &self.tab)
            .finish()
    }
}

impl FileStorage {
    pub fn open(path: impl AsRef<Path>) -> Self {
        let fanout = TabFanout::default();
        let tab = fanout.next_tab();
        Self {
            path: Arc::new(path.as_ref().to_path_buf()),
            write_lock: Arc::new(Mutex::new(())),
            fanout,
            tab,
        }
    }

    /// Returns another handle on the same document that behaves as a separate tab.
    pub fn tab(&self) -> Self {
        Self {
            path: Arc::clone(&self.path),
            write_lock: Arc::clone(&self.write_lock),
            fanout: self.fanout.clone(),
            tab: self.fanout.next_tab(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> StorageResult<BTreeMap<String, String>> {
        let contents = match fs::read_to_string(&*self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => {
                return Err(unavailable(format!(
                    "failed to read storage file {}: {err}",
                    self.path.display()
                )))
            }
        };

        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        match serde_json::from_str(&contents) {
            Ok(entries) => Ok(entries),
            Err(err) => {
                FILE_LOGGER.warn(format!(
                    "storage file {} is corrupt ({err}); starting from an empty origin",
                    self.path.display()
                ));
                Ok(BTreeMap::new())
            }
        }
    }

    fn store(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| unavailable(format!("failed to create storage directory: {err}")))?;
        }

        let serialized = serde_json::to_string(entries)?;
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, serialized)
            .map_err(|err| unavailable(format!("failed to write storage file: {err}")))?;
        fs::rename(&temp_path, &*self.path)
            .map_err(|err| unavailable(format!("failed to replace storage file: {err}")))?;
        Ok(())
    }
}

impl StorageArea for FileStorage {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.load()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let old_value = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut entries = self.load()?;
            let old_value = entries.insert(key.to_owned(), value.to_owned());
            self.store(&entries)?;
            old_value
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
        let old_value = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let mut entries = self.load()?;
            let old_value = entries.remove(key);
            if old_value.is_some() {
                self.store(&entries)?;
            }
            old_value
        };

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
        Ok(self.load()?.into_keys().collect())
    }

    fn subscribe(&self, listener: StorageListener) -> StorageResult<Subscription> {
        Ok(self.fanout.add(self.tab, listener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("storefront-state-test-{}-{}.json", name, std::process::id()));
        path
    }

    #[test]
    fn values_survive_reopen() {
        let path = temp_path("reopen");
        let _ = fs::remove_file(&path);

        let storage = FileStorage::open(&path);
        storage.set_item("storefront-cart", "{\"state\":{}}").unwrap();
        drop(storage);

        let reopened = FileStorage::open(&path);
        assert_eq!(
            reopened.get_item("storefront-cart").unwrap().as_deref(),
            Some("{\"state\":{}}")
        );
        reopened.remove_item("storefront-cart").unwrap();
        assert!(reopened.keys().unwrap().is_empty());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn corrupt_document_reads_as_empty() {
        let path = temp_path("corrupt");
        fs::write(&path, "not json").unwrap();

        let storage = FileStorage::open(&path);
        assert_eq!(storage.get_item("anything").unwrap(), None);
        storage.set_item("k", "v").unwrap();
        assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("v"));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn sibling_tabs_receive_events() {
        let path = temp_path("siblings");
        let _ = fs::remove_file(&path);

        let first = FileStorage::open(&path);
        let second = first.tab();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _subscription = second
            .subscribe(Arc::new(move |_event: &StorageEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        first.set_item("k", "v").unwrap();
        second.set_item("k", "w").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let _ = fs::remove_file(path);
    }
}
