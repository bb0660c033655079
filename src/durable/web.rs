use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{EventTarget, Storage, StorageEvent as DomStorageEvent, Window};

use crate::durable::area::{StorageArea, StorageEvent, StorageListener};
use crate::durable::error::{quota_exceeded, unavailable, StorageError, StorageResult};
use crate::util::Subscription;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WebStorageDriver {
    Local,
    Session,
}

/// Browser `localStorage`/`sessionStorage` area. Change events come from the native `storage`
/// event, which the browser only fires in other tabs of the origin.
#[derive(Clone, Debug)]
pub struct WebStorage {
    driver: WebStorageDriver,
}

impl WebStorage {
    pub fn new(driver: WebStorageDriver) -> Self {
        Self { driver }
    }

    pub fn local() -> Self {
        Self::new(WebStorageDriver::Local)
    }

    fn window() -> StorageResult<Window> {
        web_sys::window().ok_or_else(|| unavailable("window object is not available in this environment"))
    }

    fn storage(&self) -> StorageResult<Storage> {
        let window = Self::window()?;
        match self.driver {
            WebStorageDriver::Local => window.local_storage().map_err(map_js_error)?,
            WebStorageDriver::Session => window.session_storage().map_err(map_js_error)?,
        }
        .ok_or_else(|| unavailable("Web storage API is unavailable"))
    }
}

impl StorageArea for WebStorage {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        self.storage()?.get_item(key).map_err(map_js_error)
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        self.storage()?.set_item(key, value).map_err(map_write_error)
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        self.storage()?.remove_item(key).map_err(map_js_error)
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let storage = self.storage()?;
        let length = storage.length().map_err(map_js_error)?;
        let mut keys = Vec::with_capacity(length as usize);
        for index in 0..length {
            if let Some(key) = storage.key(index).map_err(map_js_error)? {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn subscribe(&self, listener: StorageListener) -> StorageResult<Subscription> {
        let window = Self::window()?;
        let callback = Closure::wrap(Box::new(move |event: DomStorageEvent| {
            listener(&StorageEvent {
                key: event.key(),
                old_value: event.old_value(),
                new_value: event.new_value(),
            });
        }) as Box<dyn FnMut(DomStorageEvent)>);

        let handle = StorageListenerHandle::attach(window.into(), callback)?;
        Ok(Subscription::new(move || drop(handle)))
    }
}

fn stringify_js_error(err: &JsValue) -> String {
    if let Some(text) = err.as_string() {
        return text;
    }
    if let Ok(stringified) = js_sys::JSON::stringify(err) {
        if let Some(text) = stringified.as_string() {
            return text;
        }
    }
    format!("{err:?}")
}

fn map_js_error(err: JsValue) -> StorageError {
    unavailable(format!("Web storage error: {}", stringify_js_error(&err)))
}

fn map_write_error(err: JsValue) -> StorageError {
    let text = stringify_js_error(&err);
    if text.contains("QuotaExceeded") {
        quota_exceeded(text)
    } else {
        unavailable(format!("Web storage error: {text}"))
    }
}

struct StorageListenerHandle {
    target: EventTarget,
    callback: Closure<dyn FnMut(DomStorageEvent)>,
}

impl StorageListenerHandle {
    fn attach(target: EventTarget, callback: Closure<dyn FnMut(DomStorageEvent)>) -> StorageResult<Self> {
        target
            .add_event_listener_with_callback("storage", callback.as_ref().unchecked_ref())
            .map_err(map_js_error)?;
        Ok(Self { target, callback })
    }
}

impl Drop for StorageListenerHandle {
    fn drop(&mut self) {
        let _ = self
            .target
            .remove_event_listener_with_callback("storage", self.callback.as_ref().unchecked_ref());
    }
}

// The browser is single-threaded; the handle never crosses threads on wasm32.
unsafe impl Send for StorageListenerHandle {}
unsafe impl Sync for StorageListenerHandle {}
