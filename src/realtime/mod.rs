//! # Realtime connection manager
//!
//! [`ConnectionManager`] owns the single server link of a tab:
//!
//! ```text
//! Disconnected --connect()--> Connecting --(accepted)--> Connected
//! Connected --(transport drop)--> Reconnecting --(attempt succeeds)--> Connected
//! Reconnecting --(attempts exhausted)--> Disconnected
//! any --disconnect()--> Disconnected
//! ```
//!
//! Reconnection uses a bounded [`BackoffState`]; a successful connect resets the attempt counter. Every
//! time the link comes up (the first connect included) the resync callbacks run in registration order,
//! each isolated so a panicking callback cannot starve the others. Rooms joined through the manager are
//! re-joined on every connect.

pub mod error;
mod memory;
pub mod notice;
pub mod resync;
mod transport;
#[cfg(not(target_arch = "wasm32"))]
mod websocket;

use std::collections::BTreeSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use async_lock::Mutex as AsyncMutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

pub use error::{RealtimeError, RealtimeErrorCode, RealtimeResult};
pub use memory::MemoryTransport;
pub use notice::{LoggingNoticeSink, Notice, NoticeLevel, NoticeSink, RecordingNoticeSink};
pub use resync::{register_query_resync, QueryCache};
pub use transport::{RealtimeTransport, TransportEvent, TransportSink};
#[cfg(not(target_arch = "wasm32"))]
pub use websocket::WebSocketTransport;

use crate::logger::Logger;
use crate::options::ReconnectOptions;
use crate::platform::runtime::{sleep, spawn_detached};
use crate::realtime::error::{cancelled, invalid_argument, not_connected, transport_error};
use crate::util::{BackoffState, ListenerSet, Subscription};

static REALTIME_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/realtime"));

pub const JOIN_ROOM_EVENT: &str = "join_room";
pub const LEAVE_ROOM_EVENT: &str = "leave_room";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies an event handler or resync callback for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync + 'static>;
pub type ResyncCallback = Arc<dyn Fn() + Send + Sync + 'static>;

struct Registry {
    state: ConnectionState,
    /// Bumped by `connect` and `disconnect`; events and retry loops from older generations are ignored.
    generation: u64,
    token: Option<String>,
    attempts: u32,
    /// Set when the live connection dropped, cleared once it is restored.
    dropped: bool,
    /// Bumped by every open and by `disconnect`; transport events carry the link they belong to.
    link: u64,
    /// Drop reported by the transport before the current link was up.
    pending_drop: Option<String>,
    next_id: u64,
    handlers: Vec<(HandlerId, String, EventHandler)>,
    resync: Vec<(HandlerId, ResyncCallback)>,
    rooms: BTreeSet<String>,
}

impl Registry {
    fn next_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

struct ManagerInner {
    transport: Arc<dyn RealtimeTransport>,
    reconnect: ReconnectOptions,
    notices: Arc<dyn NoticeSink>,
    attempt_lock: AsyncMutex<()>,
    registry: Mutex<Registry>,
    state_listeners: ListenerSet<ConnectionState>,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry();
        f.debug_struct("ConnectionManager")
            .field("state", &registry.state)
            .field("attempts", &registry.attempts)
            .field("handlers", &registry.handlers.len())
            .field("resync_callbacks", &registry.resync.len())
            .field("rooms", &registry.rooms)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, reconnect: ReconnectOptions) -> Self {
        Self::with_notices(transport, reconnect, Arc::new(LoggingNoticeSink))
    }

    pub fn with_notices(
        transport: Arc<dyn RealtimeTransport>,
        reconnect: ReconnectOptions,
        notices: Arc<dyn NoticeSink>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                reconnect,
                notices,
                attempt_lock: AsyncMutex::new(()),
                registry: Mutex::new(Registry {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    token: None,
                    attempts: 0,
                    dropped: false,
                    link: 0,
                    pending_drop: None,
                    next_id: 0,
                    handlers: Vec::new(),
                    resync: Vec::new(),
                    rooms: BTreeSet::new(),
                }),
                state_listeners: ListenerSet::new(),
            }),
        }
    }

    /// Manager over a native websocket to `options.url`.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn websocket(options: &crate::options::RealtimeOptions) -> RealtimeResult<Self> {
        let transport = WebSocketTransport::new(&options.url)?;
        Ok(Self::new(Arc::new(transport), options.reconnect))
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.registry().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Reconnection attempts made since the link was last up.
    pub fn reconnect_attempts(&self) -> u32 {
        self.registry().attempts
    }

    /// Calls `listener` on every state transition.
    pub fn watch_state<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.inner.state_listeners.add(Arc::new(listener))
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = swap_state(&mut self.registry(), next);
        if changed {
            self.announce_state(next);
        }
    }

    fn announce_state(&self, next: ConnectionState) {
        REALTIME_LOGGER.debug(format!("connection state: {next}"));
        self.inner.state_listeners.emit(&next);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.registry().generation == generation
    }

    /// Opens the link with `token`. Does nothing when already connected.
    ///
    /// When the first attempt fails the error is returned and the manager keeps retrying in the
    /// background under the reconnection policy.
    pub async fn connect(&self, token: &str) -> RealtimeResult<()> {
        if token.is_empty() {
            return Err(invalid_argument("connect requires a non-empty token"));
        }

        let _attempt = self.inner.attempt_lock.lock().await;
        let generation = {
            let mut registry = self.registry();
            if registry.state == ConnectionState::Connected {
                return Ok(());
            }
            registry.generation += 1;
            registry.token = Some(token.to_owned());
            registry.attempts = 0;
            registry.dropped = false;
            registry.generation
        };
        self.set_state(ConnectionState::Connecting);

        match self.attempt(generation).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if err.code != RealtimeErrorCode::Cancelled && self.is_current(generation) {
                    REALTIME_LOGGER.warn(format!("connection failed: {err}"));
                    self.begin_reconnect(generation);
                }
                Err(err)
            }
        }
    }

    async fn attempt(&self, generation: u64) -> RealtimeResult<()> {
        let token = self
            .registry()
            .token
            .clone()
            .ok_or_else(|| cancelled("no credential to connect with"))?;
        let link = {
            let mut registry = self.registry();
            registry.link += 1;
            registry.pending_drop = None;
            registry.link
        };
        let events = self.transport_sink(generation, link);
        self.inner.transport.open(&token, events).await?;

        if !self.is_current(generation) {
            self.close_quietly("superseded").await;
            return Err(cancelled("connection attempt superseded"));
        }

        if let Err(err) = self.on_connected(link).await {
            self.close_quietly("dead").await;
            return Err(err);
        }
        Ok(())
    }

    async fn close_quietly(&self, what: &str) {
        if let Err(err) = self.inner.transport.close().await {
            REALTIME_LOGGER.debug(format!("failed to close {what} connection: {err}"));
        }
    }

    /// Marks the link up unless the transport already reported it closed while opening.
    async fn on_connected(&self, link: u64) -> RealtimeResult<()> {
        let (rooms, restored, changed) = {
            let mut registry = self.registry();
            if registry.link != link {
                return Err(cancelled("connection attempt superseded"));
            }
            if let Some(reason) = registry.pending_drop.take() {
                return Err(transport_error(format!("connection closed while opening: {reason}")));
            }
            registry.attempts = 0;
            let restored = std::mem::take(&mut registry.dropped);
            let changed = swap_state(&mut registry, ConnectionState::Connected);
            (registry.rooms.iter().cloned().collect::<Vec<_>>(), restored, changed)
        };
        if changed {
            self.announce_state(ConnectionState::Connected);
        }

        for room in rooms {
            if let Err(err) = self
                .inner
                .transport
                .emit(JOIN_ROOM_EVENT, json!({ "room": room }))
                .await
            {
                REALTIME_LOGGER.warn(format!("failed to re-join room '{room}': {err}"));
            }
        }
        if restored {
            self.inner.notices.notify(Notice::info("Connection restored."));
        }
        self.run_resync();
        Ok(())
    }

    fn run_resync(&self) {
        let callbacks = self.registry().resync.clone();
        for (id, callback) in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                REALTIME_LOGGER.error(format!("resync callback {} panicked", id.0));
            }
        }
    }

    fn transport_sink(&self, generation: u64, link: u64) -> TransportSink {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |event| {
            if let Some(inner) = inner.upgrade() {
                ConnectionManager { inner }.handle_event(generation, link, event);
            }
        })
    }

    fn handle_event(&self, generation: u64, link: u64, event: TransportEvent) {
        {
            let registry = self.registry();
            if registry.generation != generation || registry.link != link {
                return;
            }
        }
        match event {
            TransportEvent::Message { event, payload } => self.dispatch(&event, &payload),
            TransportEvent::Dropped { reason } => {
                {
                    let mut registry = self.registry();
                    if registry.state != ConnectionState::Connected {
                        REALTIME_LOGGER.debug(format!("connection closed while opening: {reason}"));
                        registry.pending_drop = Some(reason);
                        return;
                    }
                    registry.dropped = true;
                }
                REALTIME_LOGGER.warn(format!("connection dropped: {reason}"));
                self.inner
                    .notices
                    .notify(Notice::warning("Connection lost. Reconnecting..."));
                self.begin_reconnect(generation);
            }
        }
    }

    fn dispatch(&self, event: &str, payload: &Value) {
        let handlers: Vec<EventHandler> = self
            .registry()
            .handlers
            .iter()
            .filter(|(_, name, _)| name == event)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(payload);
        }
    }

    fn begin_reconnect(&self, generation: u64) {
        self.set_state(ConnectionState::Reconnecting);
        let manager = self.clone();
        spawn_detached(async move {
            manager.reconnect_loop(generation).await;
        });
    }

    async fn reconnect_loop(&self, generation: u64) {
        let mut backoff = BackoffState::new(self.inner.reconnect);
        while let Some(delay) = backoff.next_delay() {
            {
                let mut registry = self.registry();
                if registry.generation != generation {
                    return;
                }
                registry.attempts = backoff.attempts();
            }
            REALTIME_LOGGER.debug(format!(
                "reconnect attempt {} in {}ms",
                backoff.attempts(),
                delay.as_millis()
            ));
            sleep(delay).await;

            let _attempt = self.inner.attempt_lock.lock().await;
            if !self.is_current(generation) {
                return;
            }
            match self.attempt(generation).await {
                Ok(()) => return,
                Err(err) => REALTIME_LOGGER.debug(format!("reconnect attempt {} failed: {err}", backoff.attempts())),
            }
        }

        if !self.is_current(generation) {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        REALTIME_LOGGER.error(format!("giving up after {} reconnect attempts", backoff.attempts()));
        self.inner.notices.notify(Notice::error(
            "Unable to reach the server. Showing saved data until the connection returns.",
        ));
    }

    /// Tears the link down and forgets every handler, resync callback and room. State watchers stay.
    pub async fn disconnect(&self) -> RealtimeResult<()> {
        {
            let mut registry = self.registry();
            registry.generation += 1;
            registry.link += 1;
            registry.pending_drop = None;
            registry.token = None;
            registry.attempts = 0;
            registry.dropped = false;
            registry.handlers.clear();
            registry.resync.clear();
            registry.rooms.clear();
        }
        self.set_state(ConnectionState::Disconnected);
        self.inner.transport.close().await
    }

    /// Registers `handler` for server events named `event`.
    pub fn on<F>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        let id = registry.next_id();
        registry.handlers.push((id, event.into(), Arc::new(handler)));
        id
    }

    /// Like [`ConnectionManager::on`], decoding the payload into `T` first. Payloads that do not decode
    /// are logged and skipped.
    pub fn on_typed<T, F>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let event = event.into();
        let name = event.clone();
        self.on(event, move |payload| match T::deserialize(payload) {
            Ok(decoded) => handler(decoded),
            Err(err) => REALTIME_LOGGER.warn(format!("dropping '{name}' event: {err}")),
        })
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut registry = self.registry();
        let before = registry.handlers.len();
        registry.handlers.retain(|(handler_id, _, _)| *handler_id != id);
        registry.handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.registry().handlers.len()
    }

    /// Registers a callback run after every successful connect.
    pub fn on_reconnect<F>(&self, callback: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        let id = registry.next_id();
        registry.resync.push((id, Arc::new(callback)));
        id
    }

    pub fn off_reconnect(&self, id: HandlerId) -> bool {
        let mut registry = self.registry();
        let before = registry.resync.len();
        registry.resync.retain(|(callback_id, _)| *callback_id != id);
        registry.resync.len() != before
    }

    pub fn resync_count(&self) -> usize {
        self.registry().resync.len()
    }

    pub async fn emit(&self, event: &str, payload: Value) -> RealtimeResult<()> {
        if event.is_empty() {
            return Err(invalid_argument("event name must not be empty"));
        }
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(not_connected(format!("cannot emit '{event}' while {state}")));
        }
        self.inner.transport.emit(event, payload).await
    }

    /// Joins `room` now if connected, and again after every reconnect.
    pub async fn join_room(&self, room: &str) -> RealtimeResult<()> {
        if room.is_empty() {
            return Err(invalid_argument("room name must not be empty"));
        }
        let connected = {
            let mut registry = self.registry();
            registry.rooms.insert(room.to_owned());
            registry.state == ConnectionState::Connected
        };
        if connected {
            self.inner
                .transport
                .emit(JOIN_ROOM_EVENT, json!({ "room": room }))
                .await
        } else {
            Ok(())
        }
    }

    pub async fn leave_room(&self, room: &str) -> RealtimeResult<()> {
        let (was_joined, connected) = {
            let mut registry = self.registry();
            (registry.rooms.remove(room), registry.state == ConnectionState::Connected)
        };
        if was_joined && connected {
            self.inner
                .transport
                .emit(LEAVE_ROOM_EVENT, json!({ "room": room }))
                .await
        } else {
            Ok(())
        }
    }

    pub fn rooms(&self) -> Vec<String> {
        self.registry().rooms.iter().cloned().collect()
    }
}

fn swap_state(registry: &mut Registry, next: ConnectionState) -> bool {
    if registry.state == next {
        return false;
    }
    registry.state = next;
    true
}
