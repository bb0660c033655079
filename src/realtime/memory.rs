use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::realtime::error::{not_connected, transport_error, RealtimeResult};
use crate::realtime::transport::{RealtimeTransport, TransportEvent, TransportSink};

#[derive(Default)]
struct MemoryTransportState {
    events: Option<TransportSink>,
    failures_remaining: u32,
    closes_on_open: u32,
    unreachable: bool,
    opens: u32,
    closes: u32,
    tokens: Vec<String>,
    emitted: Vec<(String, Value)>,
}

/// In-process transport driven by hand: tests and demos decide when opens fail, when the link drops
/// and which server events arrive.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryTransportState>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryTransport")
            .field("open", &state.events.is_some())
            .field("opens", &state.opens)
            .field("closes", &state.closes)
            .finish()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryTransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` opens fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.lock().failures_remaining = count;
    }

    /// Makes the next `count` opens succeed but report the link closed before `open` returns, like a
    /// server that accepts the handshake and then rejects the credential.
    pub fn close_during_next_opens(&self, count: u32) {
        self.lock().closes_on_open = count;
    }

    /// While set, every open fails.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Simulates the server going away. Returns `false` when no connection was open.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let events = self.lock().events.take();
        match events {
            Some(events) => {
                events(TransportEvent::Dropped {
                    reason: reason.to_owned(),
                });
                true
            }
            None => false,
        }
    }

    /// Delivers a server event on the open connection. Returns `false` when no connection was open.
    pub fn deliver(&self, event: &str, payload: Value) -> bool {
        let events = self.lock().events.clone();
        match events {
            Some(events) => {
                events(TransportEvent::Message {
                    event: event.to_owned(),
                    payload,
                });
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().events.is_some()
    }

    pub fn open_count(&self) -> u32 {
        self.lock().opens
    }

    pub fn close_count(&self) -> u32 {
        self.lock().closes
    }

    /// Credentials passed to every open, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.lock().tokens.clone()
    }

    /// Outbound events, in order.
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.lock().emitted.clone()
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
impl RealtimeTransport for MemoryTransport {
    async fn open(&self, token: &str, events: TransportSink) -> RealtimeResult<()> {
        {
            let mut state = self.lock();
            state.opens += 1;
            state.tokens.push(token.to_owned());
            if state.unreachable {
                return Err(transport_error("server unreachable"));
            }
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(transport_error("connection refused"));
            }
            if state.closes_on_open == 0 {
                state.events = Some(events);
                return Ok(());
            }
            state.closes_on_open -= 1;
        }
        events(TransportEvent::Dropped {
            reason: "closed by server: 4001 invalid token".to_owned(),
        });
        Ok(())
    }

    async fn close(&self) -> RealtimeResult<()> {
        let mut state = self.lock();
        state.events = None;
        state.closes += 1;
        Ok(())
    }

    async fn emit(&self, event: &str, payload: Value) -> RealtimeResult<()> {
        let mut state = self.lock();
        if state.events.is_none() {
            return Err(not_connected("memory transport is closed"));
        }
        state.emitted.push((event.to_owned(), payload));
        Ok(())
    }
}
