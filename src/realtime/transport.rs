use std::sync::Arc;

use serde_json::Value;

use crate::realtime::error::RealtimeResult;

/// Signals a transport pushes back to its owner once opened.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// The connection went away without being closed locally.
    Dropped { reason: String },
    /// A named application event from the server.
    Message { event: String, payload: Value },
}

pub type TransportSink = Arc<dyn Fn(TransportEvent) + Send + Sync + 'static>;

/// A single bidirectional connection to the realtime server.
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
pub trait RealtimeTransport: Send + Sync {
    /// Opens the connection with a bearer credential, resolving once the server accepted it. Events for
    /// this connection are delivered to `events` until it drops or [`RealtimeTransport::close`] is called.
    async fn open(&self, token: &str, events: TransportSink) -> RealtimeResult<()>;

    /// Closes the current connection, if any. No `Dropped` event is delivered for a local close.
    async fn close(&self) -> RealtimeResult<()>;

    async fn emit(&self, event: &str, payload: Value) -> RealtimeResult<()>;
}
