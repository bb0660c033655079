use std::sync::LazyLock;

use async_lock::Mutex as AsyncMutex;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::logger::Logger;
use crate::realtime::error::{invalid_argument, not_connected, transport_error, RealtimeResult};
use crate::realtime::transport::{RealtimeTransport, TransportEvent, TransportSink};

static WEBSOCKET_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/realtime/websocket"));

type TcpWebSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WebSocketSink = SplitSink<TcpWebSocket, Message>;

/// Wire frame for both directions: `{"event": "...", "data": ...}`.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Native websocket transport. Authenticates with an `Authorization: Bearer` header and exchanges JSON
/// [`Frame`]s as text messages.
#[derive(Debug)]
pub struct WebSocketTransport {
    url: Url,
    sink: AsyncMutex<Option<WebSocketSink>>,
    reader: AsyncMutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Accepts `ws(s)://` URLs; `http(s)://` URLs are mapped onto their websocket scheme.
    pub fn new(url: &str) -> RealtimeResult<Self> {
        let mut url = Url::parse(url).map_err(|err| invalid_argument(format!("invalid realtime url '{url}': {err}")))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => return Err(invalid_argument(format!("unsupported realtime url scheme '{other}'"))),
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|_| invalid_argument(format!("cannot use '{url}' as a websocket url")))?;
        }
        Ok(Self {
            url,
            sink: AsyncMutex::new(None),
            reader: AsyncMutex::new(None),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn stop_reader(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
    }
}

fn dispatch_text(events: &TransportSink, text: &str) {
    match serde_json::from_str::<Frame>(text) {
        Ok(frame) => events(TransportEvent::Message {
            event: frame.event,
            payload: frame.data,
        }),
        Err(err) => log::debug!("ignoring malformed realtime frame: {err}"),
    }
}

#[async_trait::async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn open(&self, token: &str, events: TransportSink) -> RealtimeResult<()> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| invalid_argument(format!("invalid websocket request: {err}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| invalid_argument(format!("token is not a valid header value: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|err| transport_error(format!("failed to connect websocket: {err}")))?;
        let (sink, mut reader) = stream.split();

        self.stop_reader().await;
        *self.sink.lock().await = Some(sink);

        let reader_task = tokio::spawn(async move {
            let mut reason = String::from("connection closed by server");
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => dispatch_text(&events, &text),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => dispatch_text(&events, &text),
                        Err(_) => log::debug!("dropping non-UTF8 binary realtime frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            reason = format!("closed by server: {} {}", frame.code, frame.reason);
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::warn!("realtime websocket read failed: {err}");
                        reason = err.to_string();
                        break;
                    }
                }
            }
            events(TransportEvent::Dropped { reason });
        });
        *self.reader.lock().await = Some(reader_task);

        WEBSOCKET_LOGGER.debug(format!("connected to {}", self.url));
        Ok(())
    }

    async fn close(&self) -> RealtimeResult<()> {
        self.stop_reader().await;
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            sink.close()
                .await
                .map_err(|err| transport_error(format!("failed to close websocket: {err}")))?;
        }
        Ok(())
    }

    async fn emit(&self, event: &str, payload: Value) -> RealtimeResult<()> {
        let text = serde_json::to_string(&Frame {
            event: event.to_owned(),
            data: payload,
        })
        .map_err(|err| invalid_argument(format!("failed to encode '{event}': {err}")))?;

        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| not_connected("websocket is not open"))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|err| transport_error(format!("failed to send '{event}': {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn maps_http_schemes_onto_websocket_schemes() {
        assert_eq!(WebSocketTransport::new("https://api.example.test/socket").unwrap().url().scheme(), "wss");
        assert_eq!(WebSocketTransport::new("ws://localhost:4000").unwrap().url().scheme(), "ws");
        assert!(WebSocketTransport::new("ftp://example.test").is_err());
        assert!(WebSocketTransport::new("not a url").is_err());
    }

    #[test]
    fn frames_are_dispatched_as_messages() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let events: TransportSink = Arc::new(move |event| sink.lock().unwrap().push(event));

        dispatch_text(&events, r#"{"event":"order:updated","data":{"id":"o1"}}"#);
        dispatch_text(&events, r#"{"event":"ping"}"#);
        dispatch_text(&events, "not json");

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [
                TransportEvent::Message {
                    event: "order:updated".into(),
                    payload: json!({"id": "o1"}),
                },
                TransportEvent::Message {
                    event: "ping".into(),
                    payload: Value::Null,
                },
            ]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn emit_before_open_is_rejected() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:9").unwrap();
        let err = transport.emit("ping", Value::Null).await.unwrap_err();
        assert_eq!(err.code_str(), "realtime/not-connected");
        transport.close().await.unwrap();
    }
}
