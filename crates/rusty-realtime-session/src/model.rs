//! Connection to the remote realtime model.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use rusty_realtime_core::config::RealtimeEndpoint;
use rusty_realtime_core::error::{RealtimeError, Result};
use rusty_realtime_core::protocol::Event;

/// Inbound model events. Decode failures are items; a transport failure is
/// the last item.
pub type EventStream = BoxStream<'static, Result<Event>>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of a model connection.
#[async_trait]
pub trait ModelSink: Send {
    /// Transmit one serialized event.
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<()>;
}

/// A live connection to the realtime endpoint.
///
/// The socket is released when the session is dropped, on every exit path.
/// [`ModelSession::close`] additionally performs the closing handshake.
pub struct ModelSession {
    sink: Box<dyn ModelSink>,
    events: Option<EventStream>,
    closed: bool,
}

impl ModelSession {
    /// Open an authenticated WebSocket to the endpoint.
    pub async fn connect(endpoint: &RealtimeEndpoint) -> Result<Self> {
        let url = endpoint_url(&endpoint.url, &endpoint.model);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::Config(format!("Invalid realtime URL {url}: {e}")))?;

        let headers = request.headers_mut();
        headers.insert("Authorization", header_value(&format!("Bearer {}", endpoint.api_key))?);
        headers.insert("OpenAI-Beta", header_value(&endpoint.protocol_version)?);

        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| RealtimeError::Transport(format!("connect to {url} failed: {e}")))?;
        info!(url = %endpoint.url, model = %endpoint.model, status = %response.status(), "Connected to realtime endpoint");

        let (sink, stream) = ws.split();
        Ok(Self::from_parts(Box::new(WsSink { sink }), decode_stream(stream)))
    }

    /// Assemble a session from an outbound sink and an inbound event stream.
    pub fn from_parts(sink: Box<dyn ModelSink>, events: EventStream) -> Self {
        Self {
            sink,
            events: Some(events),
            closed: false,
        }
    }

    /// Serialize and transmit an event.
    pub async fn send(&mut self, event: &Event) -> Result<()> {
        if self.closed {
            return Err(RealtimeError::Transport("connection is closed".into()));
        }
        debug!(event_type = event.event_type(), "Sending event to model");
        if let Err(e) = self.sink.send_text(event.to_wire()).await {
            self.closed = true;
            return Err(e);
        }
        Ok(())
    }

    /// Take the inbound event stream. Available once.
    pub fn receive(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the connection. Later sends fail with a transport error.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink.close().await
    }
}

fn endpoint_url(base: &str, model: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{base}{sep}model={model}")
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| RealtimeError::Config(format!("Invalid header value: {e}")))
}

struct WsSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl ModelSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| RealtimeError::Transport(e.to_string()))
    }
}

/// Decode each text frame as one event. Ends on a close frame; a socket
/// error is yielded once and ends the stream.
fn decode_stream(stream: SplitStream<WsStream>) -> EventStream {
    stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return Some((Event::parse(text.as_str()), Some(stream))),
                Some(Ok(Message::Binary(bytes))) => {
                    let decoded = std::str::from_utf8(&bytes)
                        .map_err(|e| RealtimeError::Decode(format!("binary frame is not UTF-8: {e}")))
                        .and_then(Event::parse);
                    return Some((decoded, Some(stream)));
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Realtime endpoint closed the connection");
                    return None;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!(%e, "Realtime connection failed");
                    return Some((Err(RealtimeError::Transport(e.to_string())), None));
                }
                None => return None,
            }
        }
    })
    .boxed()
}
