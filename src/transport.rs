//! Duplex realtime channel to the model.
//!
//! A [`Connector`] opens a [`Link`]: an outbound queue that never blocks the
//! caller and an inbound event stream. The websocket implementation splits
//! the socket into a writer task and a reader task, the same split
//! sink/stream arrangement the rest of the client was built around.

use crate::config::LiveConfig;
use crate::error::{LiveError, Result};
use crate::gemini::{BidiGenerateContentSetup, ClientMessage, ServerMessage};
use crate::uplink::MediaChunk;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Live,
    Done,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Error)
    }

    /// Apply an inbound event, returning the next state.
    pub fn on_event(self, event: &InboundEvent) -> Status {
        if self.is_terminal() {
            return self;
        }
        match (self, event) {
            (Status::Connecting, InboundEvent::Opened) => Status::Live,
            (_, InboundEvent::Error(_)) => Status::Error,
            (Status::Live, InboundEvent::Closed) => Status::Done,
            (Status::Connecting, InboundEvent::Closed) => Status::Error,
            (state, _) => state,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Connecting => "CONNECTING",
            Status::Live => "LIVE",
            Status::Done => "DONE",
            Status::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Everything the transport reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// The remote end acknowledged the session setup
    Opened,
    UserTranscript(String),
    ModelTranscript(String),
    /// Base64 PCM, 24 kHz mono
    AudioChunk(String),
    TurnComplete,
    Error(String),
    Closed,
}

#[derive(Debug, Clone)]
pub enum Outbound {
    Chunk(MediaChunk),
    Close,
}

/// Sending half of a link. Cloneable and non-blocking; there is no
/// backpressure signal, a send into a dead link is silently dropped.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl OutboundQueue {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    /// Queue a chunk. Returns `false` once the link is gone.
    pub fn send(&self, chunk: MediaChunk) -> bool {
        self.tx.send(Outbound::Chunk(chunk)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct Link {
    pub outbound: OutboundQueue,
    pub inbound: mpsc::UnboundedReceiver<InboundEvent>,
}

/// Opens links. `open` returns immediately; the open acknowledgement (or
/// failure) arrives later as an inbound event.
pub trait Connector: Send + Sync {
    fn open(&self) -> Result<Link>;
}

/// Connector for the Gemini Live websocket endpoint.
pub struct GeminiConnector {
    config: LiveConfig,
}

impl GeminiConnector {
    pub fn new(config: LiveConfig) -> Self {
        Self { config }
    }
}

impl Connector for GeminiConnector {
    fn open(&self) -> Result<Link> {
        if self.config.api_key.is_empty() {
            return Err(LiveError::Config("missing API key".to_string()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let url = self.config.websocket_url();
        let setup = BidiGenerateContentSetup::for_live(&self.config);
        let setup_timeout = self.config.setup_timeout;
        tokio::spawn(async move {
            run_connection(url, setup, setup_timeout, out_rx, in_tx).await;
        });

        Ok(Link {
            outbound: OutboundQueue::new(out_tx),
            inbound: in_rx,
        })
    }
}

async fn run_connection(
    url: String,
    setup: BidiGenerateContentSetup,
    setup_timeout: Duration,
    out_rx: mpsc::UnboundedReceiver<Outbound>,
    in_tx: mpsc::UnboundedSender<InboundEvent>,
) {
    let (sink, stream) = match establish(&url, setup, setup_timeout).await {
        Ok(halves) => halves,
        Err(e) => {
            error!("Failed to open live session: {}", e);
            let _ = in_tx.send(InboundEvent::Error(e));
            return;
        }
    };

    info!("Live session opened");
    if in_tx.send(InboundEvent::Opened).is_err() {
        return;
    }

    let writer = tokio::spawn(write_loop(sink, out_rx));
    read_loop(stream, &in_tx).await;
    writer.abort();
    info!("Live connection terminated");
}

/// Connect, send the setup frame and wait for `setupComplete`.
async fn establish(
    url: &str,
    setup: BidiGenerateContentSetup,
    setup_timeout: Duration,
) -> std::result::Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>), String> {
    info!("Connecting to Gemini Live API with model {}", setup.model);
    let (ws, resp) = connect_async(url).await.map_err(|e| e.to_string())?;
    debug!("WebSocket connection response: {:?}", resp.status());

    let (mut sink, mut stream) = ws.split();

    let json = ClientMessage::Setup(setup)
        .to_json()
        .map_err(|e| e.to_string())?;
    sink.send(Message::text(json))
        .await
        .map_err(|e| e.to_string())?;
    info!("Setup message sent, waiting for acknowledgment");

    let ack = async {
        while let Some(msg) = stream.next().await {
            match msg.map_err(|e| e.to_string())? {
                Message::Close(frame) => return Err(close_reason(frame.as_ref())),
                msg => {
                    if let Some(server) = decode_message(&msg) {
                        if server.is_setup_complete() {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Err::<(), String>("connection closed during setup".to_string())
    };

    tokio::time::timeout(setup_timeout, ack)
        .await
        .map_err(|_| "timed out waiting for setup acknowledgment".to_string())??;

    Ok((sink, stream))
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = out_rx.recv().await {
        match outbound {
            Outbound::Chunk(chunk) => {
                let mime = chunk.mime_type.clone();
                let json = match ClientMessage::from(chunk).to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Dropping unserializable chunk: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(json)).await {
                    warn!("Failed to send {} chunk: {}", mime, e);
                    return;
                }
            }
            Outbound::Close => break,
        }
    }

    debug!("Closing websocket");
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, in_tx: &mpsc::UnboundedSender<InboundEvent>) {
    while let Some(msg) = stream.next().await {
        let event_batch = match msg {
            Ok(Message::Close(frame)) => {
                info!("WebSocket closed: {:?}", frame);
                let event = match frame.as_ref() {
                    Some(f) if f.code != CloseCode::Normal => {
                        InboundEvent::Error(close_reason(Some(f)))
                    }
                    _ => InboundEvent::Closed,
                };
                let _ = in_tx.send(event);
                return;
            }
            Ok(msg) => match decode_message(&msg) {
                Some(server) => {
                    if server.go_away.is_some() {
                        warn!("Server announced it will disconnect soon");
                    }
                    server
                        .server_content
                        .map(|content| content.into_events())
                        .unwrap_or_default()
                }
                None => continue,
            },
            Err(e) => {
                error!("WebSocket error: {:?}", e);
                let _ = in_tx.send(InboundEvent::Error(e.to_string()));
                return;
            }
        };

        for event in event_batch {
            if in_tx.send(event).is_err() {
                return;
            }
        }
    }

    let _ = in_tx.send(InboundEvent::Closed);
}

/// Decode a text or binary frame as a server message. Binary frames carry
/// the same JSON.
fn decode_message(msg: &Message) -> Option<ServerMessage> {
    let text = match msg {
        Message::Text(text) => text.as_str().to_string(),
        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => text,
            Err(_) => {
                debug!("Ignoring non-UTF-8 binary message ({} bytes)", bytes.len());
                return None;
            }
        },
        _ => return None,
    };

    match ServerMessage::parse(&text) {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Failed to parse server message: {}", e);
            debug!("Raw message: {}", text);
            None
        }
    }
}

fn close_reason(frame: Option<&CloseFrame>) -> String {
    match frame {
        Some(f) if !f.reason.is_empty() => f.reason.as_str().to_string(),
        Some(f) => format!("connection closed with code {}", u16::from(f.code)),
        None => "connection closed".to_string(),
    }
}
