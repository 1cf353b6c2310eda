use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::get,
    Extension, Router,
};
use futures::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::server::app::{AppServer, Stage};

const CHANNEL_CAPACITY: usize = 256;

/// Envelope for everything sent over the socket in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl SocketEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Fan-out of server events to every connected socket.
#[derive(Clone)]
pub struct SocketHub {
    sender: broadcast::Sender<SocketEvent>,
    connected: Arc<AtomicUsize>,
}

impl Default for SocketHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            connected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Broadcast an event. Returns how many subscribers received it.
    pub fn emit(&self, event: impl Into<String>, data: Value) -> usize {
        self.sender.send(SocketEvent::new(event, data)).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SocketEvent> {
        self.sender.subscribe()
    }

    /// Number of open websocket connections.
    pub fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }
}

/// What to do with one text frame received from a client.
#[derive(Debug, PartialEq)]
pub(crate) enum FrameAction {
    Reply(SocketEvent),
    Broadcast(SocketEvent),
}

pub(crate) fn handle_frame(text: &str) -> FrameAction {
    match serde_json::from_str::<SocketEvent>(text) {
        Ok(event) if event.event == "ping" => {
            FrameAction::Reply(SocketEvent::new("pong", event.data))
        }
        Ok(event) if event.event.trim().is_empty() => FrameAction::Reply(SocketEvent::new(
            "error",
            json!({ "message": "event name must not be empty" }),
        )),
        Ok(event) => FrameAction::Broadcast(event),
        Err(e) => FrameAction::Reply(SocketEvent::new(
            "error",
            json!({ "message": format!("malformed frame: {e}") }),
        )),
    }
}

pub struct SocketManager;

impl SocketManager {
    /// Step h: mount the `/socket` endpoint and expose the hub to handlers.
    pub fn connect_socket(server: &mut AppServer) -> Result<()> {
        server.expect_next(Stage::SocketAttached)?;

        let hub = server.socket_hub().clone();
        server.merge(Router::new().route("/socket", get(socket_handler)));
        server.decorate(move |router| router.layer(Extension(hub)));

        info!("Socket endpoint mounted at /socket");
        server.advance(Stage::SocketAttached)?;
        Ok(())
    }
}

async fn socket_handler(ws: WebSocketUpgrade, Extension(hub): Extension<SocketHub>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: SocketHub) {
    let total = hub.connected.fetch_add(1, Ordering::SeqCst) + 1;
    info!("Socket client connected ({} open)", total);

    let (mut sink, mut stream) = socket.split();
    let mut events = hub.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Socket client lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match handle_frame(text.as_str()) {
                    FrameAction::Reply(reply) => {
                        if send_event(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                    FrameAction::Broadcast(event) => {
                        debug!("Re-broadcasting socket event '{}'", event.event);
                        let _ = hub.sender.send(event);
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket receive error: {}", e);
                    break;
                }
            },
        }
    }

    let remaining = hub.connected.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
    info!("Socket client disconnected ({} open)", remaining);
}

async fn send_event<S>(sink: &mut S, event: &SocketEvent) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Could not encode socket event '{}': {}", event.event, e);
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await
}
