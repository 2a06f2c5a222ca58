//! WebSocket adapter for the connection registry.
//!
//! Client frames: `{"action":"subscribe","key":..}`, `{"action":"unsubscribe","key":..}`
//! and `{"action":"ping"}`. Server frames are always `{"event":..,"data":..}`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{
        Query, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connections::{ConnectionRegistry, PushTransport, TransportError};
use crate::application::error::AppError;
use crate::cache::lock_guard;

const SOURCE: &str = "realtime::ws";

/// Header carrying the caller's user id when it is not in the query string.
pub const USER_HEADER: &str = "x-user-id";

/// What the WebSocket route needs from application state.
#[derive(Clone)]
pub struct RealtimeHub {
    pub registry: Arc<ConnectionRegistry>,
    pub outbound_buffer: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    #[serde(default, alias = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerFrame {
    pub event: String,
    pub data: Value,
}

impl ServerFrame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::new("error", json!({ "message": message.into() }))
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientFrame {
    Subscribe { key: String },
    Unsubscribe { key: String },
    Ping,
}

/// Push transport backed by the socket's outbound queue.
///
/// Sends never block: a full queue fails that one delivery.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

#[async_trait]
impl PushTransport for ChannelTransport {
    async fn emit(&self, event: &str, payload: &Value) -> Result<(), TransportError> {
        let Some(tx) = lock_guard(&self.tx, SOURCE, "emit").clone() else {
            return Err(TransportError::Closed);
        };
        let text = ServerFrame::new(event, payload.clone())
            .to_text()
            .map_err(|err| TransportError::Send(err.to_string()))?;
        tx.try_send(text).map_err(|err| match err {
            TrySendError::Full(_) => TransportError::Send("outbound queue full".to_string()),
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn close(&self) {
        // Dropping the sender ends the socket's outbound loop.
        lock_guard(&self.tx, SOURCE, "close").take();
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<RealtimeHub>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user_id = params
        .user_id
        .or_else(|| {
            headers
                .get(USER_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .map(|user_id| user_id.trim().to_string())
        .filter(|user_id| !user_id.is_empty())
        .ok_or_else(|| AppError::validation("missing user id"))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, user_id)))
}

async fn handle_socket(socket: WebSocket, hub: RealtimeHub, user_id: String) {
    let (mut sender, mut receiver) = socket.split();

    if !hub.registry.can_accept(&user_id) {
        info!(user_id, "Refusing realtime connection over the per-user limit");
        let _ = sender.send(policy_close("connection limit reached")).await;
        return;
    }

    let conn_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::channel::<String>(hub.outbound_buffer.max(1));
    let transport = Arc::new(ChannelTransport::new(tx));
    if let Err(err) = hub.registry.register(&conn_id, &user_id, transport) {
        warn!(user_id, error = %err, "Realtime registration failed");
        let _ = sender.send(policy_close("connection limit reached")).await;
        return;
    }

    let hello = ServerFrame::new("connected", json!({ "connectionId": conn_id }));
    if let Ok(text) = hello.to_text() {
        let _ = sender.send(Message::Text(text.into())).await;
    }

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(text) = outbound else {
                    debug!(conn_id, "Outbound queue closed");
                    break;
                };
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        hub.registry.touch(&conn_id);
                        let reply = handle_client_frame(&hub.registry, &conn_id, text.as_str());
                        let Ok(text) = reply.to_text() else { continue };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        hub.registry.touch(&conn_id);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(conn_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(conn_id, error = %err, "WebSocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    hub.registry.remove(&conn_id);
}

fn policy_close(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: reason.into(),
    }))
}

/// Apply one client frame and build the reply.
fn handle_client_frame(registry: &ConnectionRegistry, conn_id: &str, text: &str) -> ServerFrame {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => return ServerFrame::error(format!("invalid frame: {err}")),
    };

    match frame {
        ClientFrame::Subscribe { key } => match registry.add_subscription(conn_id, &key) {
            Ok(()) => ServerFrame::new("subscribed", json!({ "key": key })),
            Err(err) => ServerFrame::error(err.to_string()),
        },
        ClientFrame::Unsubscribe { key } => match registry.remove_subscription(conn_id, &key) {
            Ok(()) => ServerFrame::new("unsubscribed", json!({ "key": key })),
            Err(err) => ServerFrame::error(err.to_string()),
        },
        ClientFrame::Ping => ServerFrame::new("pong", json!({})),
    }
}
