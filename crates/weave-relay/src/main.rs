//! Weave WebSocket Relay Server
//!
//! Relays document updates and awareness between clients editing the same
//! workspace, and keeps each workspace's merged state so late joiners
//! start from everything sent so far.
//!
//! ## Protocol
//!
//! Messages are JSON with the following format:
//! ```json
//! { "type": "join", "workspace": "ws-id", "user_id": "alice" }
//! { "type": "sync", "data": "<base64-encoded-update-batch>" }
//! { "type": "awareness", "peer_id": 123, "cursor": { "x": 100, "y": 200 } }
//! ```

mod room;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use room::{RoomFrame, Rooms};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;
use weave_core::crdt::UpdateBatch;
use weave_core::sync::{ClientMessage, ServerMessage, encode_batch};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weave_relay=info,tower_http=info".into()),
        )
        .init();

    let rooms = Arc::new(Rooms::new());

    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(rooms);

    let addr = listen_addr();
    info!("Weave relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

/// `WEAVE_RELAY_ADDR`, or the default when unset or unparseable.
fn listen_addr() -> SocketAddr {
    let fallback = SocketAddr::from(([0, 0, 0, 0], 3030));
    match std::env::var("WEAVE_RELAY_ADDR") {
        Ok(raw) => raw.parse().unwrap_or_else(|e| {
            warn!("Ignoring WEAVE_RELAY_ADDR={}: {} (using {})", raw, e, fallback);
            fallback
        }),
        Err(_) => fallback,
    }
}

async fn index() -> &'static str {
    "Weave Relay Server - Connect via WebSocket at /ws"
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(rooms): State<Arc<Rooms>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, rooms))
}

fn frame(msg: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to serialize {:?}: {}", msg, e);
            None
        }
    }
}

/// Per-connection state.
struct Peer {
    id: String,
    workspace: Option<String>,
    rx: Option<broadcast::Receiver<RoomFrame>>,
}

impl Peer {
    fn leave(&mut self, rooms: &Rooms) {
        if let Some(workspace) = self.workspace.take() {
            rooms.broadcast(
                &workspace,
                &self.id,
                ServerMessage::PeerLeft {
                    peer_id: self.id.clone(),
                },
            );
            rooms.leave(&workspace, &self.id);
            info!("Peer {} left workspace {}", self.id, workspace);
        }
        self.rx = None;
    }

    /// Handle one client message. Returns a reply for this client only.
    fn handle(&mut self, msg: ClientMessage, rooms: &Rooms) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Join { workspace, user_id } => {
                self.leave(rooms);
                let joined = rooms.join(&workspace, &self.id);
                self.rx = Some(joined.rx);
                self.workspace = Some(workspace.clone());
                rooms.broadcast(
                    &workspace,
                    &self.id,
                    ServerMessage::PeerJoined {
                        peer_id: self.id.clone(),
                    },
                );
                info!("Peer {} ({}) joined workspace {}", self.id, user_id, workspace);
                Some(ServerMessage::Joined {
                    workspace,
                    peer_count: joined.peer_count,
                    snapshot: joined.snapshot,
                })
            }
            ClientMessage::Leave => {
                self.leave(rooms);
                None
            }
            ClientMessage::Sync { data } => {
                let workspace = self.workspace.as_ref()?;
                match rooms.merge(workspace, &data) {
                    Ok(changed) => {
                        debug!("Peer {} sent update changing {} entities", self.id, changed);
                        rooms.broadcast(
                            workspace,
                            &self.id,
                            ServerMessage::Sync {
                                from: self.id.clone(),
                                data,
                            },
                        );
                        None
                    }
                    Err(e) => {
                        warn!("Rejected update from {}: {}", self.id, e);
                        Some(ServerMessage::Error {
                            message: format!("Invalid update: {}", e),
                        })
                    }
                }
            }
            ClientMessage::Awareness { peer_id, state } => {
                let workspace = self.workspace.as_ref()?;
                rooms.broadcast(
                    workspace,
                    &self.id,
                    ServerMessage::Awareness {
                        from: self.id.clone(),
                        peer_id,
                        state,
                    },
                );
                None
            }
        }
    }

    /// Raw `UpdateBatch` bytes sent as a binary frame.
    fn handle_binary(&mut self, bytes: &[u8], rooms: &Rooms) -> Option<ServerMessage> {
        let data = UpdateBatch::from_bytes(bytes).and_then(|batch| encode_batch(&batch));
        match data {
            Ok(data) => self.handle(ClientMessage::Sync { data }, rooms),
            Err(e) => Some(ServerMessage::Error {
                message: format!("Invalid update: {}", e),
            }),
        }
    }
}

async fn handle_socket(socket: WebSocket, rooms: Arc<Rooms>) {
    let mut peer = Peer {
        id: Uuid::new_v4().to_string(),
        workspace: None,
        rx: None,
    };
    info!("New connection: {}", peer.id);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let reply = match msg {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => peer.handle(client_msg, &rooms),
                        Err(e) => {
                            warn!("Invalid message from {}: {}", peer.id, e);
                            Some(ServerMessage::Error {
                                message: format!("Invalid message: {}", e),
                            })
                        }
                    },
                    Some(Ok(Message::Binary(bytes))) => peer.handle_binary(&bytes, &rooms),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", peer.id, e);
                        break;
                    }
                };
                if let Some(out) = reply.as_ref().and_then(frame) {
                    if sender.send(out).await.is_err() {
                        break;
                    }
                }
            }

            msg = async {
                match &mut peer.rx {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match msg {
                    Ok((from, server_msg)) => {
                        // Don't echo back to sender
                        if from == peer.id {
                            continue;
                        }
                        if let Some(out) = frame(&server_msg) {
                            if sender.send(out).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Peer {} lagged, {} frames dropped; asking it to rejoin", peer.id, skipped);
                        let notice = ServerMessage::Error {
                            message: format!("Missed {} updates, rejoin to resync", skipped),
                        };
                        if let Some(out) = frame(&notice) {
                            if sender.send(out).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => peer.rx = None,
                }
            }
        }
    }

    peer.leave(&rooms);
    info!("Connection closed: {}", peer.id);
}
