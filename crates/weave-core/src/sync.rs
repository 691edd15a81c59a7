//! Wire protocol and WebSocket transport for collaboration.
//!
//! Messages are JSON objects tagged by `type`. Document updates travel as
//! base64-encoded [`UpdateBatch`] bytes. The transport only moves text;
//! decoding and merging happen on the caller's event loop.

use crate::crdt::{DocError, PeerId, UpdateBatch};
use crate::model::{NodeId, UserId};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Messages sent to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a workspace.
    Join { workspace: String, user_id: UserId },
    /// Leave the current workspace.
    Leave,
    /// Document updates (base64 `UpdateBatch` bytes).
    Sync { data: String },
    /// Cursor, identity and selection of this client.
    Awareness {
        peer_id: PeerId,
        #[serde(flatten)]
        state: AwarenessState,
    },
}

/// Messages received from the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join confirmed.
    Joined {
        workspace: String,
        peer_count: usize,
        /// Merged state of the workspace, if it has any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<String>,
    },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// Updates from another peer.
    Sync { from: String, data: String },
    Awareness {
        from: String,
        peer_id: PeerId,
        #[serde(flatten)]
        state: AwarenessState,
    },
    Error { message: String },
}

/// What a peer is pointing at and who they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    /// World-space cursor position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selection: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: String,
}

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What handling a server message did to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Joined a workspace; `imported` entities changed when its snapshot
    /// was merged.
    Joined {
        workspace: String,
        peer_count: usize,
        imported: usize,
    },
    PeerJoined { peer_id: String },
    PeerLeft { peer_id: String },
    /// Remote updates merged; `applied` entities changed locally.
    SyncReceived { from: String, applied: usize },
    AwarenessReceived {
        from: String,
        peer_id: PeerId,
        state: AwarenessState,
    },
    Error { message: String },
}

/// Encode a batch for a `sync` or `joined` payload.
pub fn encode_batch(batch: &UpdateBatch) -> Result<String, DocError> {
    Ok(STANDARD.encode(batch.to_bytes()?))
}

/// Decode a `sync` or `joined` payload.
pub fn decode_batch(data: &str) -> Result<UpdateBatch, DocError> {
    let bytes = STANDARD
        .decode(data)
        .map_err(|e| DocError::Decode(format!("base64: {}", e)))?;
    UpdateBatch::from_bytes(&bytes)
}

/// Events from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Connected,
    Disconnected,
    /// A text frame, to be passed to the session.
    Message(String),
    Error(String),
}

#[cfg(not(target_arch = "wasm32"))]
mod native_client {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tungstenite::stream::MaybeTlsStream;
    use tungstenite::{Message, connect};
    use url::Url;

    const READ_POLL: Duration = Duration::from_millis(50);
    const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    enum WsCommand {
        Send(String),
        Close,
    }

    /// WebSocket client for native platforms.
    ///
    /// Socket I/O runs on a background thread. Frames are queued and handed
    /// out by [`poll_events`](Self::poll_events) so they can be merged on
    /// the event loop.
    pub struct NativeWebSocket {
        state: ConnectionState,
        cmd_tx: Option<Sender<WsCommand>>,
        event_rx: Option<Receiver<SocketEvent>>,
        _thread: Option<JoinHandle<()>>,
    }

    impl NativeWebSocket {
        pub fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }

        pub fn connect(&mut self, url: &str) -> Result<(), String> {
            if self.cmd_tx.is_some() {
                return Err("Already connected".to_string());
            }

            let parsed_url = Url::parse(url).map_err(|e| format!("Invalid URL: {}", e))?;
            if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
                return Err(format!("Invalid WebSocket URL scheme: {}", parsed_url.scheme()));
            }

            self.state = ConnectionState::Connecting;

            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<SocketEvent>();
            let url = url.to_string();

            let handle = thread::spawn(move || run_socket(&url, cmd_rx, event_tx));

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);
            Ok(())
        }

        pub fn disconnect(&mut self) {
            if let Some(tx) = self.cmd_tx.take() {
                let _ = tx.send(WsCommand::Close);
            }
            self.event_rx = None;
            self._thread = None;
            self.state = ConnectionState::Disconnected;
        }

        pub fn send(&self, msg: &str) -> Result<(), String> {
            match self.cmd_tx {
                Some(ref tx) => tx
                    .send(WsCommand::Send(msg.to_string()))
                    .map_err(|e| format!("Send failed: {}", e)),
                None => Err("Not connected".to_string()),
            }
        }

        /// Drain queued events without blocking.
        pub fn poll_events(&mut self) -> Vec<SocketEvent> {
            let mut events = Vec::new();
            if let Some(ref rx) = self.event_rx {
                while let Ok(event) = rx.try_recv() {
                    match &event {
                        SocketEvent::Connected => self.state = ConnectionState::Connected,
                        SocketEvent::Disconnected => self.state = ConnectionState::Disconnected,
                        SocketEvent::Error(_) => self.state = ConnectionState::Error,
                        SocketEvent::Message(_) => {}
                    }
                    events.push(event);
                }
            }
            events
        }

        pub fn state(&self) -> ConnectionState {
            self.state
        }

        pub fn is_connected(&self) -> bool {
            self.state == ConnectionState::Connected
        }
    }

    /// Socket thread body: connect, then alternate between draining queued
    /// commands and one short blocking read.
    fn run_socket(url: &str, commands: Receiver<WsCommand>, events: Sender<SocketEvent>) {
        let mut socket = match connect(url) {
            Ok((socket, response)) => {
                log::info!("Connected to relay {} ({})", url, response.status());
                socket
            }
            Err(e) => {
                log::error!("Could not reach relay {}: {}", url, e);
                let _ = events.send(SocketEvent::Error(format!("Connection failed: {}", e)));
                return;
            }
        };
        let _ = events.send(SocketEvent::Connected);

        if let MaybeTlsStream::Plain(tcp) = socket.get_mut() {
            let _ = tcp.set_read_timeout(Some(READ_POLL));
            let _ = tcp.set_write_timeout(Some(WRITE_TIMEOUT));
        }

        'io: loop {
            loop {
                match commands.try_recv() {
                    Ok(WsCommand::Send(text)) => {
                        if let Err(e) = socket.send(Message::Text(text)) {
                            log::error!("Relay write failed: {}", e);
                            break 'io;
                        }
                    }
                    Ok(WsCommand::Close) | Err(TryRecvError::Disconnected) => {
                        let _ = socket.close(None);
                        break 'io;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }

            let frame = match socket.read() {
                Ok(frame) => frame,
                Err(tungstenite::Error::Io(e))
                    if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("Relay read failed: {}", e);
                    break;
                }
            };
            match frame {
                Message::Text(text) => {
                    if events.send(SocketEvent::Message(text)).is_err() {
                        break;
                    }
                }
                Message::Ping(payload) => {
                    let _ = socket.send(Message::Pong(payload));
                }
                Message::Close(_) => {
                    log::info!("Relay closed the connection");
                    break;
                }
                _ => {}
            }
        }

        let _ = events.send(SocketEvent::Disconnected);
    }

    impl Default for NativeWebSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for NativeWebSocket {
        fn drop(&mut self) {
            self.disconnect();
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use native_client::NativeWebSocket;
