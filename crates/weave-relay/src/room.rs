//! Workspace rooms: who is connected, and the merged document state new
//! joiners are seeded with.

use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use weave_core::crdt::{DocError, DocState, UpdateBatch};
use weave_core::sync::{ServerMessage, decode_batch, encode_batch};

const CHANNEL_CAPACITY: usize = 256;

/// Peer id the relay uses as the origin of snapshots it sends.
const RELAY_ORIGIN: u64 = 0;

/// A frame on a room's broadcast channel, tagged with the sending peer.
pub type RoomFrame = (String, ServerMessage);

struct Room {
    tx: broadcast::Sender<RoomFrame>,
    peers: HashSet<String>,
    /// Every update relayed through this room, merged.
    state: DocState,
}

impl Room {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            peers: HashSet::new(),
            state: DocState::new(),
        }
    }

    fn snapshot(&self) -> Option<String> {
        let batch = self.state.to_batch(RELAY_ORIGIN);
        if batch.entries.is_empty() {
            return None;
        }
        match encode_batch(&batch) {
            Ok(data) => Some(data),
            Err(e) => {
                warn!("Failed to encode room snapshot: {}", e);
                None
            }
        }
    }
}

/// Result of joining a room.
pub struct Joined {
    pub rx: broadcast::Receiver<RoomFrame>,
    pub snapshot: Option<String>,
    pub peer_count: usize,
}

/// All rooms, keyed by workspace id.
#[derive(Default)]
pub struct Rooms {
    rooms: DashMap<String, Room>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to a workspace's room, creating it if needed.
    pub fn join(&self, workspace: &str, peer_id: &str) -> Joined {
        let mut room = self.rooms.entry(workspace.to_string()).or_insert_with(Room::new);
        room.peers.insert(peer_id.to_string());
        Joined {
            rx: room.tx.subscribe(),
            snapshot: room.snapshot(),
            peer_count: room.peers.len(),
        }
    }

    /// Remove a peer. The room and its state are dropped with the last
    /// peer. Returns true if the room was dropped.
    pub fn leave(&self, workspace: &str, peer_id: &str) -> bool {
        let empty = match self.rooms.get_mut(workspace) {
            Some(mut room) => {
                room.peers.remove(peer_id);
                room.peers.is_empty()
            }
            None => return false,
        };
        if empty {
            self.rooms.remove(workspace);
            debug!("Room {} closed", workspace);
        }
        empty
    }

    /// Decode a sync payload and merge it into the room state. Returns how
    /// many entities changed.
    pub fn merge(&self, workspace: &str, data: &str) -> Result<usize, DocError> {
        let batch = decode_batch(data)?;
        Ok(self.merge_batch(workspace, &batch))
    }

    pub fn merge_batch(&self, workspace: &str, batch: &UpdateBatch) -> usize {
        match self.rooms.get_mut(workspace) {
            Some(mut room) => room.state.merge_batch(batch),
            None => 0,
        }
    }

    /// Send a frame to every subscriber of a room, the sender included;
    /// receivers filter out their own frames.
    pub fn broadcast(&self, workspace: &str, from: &str, msg: ServerMessage) {
        if let Some(room) = self.rooms.get(workspace) {
            let _ = room.tx.send((from.to_string(), msg));
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn peer_count(&self, workspace: &str) -> usize {
        self.rooms.get(workspace).map_or(0, |room| room.peers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weave_core::crdt::{EntityKey, FieldValues, SharedDocument};

    fn payload(peer: u64, id: &str, content: &str) -> String {
        let mut doc = SharedDocument::new(peer);
        let mut fields = FieldValues::new();
        fields.insert("content".into(), json!(content));
        doc.put(EntityKey::node(id), fields).unwrap();
        encode_batch(&doc.take_pending().unwrap()).unwrap()
    }

    #[test]
    fn test_first_joiner_gets_no_snapshot() {
        let rooms = Rooms::new();
        let joined = rooms.join("ws", "p1");
        assert!(joined.snapshot.is_none());
        assert_eq!(joined.peer_count, 1);
    }

    #[test]
    fn test_late_joiner_gets_merged_state() {
        let rooms = Rooms::new();
        rooms.join("ws", "p1");
        assert_eq!(rooms.merge("ws", &payload(1, "a", "one")).unwrap(), 1);
        assert_eq!(rooms.merge("ws", &payload(2, "b", "two")).unwrap(), 1);

        let joined = rooms.join("ws", "p2");
        assert_eq!(joined.peer_count, 2);
        let batch = decode_batch(&joined.snapshot.unwrap()).unwrap();
        let mut doc = SharedDocument::new(3);
        doc.apply_remote(&batch);
        assert_eq!(doc.read(&EntityKey::node("a")).unwrap().get("content"), Some(&json!("one")));
        assert_eq!(doc.read(&EntityKey::node("b")).unwrap().get("content"), Some(&json!("two")));
    }

    #[test]
    fn test_bad_payload_is_rejected() {
        let rooms = Rooms::new();
        rooms.join("ws", "p1");
        assert!(rooms.merge("ws", "%%%").is_err());
        assert!(rooms.join("ws", "p2").snapshot.is_none());
    }

    #[test]
    fn test_last_leave_drops_room() {
        let rooms = Rooms::new();
        rooms.join("ws", "p1");
        rooms.join("ws", "p2");
        rooms.merge("ws", &payload(1, "a", "one")).unwrap();

        assert!(!rooms.leave("ws", "p1"));
        assert_eq!(rooms.peer_count("ws"), 1);
        assert!(rooms.leave("ws", "p2"));
        assert_eq!(rooms.room_count(), 0);
        assert!(rooms.join("ws", "p3").snapshot.is_none());
    }

    #[test]
    fn test_broadcast_reaches_room_only() {
        let rooms = Rooms::new();
        let mut a = rooms.join("a", "p1").rx;
        let mut b = rooms.join("b", "p2").rx;
        rooms.broadcast("a", "p1", ServerMessage::PeerLeft { peer_id: "p9".into() });

        let (from, msg) = a.try_recv().unwrap();
        assert_eq!(from, "p1");
        assert_eq!(msg, ServerMessage::PeerLeft { peer_id: "p9".into() });
        assert!(b.try_recv().is_err());
    }
}
