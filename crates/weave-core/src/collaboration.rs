//! Collaboration session: joins a workspace over the relay and moves
//! document updates in and out.
//!
//! The session owns no document. Updates are drained from and merged into
//! the caller's [`SharedDocument`], so every merge runs on the caller's
//! event loop and reaches the store through the sync bridge.

use crate::crdt::{PeerId, SharedDocument, UpdateBatch};
use crate::model::{NodeId, UserId};
use crate::sync::{
    AwarenessState, ClientMessage, CursorPosition, ServerMessage, SyncEvent, UserInfo, decode_batch, encode_batch,
};
use std::collections::BTreeMap;

/// Last known awareness of a remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub peer_id: PeerId,
    pub state: AwarenessState,
}

pub struct CollaborationSession {
    peer_id: PeerId,
    user_id: UserId,
    /// Workspace confirmed by the relay.
    workspace: Option<String>,
    /// Workspace asked for but not yet confirmed.
    requested: Option<String>,
    awareness: AwarenessState,
    peers: BTreeMap<String, PeerPresence>,
    outgoing: Vec<String>,
}

impl CollaborationSession {
    pub fn new(peer_id: PeerId, user_id: impl Into<UserId>) -> Self {
        Self {
            peer_id,
            user_id: user_id.into(),
            workspace: None,
            requested: None,
            awareness: AwarenessState::default(),
            peers: BTreeMap::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    pub fn is_joined(&self) -> bool {
        self.workspace.is_some()
    }

    // --- Workspace membership ---

    /// Ask the relay to join a workspace.
    pub fn join(&mut self, workspace: &str) {
        self.requested = Some(workspace.to_string());
        self.push(&ClientMessage::Join {
            workspace: workspace.to_string(),
            user_id: self.user_id.clone(),
        });
    }

    pub fn leave(&mut self) {
        if self.workspace.is_some() || self.requested.is_some() {
            self.push(&ClientMessage::Leave);
        }
        self.workspace = None;
        self.requested = None;
        self.peers.clear();
    }

    // --- Outgoing ---

    /// Queue the document's unsent local writes. Does nothing until the
    /// join is confirmed, so offline writes stay in the document's outbox.
    pub fn queue_updates(&mut self, doc: &mut SharedDocument) -> bool {
        if !self.is_joined() {
            return false;
        }
        match doc.take_pending() {
            Some(batch) => self.queue_batch(&batch),
            None => false,
        }
    }

    fn queue_batch(&mut self, batch: &UpdateBatch) -> bool {
        match encode_batch(batch) {
            Ok(data) => {
                self.push(&ClientMessage::Sync { data });
                true
            }
            Err(e) => {
                log::error!("Failed to encode update batch: {}", e);
                false
            }
        }
    }

    /// Drain queued messages (JSON text frames).
    pub fn take_outgoing(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    fn push(&mut self, msg: &ClientMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => self.outgoing.push(json),
            Err(e) => log::error!("Failed to serialize client message: {}", e),
        }
    }

    // --- Awareness ---

    pub fn set_cursor(&mut self, x: f64, y: f64) {
        self.awareness.cursor = Some(CursorPosition { x, y });
        self.queue_awareness();
    }

    pub fn clear_cursor(&mut self) {
        self.awareness.cursor = None;
        self.queue_awareness();
    }

    pub fn set_user_info(&mut self, name: String, color: String) {
        self.awareness.user = Some(UserInfo { name, color });
        self.queue_awareness();
    }

    pub fn set_selection(&mut self, selection: Vec<NodeId>) {
        if self.awareness.selection == selection {
            return;
        }
        self.awareness.selection = selection;
        self.queue_awareness();
    }

    pub fn awareness(&self) -> &AwarenessState {
        &self.awareness
    }

    /// Remote peers by relay connection id.
    pub fn peers(&self) -> impl Iterator<Item = (&str, &PeerPresence)> {
        self.peers.iter().map(|(id, presence)| (id.as_str(), presence))
    }

    fn queue_awareness(&mut self) {
        if self.is_joined() {
            self.push(&ClientMessage::Awareness {
                peer_id: self.peer_id,
                state: self.awareness.clone(),
            });
        }
    }

    // --- Incoming ---

    /// Handle one server frame, merging any updates into `doc`.
    pub fn handle_message(&mut self, json: &str, doc: &mut SharedDocument) -> Option<SyncEvent> {
        let msg: ServerMessage = match serde_json::from_str(json) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Ignoring malformed server message: {}", e);
                return None;
            }
        };

        match msg {
            ServerMessage::Joined {
                workspace,
                peer_count,
                snapshot,
            } => {
                if self.requested.as_deref() != Some(workspace.as_str()) {
                    log::warn!("Ignoring join confirmation for {}", workspace);
                    return None;
                }
                self.requested = None;
                self.workspace = Some(workspace.clone());
                self.peers.clear();

                let imported = match snapshot.as_deref().map(decode_batch) {
                    Some(Ok(batch)) => doc.apply_remote(&batch),
                    Some(Err(e)) => {
                        log::warn!("Discarding undecodable snapshot for {}: {}", workspace, e);
                        0
                    }
                    None => 0,
                };
                // Whatever was written before the join goes out in full.
                doc.take_pending();
                let state = doc.export_snapshot();
                if !state.is_empty() {
                    self.queue_batch(&state);
                }
                self.queue_awareness();
                log::info!("Joined workspace {} with {} peers", workspace, peer_count);
                Some(SyncEvent::Joined {
                    workspace,
                    peer_count,
                    imported,
                })
            }
            ServerMessage::PeerJoined { peer_id } => {
                // Let the newcomer see where we are.
                self.queue_awareness();
                Some(SyncEvent::PeerJoined { peer_id })
            }
            ServerMessage::PeerLeft { peer_id } => {
                self.peers.remove(&peer_id);
                Some(SyncEvent::PeerLeft { peer_id })
            }
            ServerMessage::Sync { from, data } => match decode_batch(&data) {
                Ok(batch) => {
                    let applied = doc.apply_remote(&batch);
                    log::debug!("Merged sync from {}: {} entities changed", from, applied);
                    Some(SyncEvent::SyncReceived { from, applied })
                }
                Err(e) => {
                    log::warn!("Discarding undecodable sync from {}: {}", from, e);
                    Some(SyncEvent::Error {
                        message: e.to_string(),
                    })
                }
            },
            ServerMessage::Awareness { from, peer_id, state } => {
                self.peers.insert(
                    from.clone(),
                    PeerPresence {
                        peer_id,
                        state: state.clone(),
                    },
                );
                Some(SyncEvent::AwarenessReceived { from, peer_id, state })
            }
            ServerMessage::Error { message } => {
                log::warn!("Relay error: {}", message);
                Some(SyncEvent::Error { message })
            }
        }
    }
}

impl std::fmt::Debug for CollaborationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollaborationSession")
            .field("peer_id", &self.peer_id)
            .field("workspace", &self.workspace)
            .field("peers", &self.peers.len())
            .field("outgoing", &self.outgoing.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{EntityKey, FieldValues};
    use serde_json::json;

    fn content(text: &str) -> FieldValues {
        FieldValues::from([("content".to_string(), json!(text))])
    }

    fn joined(workspace: &str, snapshot: Option<String>) -> String {
        serde_json::to_string(&ServerMessage::Joined {
            workspace: workspace.into(),
            peer_count: 1,
            snapshot,
        })
        .unwrap()
    }

    fn parse(json: &str) -> serde_json::Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_updates_wait_for_join() {
        let mut doc = SharedDocument::new(1);
        let mut session = CollaborationSession::new(1, "alice");
        doc.put(EntityKey::node("n1"), content("offline")).unwrap();

        assert!(!session.queue_updates(&mut doc));
        assert!(doc.has_pending());

        session.join("ws");
        let sent = session.take_outgoing();
        assert_eq!(parse(&sent[0])["type"], "join");
        assert_eq!(parse(&sent[0])["user_id"], "alice");

        session.handle_message(&joined("ws", None), &mut doc);
        assert!(session.is_joined());
        assert!(!doc.has_pending());
        let sent = session.take_outgoing();
        assert_eq!(parse(&sent[0])["type"], "sync");
    }

    #[test]
    fn test_join_imports_snapshot() {
        let mut source = SharedDocument::new(2);
        source.put(EntityKey::node("n1"), content("remote")).unwrap();
        let snapshot = encode_batch(&source.export_snapshot()).unwrap();

        let mut doc = SharedDocument::new(1);
        let mut session = CollaborationSession::new(1, "alice");
        session.join("ws");
        let event = session.handle_message(&joined("ws", Some(snapshot)), &mut doc);
        assert_eq!(
            event,
            Some(SyncEvent::Joined {
                workspace: "ws".into(),
                peer_count: 1,
                imported: 1
            })
        );
        assert_eq!(doc.read(&EntityKey::node("n1")).unwrap().get("content"), Some(&json!("remote")));
    }

    #[test]
    fn test_unrequested_join_is_ignored() {
        let mut doc = SharedDocument::new(1);
        let mut session = CollaborationSession::new(1, "alice");
        assert_eq!(session.handle_message(&joined("other", None), &mut doc), None);
        assert!(!session.is_joined());
    }

    #[test]
    fn test_sync_round_trip_between_sessions() {
        let mut doc_a = SharedDocument::new(1);
        let mut doc_b = SharedDocument::new(2);
        let mut a = CollaborationSession::new(1, "alice");
        let mut b = CollaborationSession::new(2, "bob");
        for (session, doc) in [(&mut a, &mut doc_a), (&mut b, &mut doc_b)] {
            session.join("ws");
            session.handle_message(&joined("ws", None), doc);
            session.take_outgoing();
        }

        doc_a.put(EntityKey::node("n1"), content("hello")).unwrap();
        assert!(a.queue_updates(&mut doc_a));
        for frame in a.take_outgoing() {
            let data = parse(&frame)["data"].as_str().unwrap().to_string();
            let relayed = serde_json::to_string(&ServerMessage::Sync { from: "a".into(), data }).unwrap();
            let event = b.handle_message(&relayed, &mut doc_b);
            assert_eq!(
                event,
                Some(SyncEvent::SyncReceived {
                    from: "a".into(),
                    applied: 1
                })
            );
        }
        assert_eq!(doc_b.read(&EntityKey::node("n1")).unwrap().get("content"), Some(&json!("hello")));
    }

    #[test]
    fn test_awareness_tracks_peers() {
        let mut doc = SharedDocument::new(1);
        let mut session = CollaborationSession::new(1, "alice");
        session.join("ws");
        session.handle_message(&joined("ws", None), &mut doc);

        let state = AwarenessState {
            cursor: Some(CursorPosition { x: 3.0, y: 4.0 }),
            ..Default::default()
        };
        let msg = serde_json::to_string(&ServerMessage::Awareness {
            from: "conn-2".into(),
            peer_id: 9,
            state: state.clone(),
        })
        .unwrap();
        session.handle_message(&msg, &mut doc);
        assert_eq!(session.peers().count(), 1);

        let left = serde_json::to_string(&ServerMessage::PeerLeft { peer_id: "conn-2".into() }).unwrap();
        session.handle_message(&left, &mut doc);
        assert_eq!(session.peers().count(), 0);
    }

    #[test]
    fn test_bad_frames_do_not_panic() {
        let mut doc = SharedDocument::new(1);
        let mut session = CollaborationSession::new(1, "alice");
        assert_eq!(session.handle_message("{not json", &mut doc), None);
        let bad = serde_json::to_string(&ServerMessage::Sync {
            from: "x".into(),
            data: "%%%".into(),
        })
        .unwrap();
        assert!(matches!(session.handle_message(&bad, &mut doc), Some(SyncEvent::Error { .. })));
    }

    #[test]
    fn test_awareness_only_sent_when_joined() {
        let mut session = CollaborationSession::new(1, "alice");
        session.set_cursor(1.0, 1.0);
        assert!(!session.has_outgoing());

        let mut doc = SharedDocument::new(1);
        session.join("ws");
        session.handle_message(&joined("ws", None), &mut doc);
        session.take_outgoing();
        session.set_selection(vec![uuid::Uuid::nil()]);
        let sent = session.take_outgoing();
        assert_eq!(sent.len(), 1);
        assert_eq!(parse(&sent[0])["type"], "awareness");
    }
}
