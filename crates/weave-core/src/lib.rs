//! Weave Core Library
//!
//! Platform-agnostic engine for a collaborative infinite canvas: nodes and
//! connections in a replicated document, projected into a local store that
//! drives culling, routing and input handling.

pub mod actions;
pub mod bridge;
pub mod camera;
pub mod canvas;
pub mod collaboration;
pub mod config;
pub mod controller;
pub mod crdt;
pub mod input;
pub mod model;
pub mod persistence;
pub mod render;
pub mod routing;
pub mod spatial;
pub mod store;
pub mod sync;

pub use actions::LocalAction;
pub use bridge::{ProjectionReport, SyncBridge};
pub use camera::{Camera, ZoomAnchor};
pub use canvas::{CanvasEngine, EngineError, SessionContext, TextEditor};
pub use collaboration::CollaborationSession;
pub use config::{ConfigError, EngineConfig};
pub use controller::{CanvasController, ControllerState, Effect};
pub use crdt::{SharedDocument, Stamp, UpdateBatch};
pub use input::{KeyEvent, Modifiers, MouseButton, PointerEvent};
pub use model::{AnchorSide, Binding, Connection, Node, NodeKind, NodePatch, RoutingType, ViewportState};
pub use persistence::{MemoryGateway, PersistenceGateway, SaveStatus, WriteScheduler};
pub use render::{Frame, RendererTable};
pub use store::{CanvasSnapshot, LocalStore, StoreDelta};
pub use sync::{ClientMessage, ConnectionState, ServerMessage, SyncEvent};

#[cfg(not(target_arch = "wasm32"))]
pub use sync::NativeWebSocket;
