//! Spatial index and viewport culling.

use crate::camera::Camera;
use crate::model::NodeId;
use crate::store::{LocalStore, StoreDelta};
use kurbo::Rect;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Rects covering more tiles than this are kept in a separate list that
/// every query scans.
const MAX_TILES_PER_ENTRY: i128 = 4096;

type Tile = (i64, i64);

/// Closed rectangle intersection: touching edges count as overlap.
pub fn rects_overlap(a: Rect, b: Rect) -> bool {
    a.x0 <= b.x1 && b.x0 <= a.x1 && a.y0 <= b.y1 && b.y0 <= a.y1
}

/// Uniform grid of world-space tiles, each holding the ids of nodes whose
/// bounds touch it. A query only visits the tiles under the query rect.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    tile_size: f64,
    tiles: HashMap<Tile, HashSet<NodeId>>,
    entries: HashMap<NodeId, Rect>,
    oversized: HashSet<NodeId>,
}

impl SpatialIndex {
    pub fn new(tile_size: f64) -> Self {
        let tile_size = if tile_size.is_finite() && tile_size > 0.0 {
            tile_size
        } else {
            512.0
        };
        Self {
            tile_size,
            tiles: HashMap::new(),
            entries: HashMap::new(),
            oversized: HashSet::new(),
        }
    }

    fn tile_of(&self, x: f64, y: f64) -> Tile {
        ((x / self.tile_size).floor() as i64, (y / self.tile_size).floor() as i64)
    }

    /// Inclusive tile range under a rect.
    fn tile_range(&self, rect: Rect) -> (Tile, Tile) {
        let rect = rect.abs();
        (self.tile_of(rect.x0, rect.y0), self.tile_of(rect.x1, rect.y1))
    }

    /// Number of tiles in a range. Ranges span up to the whole `i64`
    /// plane, so the count is taken in `i128`.
    fn tile_count((min, max): (Tile, Tile)) -> i128 {
        let width = i128::from(max.0) - i128::from(min.0) + 1;
        let height = i128::from(max.1) - i128::from(min.1) + 1;
        width.saturating_mul(height)
    }

    /// Insert a node or move it to new bounds.
    pub fn insert(&mut self, id: NodeId, bounds: Rect) {
        self.remove(id);
        let bounds = bounds.abs();
        let range = self.tile_range(bounds);
        if Self::tile_count(range) > MAX_TILES_PER_ENTRY {
            self.oversized.insert(id);
        } else {
            let ((x0, y0), (x1, y1)) = range;
            for tx in x0..=x1 {
                for ty in y0..=y1 {
                    self.tiles.entry((tx, ty)).or_default().insert(id);
                }
            }
        }
        self.entries.insert(id, bounds);
    }

    pub fn remove(&mut self, id: NodeId) -> bool {
        let Some(bounds) = self.entries.remove(&id) else {
            return false;
        };
        if !self.oversized.remove(&id) {
            let ((x0, y0), (x1, y1)) = self.tile_range(bounds);
            for tx in x0..=x1 {
                for ty in y0..=y1 {
                    if let Some(bucket) = self.tiles.get_mut(&(tx, ty)) {
                        bucket.remove(&id);
                        if bucket.is_empty() {
                            self.tiles.remove(&(tx, ty));
                        }
                    }
                }
            }
        }
        true
    }

    /// Ids of nodes whose bounds intersect `rect`, sorted.
    pub fn query(&self, rect: Rect) -> Vec<NodeId> {
        let rect = rect.abs();
        let range = self.tile_range(rect);
        let mut found = BTreeSet::new();

        if Self::tile_count(range) > self.tiles.len() as i128 {
            // Cheaper to walk the occupied tiles than the empty ones.
            for ((tx, ty), bucket) in &self.tiles {
                if (range.0.0..=range.1.0).contains(tx) && (range.0.1..=range.1.1).contains(ty) {
                    found.extend(bucket.iter().copied());
                }
            }
        } else {
            let ((x0, y0), (x1, y1)) = range;
            for tx in x0..=x1 {
                for ty in y0..=y1 {
                    if let Some(bucket) = self.tiles.get(&(tx, ty)) {
                        found.extend(bucket.iter().copied());
                    }
                }
            }
        }
        found.extend(self.oversized.iter().copied());

        found
            .into_iter()
            .filter(|id| self.entries.get(id).is_some_and(|b| rects_overlap(*b, rect)))
            .collect()
    }

    pub fn bounds(&self, id: NodeId) -> Option<Rect> {
        self.entries.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
        self.entries.clear();
        self.oversized.clear();
    }
}

/// Keeps the visible node set in step with the store and the camera.
///
/// Store deltas only mark the set dirty; the set itself is recomputed when
/// the camera has settled, so an inertial pan does not re-query the index
/// on every frame.
#[derive(Debug, Clone)]
pub struct Culler {
    index: SpatialIndex,
    padding: f64,
    visible: Vec<NodeId>,
    last_view: Option<Rect>,
    dirty: bool,
}

impl Culler {
    pub fn new(tile_size: f64, padding: f64) -> Self {
        Self {
            index: SpatialIndex::new(tile_size),
            padding,
            visible: Vec::new(),
            last_view: None,
            dirty: true,
        }
    }

    /// Re-index every live node.
    pub fn rebuild(&mut self, store: &LocalStore) {
        self.index.clear();
        for node in store.nodes() {
            self.index.insert(node.id, node.bounds());
        }
        self.dirty = true;
    }

    pub fn apply_delta(&mut self, store: &LocalStore, delta: &StoreDelta) {
        match delta {
            StoreDelta::NodeUpserted(id) => match store.node(*id) {
                Some(node) => self.index.insert(*id, node.bounds()),
                None => {
                    self.index.remove(*id);
                }
            },
            StoreDelta::NodeRemoved(id) => {
                self.index.remove(*id);
            }
            _ => return,
        }
        self.dirty = true;
    }

    pub fn apply_deltas(&mut self, store: &LocalStore, deltas: &[StoreDelta]) {
        for delta in deltas {
            self.apply_delta(store, delta);
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Recompute the visible set if the camera is settled and either the
    /// view or the index changed. Returns whether it was recomputed.
    pub fn recompute(&mut self, camera: &Camera) -> bool {
        if !camera.is_settled() {
            return false;
        }
        let view = camera.visible_world_rect(self.padding);
        if !self.dirty && self.last_view == Some(view) {
            return false;
        }
        self.visible = self.index.query(view);
        self.last_view = Some(view);
        self.dirty = false;
        true
    }

    pub fn visible(&self) -> &[NodeId] {
        &self.visible
    }

    pub fn is_visible(&self, id: NodeId) -> bool {
        self.visible.binary_search(&id).is_ok()
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }
}
