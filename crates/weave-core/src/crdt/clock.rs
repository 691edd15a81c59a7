//! Hybrid logical clock.
//!
//! Stamps combine wall-clock milliseconds with a counter and the writer's
//! peer id, so every write has a distinct, totally ordered stamp and a
//! replica never issues a stamp older than one it has already seen.

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;

pub type PeerId = u64;

/// Write timestamp. Ordered by time, then counter, then peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub time: i64,
    pub counter: u32,
    pub peer: PeerId,
}

/// Source of wall-clock milliseconds.
pub trait ClockSource {
    fn now_millis(&self) -> i64;
}

/// System UTC clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock driven by hand, shared between clones. Used by tests and replays.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<i64>>);

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self(Rc::new(Cell::new(start)))
    }

    pub fn set(&self, millis: i64) {
        self.0.set(millis);
    }

    pub fn advance(&self, millis: i64) {
        self.0.set(self.0.get() + millis);
    }
}

impl ClockSource for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.get()
    }
}

pub struct HybridClock {
    peer: PeerId,
    last: Stamp,
    source: Box<dyn ClockSource>,
}

impl HybridClock {
    pub fn new(peer: PeerId, source: Box<dyn ClockSource>) -> Self {
        Self {
            peer,
            last: Stamp {
                time: i64::MIN,
                counter: 0,
                peer,
            },
            source,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Current wall-clock reading of the underlying source.
    pub fn wall_millis(&self) -> i64 {
        self.source.now_millis()
    }

    /// Issue a stamp newer than every stamp issued or observed so far.
    pub fn tick(&mut self) -> Stamp {
        let now = self.source.now_millis();
        let stamp = if now > self.last.time {
            Stamp {
                time: now,
                counter: 0,
                peer: self.peer,
            }
        } else {
            Stamp {
                time: self.last.time,
                counter: self.last.counter.saturating_add(1),
                peer: self.peer,
            }
        };
        self.last = stamp;
        stamp
    }

    /// Fold in a stamp seen on a remote write.
    pub fn observe(&mut self, remote: &Stamp) {
        if (remote.time, remote.counter) > (self.last.time, self.last.counter) {
            self.last = Stamp {
                time: remote.time,
                counter: remote.counter,
                peer: self.peer,
            };
        }
    }
}

impl std::fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridClock")
            .field("peer", &self.peer)
            .field("last", &self.last)
            .finish()
    }
}
