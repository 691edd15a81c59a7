//! Debounced, retrying write queue.

use super::{PersistError, PersistenceGateway, WriteOp};
use crate::config::EngineConfig;
use crate::crdt::EntityKey;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Exponential backoff between attempts of a failed write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
        }
    }
}

/// Save indicator for the host UI. Never blocks editing.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveStatus {
    Saved,
    Unsaved { pending: usize },
    Retrying { pending: usize, last_error: String },
}

/// Outcome of one flush pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct PendingWrite {
    op: WriteOp,
    due: Instant,
    attempts: u32,
    last_error: Option<PersistError>,
}

/// Queues durable writes per entity.
///
/// A write waits out the debounce window before it is sent. A newer write
/// to the same entity replaces a pending one, so only the latest state is
/// ever stored. Failed writes stay queued and are retried with backoff.
pub struct WriteScheduler {
    gateway: Arc<dyn PersistenceGateway>,
    workspace_id: String,
    debounce: Duration,
    retry: RetryPolicy,
    pending: BTreeMap<EntityKey, PendingWrite>,
}

impl WriteScheduler {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, workspace_id: impl Into<String>) -> Self {
        Self {
            gateway,
            workspace_id: workspace_id.into(),
            debounce: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            pending: BTreeMap::new(),
        }
    }

    pub fn from_config(
        gateway: Arc<dyn PersistenceGateway>,
        workspace_id: impl Into<String>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            debounce: config.persistence_debounce(),
            retry: RetryPolicy {
                base: config.retry_base(),
                max: config.retry_max(),
            },
            ..Self::new(gateway, workspace_id)
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    /// Queue a write, superseding any pending write to the same entity.
    /// Returns true if one was superseded.
    pub fn schedule(&mut self, op: WriteOp, now: Instant) -> bool {
        let key = op.key();
        let write = PendingWrite {
            op,
            due: now + self.debounce,
            attempts: 0,
            last_error: None,
        };
        let superseded = self.pending.insert(key.clone(), write).is_some();
        if superseded {
            log::debug!("Superseded pending write to {}", key);
        }
        superseded
    }

    /// Drop a pending write. Returns true if there was one.
    pub fn cancel(&mut self, key: &EntityKey) -> bool {
        self.pending.remove(key).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, key: &EntityKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Earliest time a pending write becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|w| w.due).min()
    }

    pub fn status(&self) -> SaveStatus {
        if self.pending.is_empty() {
            return SaveStatus::Saved;
        }
        let pending = self.pending.len();
        match self.pending.values().find_map(|w| w.last_error.as_ref()) {
            Some(error) => SaveStatus::Retrying {
                pending,
                last_error: error.to_string(),
            },
            None => SaveStatus::Unsaved { pending },
        }
    }

    /// Send every write whose debounce or backoff has elapsed.
    pub async fn flush_due(&mut self, now: Instant) -> FlushReport {
        let due: Vec<EntityKey> = self
            .pending
            .iter()
            .filter(|(_, w)| w.due <= now)
            .map(|(key, _)| key.clone())
            .collect();
        self.send(due, now).await
    }

    /// Send every pending write now, regardless of debounce or backoff.
    pub async fn flush_all(&mut self, now: Instant) -> FlushReport {
        let keys: Vec<EntityKey> = self.pending.keys().cloned().collect();
        self.send(keys, now).await
    }

    async fn send(&mut self, keys: Vec<EntityKey>, now: Instant) -> FlushReport {
        let mut report = FlushReport::default();
        for key in keys {
            let Some(mut write) = self.pending.remove(&key) else {
                continue;
            };
            match self.gateway.apply(&self.workspace_id, &write.op).await {
                Ok(()) => report.written += 1,
                Err(e) => {
                    write.attempts += 1;
                    let delay = self.retry.delay(write.attempts);
                    log::warn!(
                        "Write to {} failed (attempt {}), retrying in {:?}: {}",
                        key,
                        write.attempts,
                        delay,
                        e
                    );
                    write.due = now + delay;
                    write.last_error = Some(e);
                    self.pending.insert(key, write);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for WriteScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteScheduler")
            .field("workspace_id", &self.workspace_id)
            .field("debounce", &self.debounce)
            .field("retry", &self.retry)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;
    use crate::persistence::{MemoryGateway, NodeRow, block_on};
    use kurbo::{Point, Size};

    fn scheduler(gateway: &Arc<MemoryGateway>) -> WriteScheduler {
        let mut scheduler = WriteScheduler::new(gateway.clone(), "ws");
        scheduler.debounce = Duration::from_millis(100);
        scheduler.retry = RetryPolicy {
            base: Duration::from_millis(50),
            max: Duration::from_millis(300),
        };
        scheduler
    }

    fn upsert(node: &Node) -> WriteOp {
        WriteOp::UpsertNode(NodeRow::from_node("ws", node))
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(500));
        assert_eq!(policy.delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_writes_wait_for_debounce() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut scheduler = scheduler(&gateway);
        let t0 = Instant::now();
        scheduler.schedule(upsert(&Node::new(Point::ZERO, Size::new(10.0, 10.0))), t0);

        assert_eq!(block_on(scheduler.flush_due(t0 + Duration::from_millis(50))).written, 0);
        assert_eq!(scheduler.status(), SaveStatus::Unsaved { pending: 1 });

        assert_eq!(block_on(scheduler.flush_due(t0 + Duration::from_millis(100))).written, 1);
        assert_eq!(scheduler.status(), SaveStatus::Saved);
    }

    #[test]
    fn test_newer_write_supersedes_pending() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut scheduler = scheduler(&gateway);
        let t0 = Instant::now();
        let mut node = Node::new(Point::ZERO, Size::new(10.0, 10.0));

        assert!(!scheduler.schedule(upsert(&node), t0));
        node.content = "latest".into();
        assert!(scheduler.schedule(upsert(&node), t0 + Duration::from_millis(10)));
        assert_eq!(scheduler.pending_count(), 1);

        block_on(scheduler.flush_all(t0));
        assert_eq!(gateway.write_count(), 1);
        let rows = block_on(gateway.load_workspace("ws")).unwrap();
        assert_eq!(rows.nodes[0].content, "latest");
    }

    #[test]
    fn test_failed_write_retries_with_backoff() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut scheduler = scheduler(&gateway);
        let t0 = Instant::now();
        scheduler.schedule(upsert(&Node::new(Point::ZERO, Size::new(10.0, 10.0))), t0);

        gateway.fail_next(2);
        let t1 = t0 + Duration::from_millis(100);
        assert_eq!(block_on(scheduler.flush_due(t1)).failed, 1);
        assert!(matches!(scheduler.status(), SaveStatus::Retrying { pending: 1, .. }));
        assert_eq!(scheduler.next_due(), Some(t1 + Duration::from_millis(50)));

        let t2 = t1 + Duration::from_millis(50);
        assert_eq!(block_on(scheduler.flush_due(t2)).failed, 1);
        assert_eq!(scheduler.next_due(), Some(t2 + Duration::from_millis(100)));

        // Not yet due.
        assert_eq!(block_on(scheduler.flush_due(t2 + Duration::from_millis(99))), FlushReport::default());
        assert_eq!(block_on(scheduler.flush_due(t2 + Duration::from_millis(100))).written, 1);
        assert_eq!(scheduler.status(), SaveStatus::Saved);
    }

    #[test]
    fn test_new_write_clears_retry_state() {
        let gateway = Arc::new(MemoryGateway::new());
        let mut scheduler = scheduler(&gateway);
        let t0 = Instant::now();
        let node = Node::new(Point::ZERO, Size::new(10.0, 10.0));
        scheduler.schedule(upsert(&node), t0);
        gateway.fail_next(1);
        block_on(scheduler.flush_all(t0));
        assert!(matches!(scheduler.status(), SaveStatus::Retrying { .. }));

        scheduler.schedule(WriteOp::DeleteNode(node.id), t0);
        assert_eq!(scheduler.status(), SaveStatus::Unsaved { pending: 1 });
        assert!(scheduler.cancel(&EntityKey::node(node.id)));
        assert_eq!(scheduler.status(), SaveStatus::Saved);
    }
}
