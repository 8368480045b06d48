//! Per-node write serialization.
//!
//! # Invariants
//! - Two holders of the same node id never run concurrently.
//! - Guards for several ids are always taken in ascending id order, so
//!   overlapping multi-node acquisitions cannot deadlock.
//! - Idle entries are pruned on the next acquisition.
//! - Clones share one registry.

use crate::model::document::NodeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard set returned by [`NodeLocks::acquire`]. Releases on drop.
pub struct NodeGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
}

/// Registry of async mutexes keyed by node id.
#[derive(Clone, Default)]
pub struct NodeLocks {
    slots: Arc<Mutex<HashMap<NodeId, Arc<AsyncMutex<()>>>>>,
}

impl NodeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until every id in `ids` is free and holds them all.
    pub async fn acquire(&self, ids: &[NodeId]) -> NodeGuard {
        let mut ordered = ids.to_vec();
        ordered.sort_unstable();
        ordered.dedup();

        let slots = self.slots_for(&ordered);
        let mut guards = Vec::with_capacity(slots.len());
        for slot in slots {
            guards.push(slot.lock_owned().await);
        }
        NodeGuard { _guards: guards }
    }

    /// Number of ids with a live registry entry.
    pub fn tracked(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.len())
            .unwrap_or_default()
    }

    fn slots_for(&self, ordered: &[NodeId]) -> Vec<Arc<AsyncMutex<()>>> {
        // Poisoning needs a panic while holding a plain map lock; keep serving.
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        ordered
            .iter()
            .map(|id| Arc::clone(slots.entry(*id).or_default()))
            .collect()
    }
}
