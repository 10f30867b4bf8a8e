//! In-memory view of the latest-known liveness records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::record::{LivenessRecord, NodeId};

/// Invoked when a node's liveness transitions to live in the cache.
pub type IsLiveCallback = Arc<dyn Fn(NodeId) + Send + Sync>;

struct CacheInner {
    records: HashMap<NodeId, LivenessRecord>,
    callbacks: Vec<IsLiveCallback>,
}

/// Mapping from node id to the newest accepted record, shared between the
/// mutator API and the gossip listener.
pub(crate) struct LivenessCache {
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner>,
}

impl LivenessCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(CacheInner {
                records: HashMap::new(),
                callbacks: Vec::new(),
            }),
        }
    }

    pub fn get(&self, node_id: NodeId) -> Option<LivenessRecord> {
        self.inner.lock().unwrap().records.get(&node_id).copied()
    }

    pub fn snapshot(&self) -> Vec<LivenessRecord> {
        self.inner.lock().unwrap().records.values().copied().collect()
    }

    pub fn register_callback(&self, callback: IsLiveCallback) {
        self.inner.lock().unwrap().callbacks.push(callback);
    }

    /// Offer a candidate record: install it iff it dominates the stored one,
    /// then fire becomes-live callbacks outside the lock.
    pub fn maybe_update(&self, new: LivenessRecord) {
        let mut callbacks = Vec::new();
        let old = {
            let mut inner = self.inner.lock().unwrap();
            let old = inner.records.get(&new.node_id).copied();
            if !should_replace(old.as_ref(), &new) {
                return;
            }
            inner.records.insert(new.node_id, new);
            callbacks.extend(inner.callbacks.iter().cloned());
            old
        };

        let now = self.clock.now();
        let max_offset = self.clock.max_offset();
        let was_live = old.map_or(false, |old| old.is_live(now, max_offset));
        if !was_live && new.is_live(now, max_offset) {
            for callback in callbacks {
                callback(new.node_id);
            }
        }
    }
}

/// Dominance rule for candidate records: epoch first, then expiration.
fn should_replace(old: Option<&LivenessRecord>, new: &LivenessRecord) -> bool {
    let Some(old) = old else {
        return true;
    };
    if old.epoch != new.epoch {
        return old.epoch < new.epoch;
    }
    if old.expiration != new.expiration {
        return old.expiration < new.expiration;
    }
    // Equal epoch and expiration: treat a flag flip as newer. This can
    // clobber on churn; a monotone sequence number in the record would
    // remove the ambiguity.
    old.draining != new.draining || old.decommissioning != new.decommissioning
}
