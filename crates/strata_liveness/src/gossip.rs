//! Gossip overlay surface and the liveness prefix listener.

use std::sync::Arc;

use crate::cache::LivenessCache;
use crate::record::{LivenessRecord, NodeId};

/// Callback registered against a gossip key prefix.
pub type GossipCallback = Box<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Gossip overlay surface consumed by the liveness subsystem.
pub trait Gossip: Send + Sync + 'static {
    /// This node's id within the cluster.
    fn node_id(&self) -> NodeId;

    /// Invoke `callback` for every gossiped update whose key starts with
    /// `prefix`. The callback must not block the gossip producer beyond
    /// decoding and merging.
    fn register_prefix_callback(&self, prefix: &str, callback: GossipCallback);
}

/// Prefix under which liveness records are gossiped.
pub const LIVENESS_GOSSIP_PREFIX: &str = "liveness:";

/// Gossip key for one node's liveness record.
pub fn gossip_key(node_id: NodeId) -> String {
    format!("{LIVENESS_GOSSIP_PREFIX}{node_id}")
}

/// Feed gossiped liveness records into the cache. Undecodable payloads are
/// logged and dropped.
pub(crate) fn register_liveness_listener(gossip: &dyn Gossip, cache: Arc<LivenessCache>) {
    gossip.register_prefix_callback(
        LIVENESS_GOSSIP_PREFIX,
        Box::new(move |key, payload| match LivenessRecord::decode(payload) {
            Ok(record) => cache.maybe_update(record),
            Err(err) => {
                tracing::error!(key, error = ?err, "failed to decode gossiped liveness record");
            }
        }),
    );
}
