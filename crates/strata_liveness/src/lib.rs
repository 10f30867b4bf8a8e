//! Epoch-based node liveness for the Strata storage cluster.
//!
//! Every node periodically refreshes one small record in a replicated
//! liveness table; peers observe those records through gossip to decide
//! whether to trust a node's leases, route work to it, or fence it. A
//! record carries an epoch: leases are stamped with it, and a peer that
//! observes the record expired bumps the epoch to invalidate them.
//!
//! The replicated KV table, the gossip overlay, the cluster clock and the
//! local storage engines are consumed through traits; this crate owns the
//! coordination rules on top of them.

pub mod cache;
pub mod clock;
pub mod engine;
pub mod gossip;
pub mod liveness;
pub mod metrics;
pub mod record;
pub mod store;

pub use cache::IsLiveCallback;
pub use clock::{Clock, HlcTimestamp, ManualClock, SystemClock};
pub use engine::{Engine, EngineBatch, FjallEngine, MemEngine};
pub use gossip::{gossip_key, Gossip, GossipCallback, LIVENESS_GOSSIP_PREFIX};
pub use liveness::{
    HeartbeatCallback, HeartbeatsDisabled, IsLiveEntry, LivenessConfig, LivenessError,
    NodeLiveness,
};
pub use metrics::LivenessMetricsSnapshot;
pub use record::{
    liveness_key, liveness_key_end, LivenessRecord, LivenessStatus, NodeId, LIVENESS_KEY_PREFIX,
};
pub use store::{KvError, LivenessKv, RegossipTrigger};
