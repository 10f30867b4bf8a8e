//! Liveness record type, liveness arithmetic, and key encoding.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::clock::HlcTimestamp;

/// Stable cluster-unique node identifier.
pub type NodeId = u64;

/// Binary prefix of liveness record keys in the replicated KV table.
pub const LIVENESS_KEY_PREFIX: &[u8] = b"\x00sys-liveness\x00";

/// Key of `node_id`'s liveness record.
pub fn liveness_key(node_id: NodeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(LIVENESS_KEY_PREFIX.len() + 8);
    out.extend_from_slice(LIVENESS_KEY_PREFIX);
    out.extend_from_slice(&node_id.to_be_bytes());
    out
}

/// Exclusive end key of the one-record span starting at `liveness_key`.
pub fn liveness_key_end(node_id: NodeId) -> Vec<u8> {
    let mut out = liveness_key(node_id);
    out.push(0);
    out
}

/// One node's liveness record as stored in the replicated table.
///
/// `epoch` starts at 1 and only ever grows; it is bumped by a peer that has
/// observed the record expired, which invalidates every lease stamped with
/// the previous epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub node_id: NodeId,
    pub epoch: u64,
    pub expiration: HlcTimestamp,
    #[serde(default)]
    pub draining: bool,
    #[serde(default)]
    pub decommissioning: bool,
}

/// Classification of a record relative to an observer's clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LivenessStatus {
    Live,
    /// Known but not currently live (expired, or live-but-draining).
    Unavailable,
    /// Expired longer than the dead timeout.
    Dead,
    Decommissioning,
    /// Decommissioning and dead.
    Decommissioned,
}

impl LivenessRecord {
    /// Whether the record is live at `now`, conservatively: the reading plus
    /// the maximum clock offset must still fall before the expiration.
    pub fn is_live(&self, now: HlcTimestamp, max_offset: Duration) -> bool {
        now.add(max_offset) < self.expiration
    }

    /// Whether the record has been expired for at least `threshold`.
    pub fn is_dead(&self, now_nanos: i64, threshold: Duration) -> bool {
        let threshold_nanos = threshold.as_nanos().min(i64::MAX as u128) as i64;
        now_nanos >= self.expiration.wall_nanos.saturating_add(threshold_nanos)
    }

    pub fn status(
        &self,
        now: HlcTimestamp,
        dead_threshold: Duration,
        max_offset: Duration,
    ) -> LivenessStatus {
        if self.is_dead(now.wall_nanos, dead_threshold) {
            if self.decommissioning {
                return LivenessStatus::Decommissioned;
            }
            return LivenessStatus::Dead;
        }
        if self.decommissioning {
            return LivenessStatus::Decommissioning;
        }
        if self.is_live(now, max_offset) && !self.draining {
            return LivenessStatus::Live;
        }
        LivenessStatus::Unavailable
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize liveness record")
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(data).context("deserialize liveness record")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(epoch: u64, expiration_nanos: i64) -> LivenessRecord {
        LivenessRecord {
            node_id: 1,
            epoch,
            expiration: HlcTimestamp::new(expiration_nanos, 0),
            draining: false,
            decommissioning: false,
        }
    }

    #[test]
    fn liveness_is_clock_offset_conservative() {
        let max_offset = Duration::from_nanos(100);
        let rec = record(1, 1_000);
        assert!(rec.is_live(HlcTimestamp::new(899, 0), max_offset));
        // now + offset == expiration counts as not live.
        assert!(!rec.is_live(HlcTimestamp::new(900, 0), max_offset));
        assert!(!rec.is_live(HlcTimestamp::new(1_000, 0), max_offset));
    }

    #[test]
    fn dead_requires_threshold_past_expiration() {
        let rec = record(1, 1_000);
        let threshold = Duration::from_nanos(500);
        assert!(!rec.is_dead(1_499, threshold));
        assert!(rec.is_dead(1_500, threshold));
    }

    #[test]
    fn status_classification() {
        let max_offset = Duration::from_nanos(10);
        let dead_threshold = Duration::from_nanos(1_000);
        let live = record(1, 2_000);
        let now = HlcTimestamp::new(500, 0);
        assert_eq!(live.status(now, dead_threshold, max_offset), LivenessStatus::Live);

        let draining = LivenessRecord { draining: true, ..live };
        assert_eq!(
            draining.status(now, dead_threshold, max_offset),
            LivenessStatus::Unavailable
        );

        let expired_now = HlcTimestamp::new(2_500, 0);
        assert_eq!(
            live.status(expired_now, dead_threshold, max_offset),
            LivenessStatus::Unavailable
        );

        let dead_now = HlcTimestamp::new(3_000, 0);
        assert_eq!(live.status(dead_now, dead_threshold, max_offset), LivenessStatus::Dead);

        let decommissioning = LivenessRecord { decommissioning: true, ..live };
        assert_eq!(
            decommissioning.status(now, dead_threshold, max_offset),
            LivenessStatus::Decommissioning
        );
        assert_eq!(
            decommissioning.status(dead_now, dead_threshold, max_offset),
            LivenessStatus::Decommissioned
        );
    }

    #[test]
    fn keys_sort_by_node_id() {
        let a = liveness_key(1);
        let b = liveness_key(2);
        let c = liveness_key(256);
        assert!(a < b);
        assert!(b < c);
        assert!(a < liveness_key_end(1));
        assert!(liveness_key_end(1) < b);
    }

    #[test]
    fn record_roundtrips_through_encoding() {
        let rec = LivenessRecord {
            node_id: 7,
            epoch: 3,
            expiration: HlcTimestamp::new(123_456, 2),
            draining: true,
            decommissioning: false,
        };
        let decoded = LivenessRecord::decode(&rec.encode().unwrap()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn decode_defaults_missing_flags() {
        // Records written before the flags existed decode with both false.
        let data = br#"{"node_id":4,"epoch":2,"expiration":{"wall_nanos":9,"logical":0}}"#;
        let rec = LivenessRecord::decode(data).unwrap();
        assert!(!rec.draining);
        assert!(!rec.decommissioning);
    }
}
