//! Hybrid-logical clock surface consumed by the liveness subsystem.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Hybrid-logical timestamp: wall-clock nanoseconds plus a logical counter
/// that orders events landing in the same nanosecond.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HlcTimestamp {
    pub wall_nanos: i64,
    pub logical: u32,
}

impl HlcTimestamp {
    pub const fn new(wall_nanos: i64, logical: u32) -> Self {
        Self { wall_nanos, logical }
    }

    /// Timestamp `d` later on the wall component, logical reset.
    pub fn add(self, d: Duration) -> Self {
        let nanos = d.as_nanos().min(i64::MAX as u128) as i64;
        Self {
            wall_nanos: self.wall_nanos.saturating_add(nanos),
            logical: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.wall_nanos == 0 && self.logical == 0
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.wall_nanos, self.logical)
    }
}

/// Clock readings consumed by liveness decisions.
///
/// `now` must be monotone within the process; restarts are covered by the
/// expiration-regress check on the heartbeat path.
pub trait Clock: Send + Sync + 'static {
    /// Current hybrid-logical reading.
    fn now(&self) -> HlcTimestamp;
    /// Raw wall-clock nanoseconds since the epoch.
    fn physical_now_nanos(&self) -> i64;
    /// Maximum clock offset tolerated between any two nodes in the cluster.
    fn max_offset(&self) -> Duration;
}

/// Wall-clock backed hybrid-logical clock.
pub struct SystemClock {
    max_offset: Duration,
    last: Mutex<HlcTimestamp>,
}

impl SystemClock {
    pub fn new(max_offset: Duration) -> Self {
        Self {
            max_offset,
            last: Mutex::new(HlcTimestamp::default()),
        }
    }
}

fn system_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

impl Clock for SystemClock {
    fn now(&self) -> HlcTimestamp {
        let physical = system_nanos();
        let mut last = self.last.lock().unwrap();
        if physical > last.wall_nanos {
            *last = HlcTimestamp::new(physical, 0);
        } else {
            // Wall clock stalled or stepped back; advance the logical part.
            last.logical = last.logical.saturating_add(1);
        }
        *last
    }

    fn physical_now_nanos(&self) -> i64 {
        system_nanos()
    }

    fn max_offset(&self) -> Duration {
        self.max_offset
    }
}

/// Manually advanced clock for tests, kept next to the system clock the way
/// the in-memory engine sits next to the on-disk one.
pub struct ManualClock {
    nanos: AtomicI64,
    max_offset: Duration,
}

impl ManualClock {
    pub fn new(start_nanos: i64, max_offset: Duration) -> Self {
        Self {
            nanos: AtomicI64::new(start_nanos),
            max_offset,
        }
    }

    pub fn advance(&self, d: Duration) {
        let nanos = d.as_nanos().min(i64::MAX as u128) as i64;
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn set_nanos(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> HlcTimestamp {
        HlcTimestamp::new(self.nanos.load(Ordering::SeqCst), 0)
    }

    fn physical_now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }

    fn max_offset(&self) -> Duration {
        self.max_offset
    }
}
