//! Node liveness service: heartbeat loop, epoch increments, draining and
//! decommissioning transitions, and liveness queries.
//!
//! Every node refreshes one record in the replicated liveness table before
//! its expiration. Peers observe those records through gossip and, once a
//! record has expired, bump its epoch to invalidate the epoch-based leases
//! held by the node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;

use crate::cache::{IsLiveCallback, LivenessCache};
use crate::clock::{Clock, HlcTimestamp};
use crate::engine::Engine;
use crate::gossip::{register_liveness_listener, Gossip};
use crate::metrics::{LivenessMetrics, LivenessMetricsSnapshot};
use crate::record::{LivenessRecord, LivenessStatus, NodeId};
use crate::store::{LivenessKv, PutError, RecordStore};

/// Heartbeats slower than this log a warning.
const SLOW_HEARTBEAT_WARN: Duration = Duration::from_secs(1);
/// Base pause between retries of transient liveness failures.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Invoked after this node commits a liveness update.
pub type HeartbeatCallback = Arc<dyn Fn() + Send + Sync>;

/// Failures surfaced by liveness operations.
///
/// Only the structural variants escape to callers; benign races and
/// transient KV failures are resolved inside the mutators.
#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("node not in the liveness table")]
    NoLivenessRecord,
    #[error("heartbeat failed on epoch increment")]
    EpochIncremented,
    #[error("cannot increment epoch on live node")]
    CannotIncrementLive,
    /// Heartbeat raced with a concurrent refresher; treated as success.
    #[error("node already live")]
    NodeAlreadyLive,
    /// A peer already bumped the epoch; treated as success.
    #[error("epoch already incremented")]
    EpochAlreadyIncremented,
    #[error("proposed liveness update expires earlier than previous record")]
    ExpirationRegress,
    /// Epoch race during a decommission attempt; retried internally.
    #[error("failed to change the decommissioning status")]
    ChangeDecommissioningFailed,
    /// Transient KV failure; looped internally.
    #[error("retryable liveness failure: {0}")]
    RetryLiveness(String),
    #[error("unexpected liveness epoch {actual}; expected >= {expected}")]
    UnexpectedEpoch { expected: u64, actual: u64 },
    #[error("liveness record mismatch on conditional put")]
    RecordMismatch,
    #[error("not live")]
    NotLive,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Configuration for the liveness service.
#[derive(Clone, Copy, Debug)]
pub struct LivenessConfig {
    /// Duration after which an unrefreshed record stops being live.
    pub liveness_threshold: Duration,
    /// Slack before expiration within which the record must be renewed; the
    /// heartbeat interval is `liveness_threshold - renewal_duration`.
    pub renewal_duration: Duration,
    /// Duration past expiration after which a node counts as dead.
    pub time_until_node_dead: Duration,
}

impl LivenessConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        self.liveness_threshold.saturating_sub(self.renewal_duration)
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            liveness_threshold: Duration::from_secs(9),
            renewal_duration: Duration::from_millis(4_500),
            time_until_node_dead: Duration::from_secs(300),
        }
    }
}

/// Entry in the is-live map: current liveness plus the record's epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsLiveEntry {
    pub is_live: bool,
    pub epoch: u64,
}

/// Proposed record plus write-path flags.
struct LivenessUpdate {
    record: LivenessRecord,
    /// Skip the cache pre-check and trust only the conditional put. Set by
    /// mutations that cannot trust their cached view.
    ignore_cache: bool,
}

/// Holds the heartbeat pause and both mutation gates for the lifetime of
/// the guard, freezing every liveness write. Test hook.
pub struct HeartbeatsDisabled {
    _self_permit: OwnedSemaphorePermit,
    _peer_permit: OwnedSemaphorePermit,
}

/// Node liveness service. One instance per process; shared via `Arc`.
pub struct NodeLiveness {
    clock: Arc<dyn Clock>,
    store: RecordStore,
    engines: Vec<Arc<dyn Engine>>,
    gossip: Arc<dyn Gossip>,
    config: LivenessConfig,
    cache: Arc<LivenessCache>,
    metrics: LivenessMetrics,
    self_gate: Arc<Semaphore>,
    peer_gate: Arc<Semaphore>,
    heartbeat_paused: AtomicBool,
    heartbeat_token_tx: mpsc::Sender<()>,
    heartbeat_token_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    heartbeat_callback: Mutex<Option<HeartbeatCallback>>,
}

impl NodeLiveness {
    pub fn new(
        clock: Arc<dyn Clock>,
        kv: Arc<dyn LivenessKv>,
        engines: Vec<Arc<dyn Engine>>,
        gossip: Arc<dyn Gossip>,
        config: LivenessConfig,
    ) -> Arc<Self> {
        let cache = Arc::new(LivenessCache::new(clock.clone()));
        let (heartbeat_token_tx, heartbeat_token_rx) = mpsc::channel(1);
        heartbeat_token_tx
            .try_send(())
            .expect("fresh heartbeat token slot");

        let nl = Arc::new(Self {
            clock,
            store: RecordStore::new(kv),
            engines,
            gossip,
            config,
            cache,
            metrics: LivenessMetrics::default(),
            self_gate: Arc::new(Semaphore::new(1)),
            peer_gate: Arc::new(Semaphore::new(1)),
            heartbeat_paused: AtomicBool::new(false),
            heartbeat_token_tx,
            heartbeat_token_rx: tokio::sync::Mutex::new(heartbeat_token_rx),
            heartbeat_callback: Mutex::new(None),
        });
        register_liveness_listener(nl.gossip.as_ref(), nl.cache.clone());
        nl
    }

    /// Single-slot gate serializing mutations per target: one gate for the
    /// local node, one shared gate for every peer.
    fn gate(&self, node_id: NodeId) -> &Semaphore {
        if node_id == self.gossip.node_id() {
            &self.self_gate
        } else {
            &self.peer_gate
        }
    }

    async fn acquire_gate(&self, node_id: NodeId) -> SemaphorePermit<'_> {
        // The gates live as long as the service and are never closed.
        self.gate(node_id)
            .acquire()
            .await
            .expect("liveness gate closed")
    }

    async fn backoff(&self) {
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..RETRY_BACKOFF);
        tokio::time::sleep(RETRY_BACKOFF + jitter).await;
    }

    // ---- heartbeats -----------------------------------------------------

    /// Refresh this node's expiration with a conditional put against
    /// `expected`; pass `None` to create the record.
    pub async fn heartbeat(&self, expected: Option<LivenessRecord>) -> Result<(), LivenessError> {
        self.heartbeat_internal(expected, false).await
    }

    async fn heartbeat_internal(
        &self,
        expected: Option<LivenessRecord>,
        increment_epoch: bool,
    ) -> Result<(), LivenessError> {
        let started = Instant::now();
        let result = self.heartbeat_attempt(expected, increment_epoch).await;
        let elapsed = started.elapsed();
        self.metrics.record_heartbeat_latency(elapsed);
        if elapsed > SLOW_HEARTBEAT_WARN {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "slow liveness heartbeat");
        }
        match result {
            // A concurrent refresher (e.g. a lease acquisition) already
            // moved the record forward; the node is live either way.
            Err(LivenessError::NodeAlreadyLive) | Ok(()) => {
                self.metrics.record_heartbeat_success();
                Ok(())
            }
            Err(err) => {
                self.metrics.record_heartbeat_failure();
                Err(err)
            }
        }
    }

    async fn heartbeat_attempt(
        &self,
        expected: Option<LivenessRecord>,
        increment_epoch: bool,
    ) -> Result<(), LivenessError> {
        let node_id = self.gossip.node_id();
        let _permit = self.acquire_gate(node_id).await;

        let mut record = expected.unwrap_or(LivenessRecord {
            node_id,
            epoch: 1,
            ..Default::default()
        });
        if expected.is_some() && increment_epoch {
            record.epoch += 1;
            record.draining = false;
        }
        // Liveness checks add the maximum clock offset to their reading, so
        // the proposed expiration has to cover it.
        record.expiration = self
            .clock
            .now()
            .add(self.config.liveness_threshold + self.clock.max_offset());
        // Guards against the wall clock moving backwards across restarts.
        if let Some(prev) = &expected {
            if record.expiration < prev.expiration {
                return Err(LivenessError::ExpirationRegress);
            }
        }

        let update = LivenessUpdate {
            record,
            ignore_cache: false,
        };
        self.update_liveness(&update, expected.as_ref(), |actual| match actual {
            Some(actual) => {
                self.cache.maybe_update(actual);
                if actual.is_live(self.clock.now(), self.clock.max_offset()) && !increment_epoch {
                    Some(LivenessError::NodeAlreadyLive)
                } else {
                    Some(LivenessError::EpochIncremented)
                }
            }
            None => Some(LivenessError::EpochIncremented),
        })
        .await?;

        tracing::debug!(node_id, expiration = %update.record.expiration, "heartbeat committed");
        self.cache.maybe_update(update.record);
        Ok(())
    }

    /// Start the periodic self-heartbeat task. `on_self_commit`, when set,
    /// runs after every liveness update this node commits. The loop stops
    /// when `shutdown` fires or its sender is dropped.
    pub fn start_heartbeats(
        self: &Arc<Self>,
        on_self_commit: Option<HeartbeatCallback>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        *self.heartbeat_callback.lock().unwrap() = on_self_commit;
        let nl = self.clone();
        tokio::spawn(async move {
            tracing::debug!("starting liveness heartbeat loop");
            let mut increment_epoch = true;
            let mut ticker = tokio::time::interval(nl.config.heartbeat_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Consume the interval's immediate first tick so in-loop waits
            // cover a full interval.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = nl.take_heartbeat_token() => {}
                    _ = &mut shutdown => return,
                }
                // Bound the attempt by the slack before the record expires.
                let attempt_timeout = nl
                    .config
                    .liveness_threshold
                    .saturating_sub(nl.config.heartbeat_interval());
                let attempt = async {
                    // Retry within the tick when the put loses an epoch race.
                    loop {
                        let expected = nl.self_record_opt();
                        match nl.heartbeat_internal(expected, increment_epoch).await {
                            Ok(()) => {
                                // The start-of-process epoch bump happens at
                                // most once.
                                increment_epoch = false;
                            }
                            Err(LivenessError::EpochIncremented) => {
                                tracing::info!("heartbeat lost an epoch race; retrying");
                                nl.backoff().await;
                                continue;
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "failed node liveness heartbeat");
                            }
                        }
                        break;
                    }
                };
                if tokio::time::timeout(attempt_timeout, attempt).await.is_err() {
                    tracing::warn!("liveness heartbeat timed out before the record was refreshed");
                }
                nl.put_heartbeat_token();
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut shutdown => return,
                }
            }
        })
    }

    async fn take_heartbeat_token(&self) {
        let mut rx = self.heartbeat_token_rx.lock().await;
        // The sender lives as long as the service, so this always yields.
        let _ = rx.recv().await;
    }

    fn put_heartbeat_token(&self) {
        // Capacity one, single token in circulation.
        let _ = self.heartbeat_token_tx.try_send(());
    }

    /// Pause or resume the heartbeat loop. Pausing waits for any in-flight
    /// heartbeat to finish, so no new conditional puts for the self record
    /// start after this returns. Test hook.
    pub async fn pause_heartbeat(&self, pause: bool) {
        if pause {
            if !self.heartbeat_paused.swap(true, Ordering::SeqCst) {
                self.take_heartbeat_token().await;
            }
        } else if self.heartbeat_paused.swap(false, Ordering::SeqCst) {
            self.put_heartbeat_token();
        }
    }

    /// Pause the loop and hold both mutation gates until the guard drops.
    /// The loop stays paused afterwards; call `pause_heartbeat(false)` to
    /// resume it. Test hook.
    pub async fn disable_all_heartbeats_for_test(&self) -> HeartbeatsDisabled {
        self.pause_heartbeat(true).await;
        let self_permit = self
            .self_gate
            .clone()
            .acquire_owned()
            .await
            .expect("liveness gate closed");
        let peer_permit = self
            .peer_gate
            .clone()
            .acquire_owned()
            .await
            .expect("liveness gate closed");
        HeartbeatsDisabled {
            _self_permit: self_permit,
            _peer_permit: peer_permit,
        }
    }

    // ---- epoch increments ----------------------------------------------

    /// Invalidate `expected`'s epoch-based leases by bumping its epoch.
    /// Requires the record to be expired at this node's clock.
    pub async fn increment_epoch(&self, expected: LivenessRecord) -> Result<(), LivenessError> {
        let _permit = self.acquire_gate(expected.node_id).await;
        if expected.is_live(self.clock.now(), self.clock.max_offset()) {
            return Err(LivenessError::CannotIncrementLive);
        }

        let mut record = expected;
        record.epoch += 1;
        let update = LivenessUpdate {
            record,
            ignore_cache: false,
        };
        let result = self
            .update_liveness(&update, Some(&expected), |actual| {
                let outcome = match actual {
                    Some(actual) if actual.epoch > expected.epoch => {
                        LivenessError::EpochAlreadyIncremented
                    }
                    Some(actual) if actual.epoch < expected.epoch => {
                        LivenessError::UnexpectedEpoch {
                            expected: expected.epoch,
                            actual: actual.epoch,
                        }
                    }
                    Some(_) => LivenessError::RecordMismatch,
                    None => LivenessError::UnexpectedEpoch {
                        expected: expected.epoch,
                        actual: 0,
                    },
                };
                if let Some(actual) = actual {
                    self.cache.maybe_update(actual);
                }
                Some(outcome)
            })
            .await;
        match result {
            Ok(()) => {}
            // Someone else already invalidated the epoch.
            Err(LivenessError::EpochAlreadyIncremented) => return Ok(()),
            Err(err) => return Err(err),
        }

        tracing::info!(
            node_id = update.record.node_id,
            epoch = update.record.epoch,
            "incremented liveness epoch"
        );
        self.cache.maybe_update(update.record);
        self.metrics.record_epoch_increment();
        Ok(())
    }

    // ---- draining and decommissioning ----------------------------------

    /// Mark this node as draining (or clear the mark), retrying until the
    /// change sticks. Cancel by dropping the future.
    pub async fn set_draining(&self, drain: bool) {
        loop {
            let expected = self.self_record_opt();
            if self.set_draining_internal(expected, drain).await.is_ok() {
                return;
            }
            self.backoff().await;
        }
    }

    async fn set_draining_internal(
        &self,
        expected: Option<LivenessRecord>,
        drain: bool,
    ) -> Result<(), LivenessError> {
        let node_id = self.gossip.node_id();
        let _permit = self.acquire_gate(node_id).await;

        let mut record = expected.unwrap_or(LivenessRecord {
            node_id,
            epoch: 1,
            ..Default::default()
        });
        record.draining = drain;
        let update = LivenessUpdate {
            record,
            ignore_cache: true,
        };

        let mut already_set = false;
        let result = self
            .update_liveness(&update, expected.as_ref(), |actual| {
                if let Some(actual) = actual {
                    self.cache.maybe_update(actual);
                    if actual.draining == drain {
                        already_set = true;
                        return None;
                    }
                }
                Some(LivenessError::RecordMismatch)
            })
            .await;
        match result {
            Ok(()) => {
                if !already_set {
                    self.cache.maybe_update(update.record);
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(drain, error = %err, "failed to update draining state");
                Err(err)
            }
        }
    }

    /// Mark `node_id` as decommissioning (or clear the mark). Returns
    /// whether this call committed the change.
    pub async fn set_decommissioning(
        &self,
        node_id: NodeId,
        decommission: bool,
    ) -> Result<bool, LivenessError> {
        loop {
            match self.set_decommissioning_attempt(node_id, decommission).await {
                // Raced with an epoch increment; retry on a fresh record.
                Err(LivenessError::ChangeDecommissioningFailed) => continue,
                other => return other,
            }
        }
    }

    async fn set_decommissioning_attempt(
        &self,
        node_id: NodeId,
        decommission: bool,
    ) -> Result<bool, LivenessError> {
        let _permit = self.acquire_gate(node_id).await;

        // Read the authoritative record rather than gossip: a freshly
        // restarted caller may not have seen the target through gossip at
        // all, yet must still be able to decommission it.
        let stored = self.store.read(node_id).await?;
        let Some(stored) = stored else {
            return Err(LivenessError::NoLivenessRecord);
        };
        // Heal this node's view before the conditional put.
        self.cache.maybe_update(stored);

        let mut record = stored;
        record.decommissioning = decommission;
        let update = LivenessUpdate {
            record,
            ignore_cache: true,
        };

        let mut condition_failed = false;
        self.update_liveness(&update, Some(&stored), |actual| {
            condition_failed = true;
            match actual {
                Some(actual) if actual.decommissioning == decommission => None,
                _ => Some(LivenessError::ChangeDecommissioningFailed),
            }
        })
        .await?;
        Ok(!condition_failed && stored.decommissioning != decommission)
    }

    // ---- conditional-put driver ----------------------------------------

    /// Shared driver for every liveness mutation: flush local engines, run
    /// the conditional put, classify the outcome. On a condition failure
    /// `on_mismatch` receives the stored record and decides the result;
    /// returning `None` settles the attempt as success. Transient KV
    /// failures loop with jittered backoff; cancel by dropping the future.
    async fn update_liveness<F>(
        &self,
        update: &LivenessUpdate,
        expected: Option<&LivenessRecord>,
        mut on_mismatch: F,
    ) -> Result<(), LivenessError>
    where
        F: FnMut(Option<LivenessRecord>) -> Option<LivenessError>,
    {
        loop {
            match self
                .update_liveness_attempt(update, expected, &mut on_mismatch)
                .await
            {
                Err(LivenessError::RetryLiveness(reason)) => {
                    tracing::info!(
                        node_id = update.record.node_id,
                        reason = %reason,
                        "retrying liveness update"
                    );
                    self.backoff().await;
                }
                other => return other,
            }
        }
    }

    async fn update_liveness_attempt<F>(
        &self,
        update: &LivenessUpdate,
        expected: Option<&LivenessRecord>,
        on_mismatch: &mut F,
    ) -> Result<(), LivenessError>
    where
        F: FnMut(Option<LivenessRecord>) -> Option<LivenessError>,
    {
        // Flush every local engine first: a node whose disks have stalled
        // must not keep representing itself as live.
        self.flush_engines()?;

        // Consult the cached view to skip conditional puts that are already
        // known to be doomed.
        if !update.ignore_cache {
            if let Some(cached) = self.cache.get(update.record.node_id) {
                if expected.map_or(true, |e| cached != *e) {
                    return on_mismatch(Some(cached)).map_or(Ok(()), Err);
                }
            }
        }

        match self.store.conditional_put(&update.record, expected).await {
            Ok(()) => {
                let callback = self.heartbeat_callback.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback();
                }
                Ok(())
            }
            Err(PutError::ConditionFailed(actual)) => on_mismatch(actual).map_or(Ok(()), Err),
            Err(PutError::Retry(reason)) => Err(LivenessError::RetryLiveness(reason)),
            Err(PutError::Fatal(err)) => Err(LivenessError::Storage(err)),
        }
    }

    fn flush_engines(&self) -> Result<(), LivenessError> {
        for engine in &self.engines {
            let mut batch = engine.new_batch();
            batch
                .log_data()
                .map_err(|err| LivenessError::Storage(err.context("stage liveness no-op write")))?;
            batch
                .commit(true)
                .map_err(|err| LivenessError::Storage(err.context("sync liveness no-op write")))?;
        }
        Ok(())
    }

    // ---- queries --------------------------------------------------------

    fn self_record_opt(&self) -> Option<LivenessRecord> {
        self.cache.get(self.gossip.node_id())
    }

    /// Cached record for this node.
    pub fn self_record(&self) -> Result<LivenessRecord, LivenessError> {
        self.get_liveness(self.gossip.node_id())
    }

    /// Cached record for `node_id`.
    pub fn get_liveness(&self, node_id: NodeId) -> Result<LivenessRecord, LivenessError> {
        self.cache.get(node_id).ok_or(LivenessError::NoLivenessRecord)
    }

    /// Every record known to the cache, removed nodes included.
    pub fn get_livenesses(&self) -> Vec<LivenessRecord> {
        self.cache.snapshot()
    }

    pub fn is_live(&self, node_id: NodeId) -> Result<bool, LivenessError> {
        let record = self.get_liveness(node_id)?;
        Ok(record.is_live(self.clock.now(), self.clock.max_offset()))
    }

    /// Live, not draining, not decommissioning, and inside the dead timeout.
    pub fn is_healthy(&self, node_id: NodeId) -> Result<bool, LivenessError> {
        let record = self.get_liveness(node_id)?;
        let status = record.status(
            self.clock.now(),
            self.config.time_until_node_dead,
            self.clock.max_offset(),
        );
        Ok(status == LivenessStatus::Live)
    }

    /// Per-node liveness snapshot, skipping nodes that are both dead and
    /// decommissioning (fully removed from the cluster).
    pub fn get_is_live_map(&self) -> HashMap<NodeId, IsLiveEntry> {
        let now = self.clock.now();
        let max_offset = self.clock.max_offset();
        self.cache
            .snapshot()
            .into_iter()
            .filter_map(|record| {
                let is_live = record.is_live(now, max_offset);
                if !is_live && record.decommissioning {
                    return None;
                }
                Some((
                    record.node_id,
                    IsLiveEntry {
                        is_live,
                        epoch: record.epoch,
                    },
                ))
            })
            .collect()
    }

    /// Status classification for every known node, removed nodes included.
    pub fn get_liveness_status_map(&self) -> HashMap<NodeId, LivenessStatus> {
        let now = self.clock.now();
        let max_offset = self.clock.max_offset();
        self.cache
            .snapshot()
            .into_iter()
            .map(|record| {
                let status = record.status(now, self.config.time_until_node_dead, max_offset);
                (record.node_id, status)
            })
            .collect()
    }

    /// Current clock reading plus `node_id`'s epoch, provided the node is
    /// live at that reading.
    pub fn live_clock(&self, node_id: NodeId) -> Result<(HlcTimestamp, u64), LivenessError> {
        let now = self.clock.now();
        let record = self.get_liveness(node_id)?;
        if !record.is_live(now, self.clock.max_offset()) {
            return Err(LivenessError::NotLive);
        }
        Ok((now, record.epoch))
    }

    /// Count of live nodes in this node's view. Reports 0 when this node is
    /// not itself live: a non-live node's view of the cluster is suspect,
    /// and every live node reports the gauge instead.
    pub fn live_node_count(&self) -> u64 {
        let now = self.clock.now();
        let max_offset = self.clock.max_offset();
        let live_self = self
            .self_record_opt()
            .map_or(false, |record| record.is_live(now, max_offset));
        if !live_self {
            return 0;
        }
        self.cache
            .snapshot()
            .iter()
            .filter(|record| record.is_live(now, max_offset))
            .count() as u64
    }

    /// Register a callback fired when any node's liveness transitions to
    /// live in the cache. Callbacks must not call back into the cache.
    pub fn register_callback(&self, callback: IsLiveCallback) {
        self.cache.register_callback(callback);
    }

    pub fn metrics(&self) -> LivenessMetricsSnapshot {
        self.metrics.snapshot(self.live_node_count())
    }

    pub fn liveness_threshold(&self) -> Duration {
        self.config.liveness_threshold
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval()
    }
}
