//! Shared in-memory cluster fixtures for liveness integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use strata_liveness::{
    gossip_key, liveness_key, Engine, EngineBatch, Gossip, GossipCallback, KvError, LivenessConfig,
    LivenessKv, LivenessRecord, ManualClock, NodeId, NodeLiveness, RegossipTrigger,
};

/// Clock origin for every test node, well away from zero.
pub const CLOCK_START_NANOS: i64 = 1_000_000_000_000;
/// Maximum clock offset assumed between test nodes.
pub const MAX_OFFSET: Duration = Duration::from_millis(250);

/// Tight heartbeat cadence so loop tests finish quickly.
pub fn test_config() -> LivenessConfig {
    LivenessConfig {
        liveness_threshold: Duration::from_secs(3),
        renewal_duration: Duration::from_millis(2_900),
        time_until_node_dead: Duration::from_secs(30),
    }
}

/// In-memory replicated liveness table shared by every node in a test,
/// with re-gossip wiring, inflight accounting, and fault injection.
pub struct TestKv {
    records: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    gossips: Mutex<Vec<Arc<TestGossip>>>,
    inflight_puts: AtomicU64,
    max_inflight_puts: AtomicU64,
    puts_started: AtomicU64,
    puts_committed: AtomicU64,
    /// Fail this many upcoming puts with an ambiguous result.
    transient_failures: AtomicU64,
    put_delay: Mutex<Duration>,
}

impl TestKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            gossips: Mutex::new(Vec::new()),
            inflight_puts: AtomicU64::new(0),
            max_inflight_puts: AtomicU64::new(0),
            puts_started: AtomicU64::new(0),
            puts_committed: AtomicU64::new(0),
            transient_failures: AtomicU64::new(0),
            put_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Wire a node's gossip into the table's re-gossip trigger.
    pub fn attach(&self, gossip: Arc<TestGossip>) {
        self.gossips.lock().unwrap().push(gossip);
    }

    /// Seed or overwrite a record directly, without gossiping it.
    pub fn put_record(&self, record: &LivenessRecord) {
        let value = record.encode().expect("encode test record");
        self.records
            .lock()
            .unwrap()
            .insert(liveness_key(record.node_id), value);
    }

    pub fn stored_record(&self, node_id: NodeId) -> Option<LivenessRecord> {
        let records = self.records.lock().unwrap();
        let data = records.get(&liveness_key(node_id))?;
        Some(LivenessRecord::decode(data).expect("decode stored test record"))
    }

    pub fn puts_started(&self) -> u64 {
        self.puts_started.load(Ordering::SeqCst)
    }

    pub fn committed_puts(&self) -> u64 {
        self.puts_committed.load(Ordering::SeqCst)
    }

    pub fn max_inflight_puts(&self) -> u64 {
        self.max_inflight_puts.load(Ordering::SeqCst)
    }

    pub fn fail_next_puts(&self, count: u64) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Hold each conditional put for `delay` to widen race windows.
    pub fn set_put_delay(&self, delay: Duration) {
        *self.put_delay.lock().unwrap() = delay;
    }

    fn broadcast(&self, value: &[u8]) {
        let record = LivenessRecord::decode(value).expect("decode broadcast record");
        let key = gossip_key(record.node_id);
        let gossips = self.gossips.lock().unwrap().clone();
        for gossip in gossips {
            gossip.publish(&key, value);
        }
    }
}

#[async_trait]
impl LivenessKv for TestKv {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn conditional_put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        expected: Option<Vec<u8>>,
        _trigger: RegossipTrigger,
    ) -> Result<(), KvError> {
        self.puts_started.fetch_add(1, Ordering::SeqCst);
        let inflight = self.inflight_puts.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight_puts.fetch_max(inflight, Ordering::SeqCst);

        let delay = *self.put_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(KvError::AmbiguousResult("injected fault".into()))
        } else {
            let mut records = self.records.lock().unwrap();
            let actual = records.get(key).cloned();
            if actual == expected {
                records.insert(key.to_vec(), value.clone());
                Ok(())
            } else {
                Err(KvError::ConditionFailed { actual })
            }
        };

        if result.is_ok() {
            self.puts_committed.fetch_add(1, Ordering::SeqCst);
            // The commit trigger re-gossips the written record.
            self.broadcast(&value);
        }
        self.inflight_puts.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Per-node gossip endpoint; publishes fan out to prefix subscribers.
pub struct TestGossip {
    node_id: NodeId,
    callbacks: Mutex<Vec<(String, GossipCallback)>>,
}

impl TestGossip {
    pub fn new(node_id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn publish(&self, key: &str, value: &[u8]) {
        let callbacks = self.callbacks.lock().unwrap();
        for (prefix, callback) in callbacks.iter() {
            if key.starts_with(prefix.as_str()) {
                callback(key, value);
            }
        }
    }

    /// Deliver a record to this node as if it arrived through gossip.
    pub fn publish_record(&self, record: &LivenessRecord) {
        let value = record.encode().expect("encode gossip record");
        self.publish(&gossip_key(record.node_id), &value);
    }
}

impl Gossip for TestGossip {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn register_prefix_callback(&self, prefix: &str, callback: GossipCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .push((prefix.to_string(), callback));
    }
}

/// Engine whose synced commits can be stalled to simulate a wedged disk.
pub struct StallableEngine {
    stalled: Arc<AtomicBool>,
    synced: Arc<AtomicU64>,
}

impl StallableEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stalled: Arc::new(AtomicBool::new(false)),
            synced: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn stall(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn synced_batches(&self) -> u64 {
        self.synced.load(Ordering::SeqCst)
    }
}

impl Engine for StallableEngine {
    fn new_batch(&self) -> Box<dyn EngineBatch> {
        Box::new(StallableBatch {
            stalled: self.stalled.clone(),
            synced: self.synced.clone(),
            staged: false,
        })
    }
}

struct StallableBatch {
    stalled: Arc<AtomicBool>,
    synced: Arc<AtomicU64>,
    staged: bool,
}

impl EngineBatch for StallableBatch {
    fn log_data(&mut self) -> anyhow::Result<()> {
        self.staged = true;
        Ok(())
    }

    fn commit(self: Box<Self>, sync: bool) -> anyhow::Result<()> {
        // Block the way a wedged device would.
        while self.stalled.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.staged && sync {
            self.synced.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// One node wired to a shared test table.
pub struct TestNode {
    pub liveness: Arc<NodeLiveness>,
    pub clock: Arc<ManualClock>,
    pub gossip: Arc<TestGossip>,
    pub engine: Arc<StallableEngine>,
}

impl TestNode {
    pub fn new(node_id: NodeId, kv: &Arc<TestKv>) -> Self {
        Self::with_config(node_id, kv, test_config())
    }

    pub fn with_config(node_id: NodeId, kv: &Arc<TestKv>, config: LivenessConfig) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(CLOCK_START_NANOS, MAX_OFFSET));
        let gossip = TestGossip::new(node_id);
        let engine = StallableEngine::new();
        let liveness = NodeLiveness::new(
            clock.clone(),
            kv.clone(),
            vec![engine.clone() as Arc<dyn Engine>],
            gossip.clone(),
            config,
        );
        kv.attach(gossip.clone());
        Self {
            liveness,
            clock,
            gossip,
            engine,
        }
    }

    pub fn start_loop(&self) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = self.liveness.start_heartbeats(None, shutdown_rx);
        (handle, shutdown_tx)
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}
