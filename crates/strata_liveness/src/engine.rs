//! Local storage-engine flush coupling.
//!
//! Every liveness mutation forces a synced no-op write to each local engine
//! before touching the replicated table. A node whose disks have stalled
//! therefore stops refreshing its record and its leases expire on their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

/// One local storage engine that can durably sync a write batch.
pub trait Engine: Send + Sync + 'static {
    fn new_batch(&self) -> Box<dyn EngineBatch>;
}

/// A write batch; `log_data` stages a no-op record and `commit` persists it,
/// blocking until the device acknowledges when `sync` is set.
pub trait EngineBatch: Send {
    fn log_data(&mut self) -> anyhow::Result<()>;
    fn commit(self: Box<Self>, sync: bool) -> anyhow::Result<()>;
}

/// fjall-backed engine. The no-op record lands in a dedicated partition and
/// a synced commit forces the keyspace journal to disk.
pub struct FjallEngine {
    keyspace: Arc<Keyspace>,
    probe: PartitionHandle,
    seq: AtomicU64,
}

impl FjallEngine {
    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let probe = keyspace
            .open_partition("liveness_sync_probe", PartitionCreateOptions::default())
            .context("open liveness sync partition")?;
        Ok(Self {
            keyspace,
            probe,
            seq: AtomicU64::new(0),
        })
    }
}

impl Engine for FjallEngine {
    fn new_batch(&self) -> Box<dyn EngineBatch> {
        Box::new(FjallBatch {
            keyspace: self.keyspace.clone(),
            probe: self.probe.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            staged: false,
        })
    }
}

struct FjallBatch {
    keyspace: Arc<Keyspace>,
    probe: PartitionHandle,
    seq: u64,
    staged: bool,
}

impl EngineBatch for FjallBatch {
    fn log_data(&mut self) -> anyhow::Result<()> {
        self.staged = true;
        Ok(())
    }

    fn commit(self: Box<Self>, sync: bool) -> anyhow::Result<()> {
        if self.staged {
            let mut batch = self.keyspace.batch();
            batch.insert(&self.probe, b"probe".to_vec(), self.seq.to_be_bytes().to_vec());
            batch.commit().context("commit liveness sync batch")?;
        }
        if sync {
            self.keyspace
                .persist(PersistMode::SyncAll)
                .context("sync liveness batch to disk")?;
        }
        Ok(())
    }
}

/// In-memory engine for tests and single-process tooling.
#[derive(Default)]
pub struct MemEngine {
    synced: Arc<AtomicU64>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches committed with `sync = true`.
    pub fn synced_batches(&self) -> u64 {
        self.synced.load(Ordering::SeqCst)
    }
}

impl Engine for MemEngine {
    fn new_batch(&self) -> Box<dyn EngineBatch> {
        Box::new(MemBatch {
            synced: self.synced.clone(),
            staged: false,
        })
    }
}

struct MemBatch {
    synced: Arc<AtomicU64>,
    staged: bool,
}

impl EngineBatch for MemBatch {
    fn log_data(&mut self) -> anyhow::Result<()> {
        self.staged = true;
        Ok(())
    }

    fn commit(self: Box<Self>, sync: bool) -> anyhow::Result<()> {
        if self.staged && sync {
            self.synced.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
