//! Conditional read/write adapter over the replicated KV layer.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;

use crate::record::{liveness_key, liveness_key_end, LivenessRecord, NodeId};

/// Key span the range holding the liveness table must re-gossip once the
/// write commits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegossipTrigger {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

/// Errors surfaced by the replicated KV layer.
#[derive(Debug, Error)]
pub enum KvError {
    /// The stored value did not match the expected one; carries the stored
    /// bytes so callers can resolve the conflict.
    #[error("conditional put found an unexpected value")]
    ConditionFailed { actual: Option<Vec<u8>> },
    /// Transaction bookkeeping raced with the commit; safe to retry.
    #[error("transaction status error: {0}")]
    TransactionStatus(String),
    /// Commit outcome unknown; safe to retry an idempotent write.
    #[error("ambiguous commit result: {0}")]
    AmbiguousResult(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Replicated KV surface consumed by the liveness subsystem.
///
/// `conditional_put` must run as a one-phase commit that atomically writes
/// the value and requests re-gossip of the trigger span, so an aborted
/// commit can never leave intents on the liveness table.
#[async_trait]
pub trait LivenessKv: Send + Sync + 'static {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    async fn conditional_put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        expected: Option<Vec<u8>>,
        trigger: RegossipTrigger,
    ) -> Result<(), KvError>;
}

/// Outcome classification for one conditional-put attempt.
pub(crate) enum PutError {
    /// The stored record differed from the expected one.
    ConditionFailed(Option<LivenessRecord>),
    /// Transient KV failure; the caller loops.
    Retry(String),
    Fatal(anyhow::Error),
}

/// Typed record access on top of the raw KV surface.
pub(crate) struct RecordStore {
    kv: Arc<dyn LivenessKv>,
}

impl RecordStore {
    pub fn new(kv: Arc<dyn LivenessKv>) -> Self {
        Self { kv }
    }

    pub async fn read(&self, node_id: NodeId) -> anyhow::Result<Option<LivenessRecord>> {
        match self.kv.get(&liveness_key(node_id)).await {
            Ok(Some(data)) => LivenessRecord::decode(&data).map(Some),
            Ok(None) => Ok(None),
            Err(err) => Err(anyhow::Error::from(err).context("read liveness record")),
        }
    }

    pub async fn conditional_put(
        &self,
        record: &LivenessRecord,
        expected: Option<&LivenessRecord>,
    ) -> Result<(), PutError> {
        let key = liveness_key(record.node_id);
        let trigger = RegossipTrigger {
            start_key: key.clone(),
            end_key: liveness_key_end(record.node_id),
        };
        let value = record.encode().map_err(PutError::Fatal)?;
        let expected_bytes = match expected {
            Some(rec) => Some(rec.encode().map_err(PutError::Fatal)?),
            None => None,
        };

        match self.kv.conditional_put(&key, value, expected_bytes, trigger).await {
            Ok(()) => Ok(()),
            Err(KvError::ConditionFailed { actual }) => {
                let actual = match actual {
                    Some(data) => Some(
                        LivenessRecord::decode(&data)
                            .context("decode stored liveness record from conditional put")
                            .map_err(PutError::Fatal)?,
                    ),
                    None => None,
                };
                Err(PutError::ConditionFailed(actual))
            }
            Err(err @ (KvError::TransactionStatus(_) | KvError::AmbiguousResult(_))) => {
                Err(PutError::Retry(err.to_string()))
            }
            Err(KvError::Other(err)) => Err(PutError::Fatal(err)),
        }
    }
}
