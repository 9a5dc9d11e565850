// Round-state checkpoints: one key per field, bincode values

use super::{Result, RoundStore, StorageError};
use crate::backend::Proposal;
use crate::hotstuff::types::{ProposedBlock, QuorumCert, View};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

pub const KEY_VIEW: &[u8] = b"view";
pub const KEY_HIGH_QC: &[u8] = b"high_qc";
pub const KEY_PREPARE_QC: &[u8] = b"prepare_qc";
pub const KEY_LOCK_QC: &[u8] = b"lock_qc";
pub const KEY_LOCKED_NODE: &[u8] = b"locked_node";
pub const KEY_COMMIT_QC: &[u8] = b"commit_qc";
pub const KEY_NODE: &[u8] = b"node";

/// Persisted subset of a round's state
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint<B> {
    pub view: Option<View>,
    pub high_qc: Option<QuorumCert>,
    pub prepare_qc: Option<QuorumCert>,
    pub lock_qc: Option<QuorumCert>,
    pub locked_node: Option<ProposedBlock<B>>,
    pub commit_qc: Option<QuorumCert>,
    pub node: Option<ProposedBlock<B>>,
}

impl<B> Default for Checkpoint<B> {
    fn default() -> Self {
        Self {
            view: None,
            high_qc: None,
            prepare_qc: None,
            lock_qc: None,
            locked_node: None,
            commit_qc: None,
            node: None,
        }
    }
}

impl<B: Proposal> Checkpoint<B> {
    /// Write every field; absent fields are deleted.
    ///
    /// Writes are not atomic across keys, so a crash can leave a mix of
    /// old and new fields. `load` consumers must validate heights.
    pub fn save(&self, store: &dyn RoundStore) -> Result<()> {
        put_field(store, KEY_VIEW, self.view.as_ref())?;
        put_field(store, KEY_HIGH_QC, self.high_qc.as_ref())?;
        put_field(store, KEY_PREPARE_QC, self.prepare_qc.as_ref())?;
        put_field(store, KEY_LOCK_QC, self.lock_qc.as_ref())?;
        put_field(store, KEY_LOCKED_NODE, self.locked_node.as_ref())?;
        put_field(store, KEY_COMMIT_QC, self.commit_qc.as_ref())?;
        put_field(store, KEY_NODE, self.node.as_ref())?;
        Ok(())
    }

    /// Read every field. Missing or undecodable entries come back as `None`.
    pub fn load(store: &dyn RoundStore) -> Self {
        Self {
            view: get_field(store, KEY_VIEW),
            high_qc: get_field(store, KEY_HIGH_QC),
            prepare_qc: get_field(store, KEY_PREPARE_QC),
            lock_qc: get_field(store, KEY_LOCK_QC),
            locked_node: get_field(store, KEY_LOCKED_NODE),
            commit_qc: get_field(store, KEY_COMMIT_QC),
            node: get_field(store, KEY_NODE),
        }
    }
}

fn put_field<T: Serialize>(store: &dyn RoundStore, key: &[u8], value: Option<&T>) -> Result<()> {
    match value {
        Some(value) => {
            let bytes = bincode::serialize(value)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            store.put(key, &bytes)
        }
        None => store.delete(key),
    }
}

fn get_field<T: DeserializeOwned>(store: &dyn RoundStore, key: &[u8]) -> Option<T> {
    let bytes = match store.get(key) {
        Ok(bytes) => bytes?,
        Err(e) => {
            warn!(key = %String::from_utf8_lossy(key), error = %e, "Failed to read checkpoint field");
            return None;
        }
    };
    match bincode::deserialize(&bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %String::from_utf8_lossy(key), error = %e, "Discarding undecodable checkpoint field");
            None
        }
    }
}
