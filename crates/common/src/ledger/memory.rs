use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::provider::{CheckpointStore, LedgerError};
use crate::path::TreePath;

/// Ledger that lives only as long as the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<RwLock<BTreeSet<TreePath>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryLedger {
    async fn contains(&self, path: &TreePath) -> Result<bool, LedgerError> {
        Ok(self.inner.read().contains(path))
    }

    async fn record(&self, path: &TreePath) -> Result<(), LedgerError> {
        self.inner.write().insert(path.clone());
        Ok(())
    }

    async fn entries(&self) -> Result<BTreeSet<TreePath>, LedgerError> {
        Ok(self.inner.read().clone())
    }
}
