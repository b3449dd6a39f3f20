use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::path::TreePath;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// A line in the ledger file could not be decoded
    #[error("corrupt ledger entry at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Whether `path` was recorded as fully transferred.
    async fn contains(&self, path: &TreePath) -> Result<bool, LedgerError>;

    /// Durably record `path`. Recording an existing member does nothing.
    ///
    /// Must only return once the entry would survive a crash.
    async fn record(&self, path: &TreePath) -> Result<(), LedgerError>;

    /// Every recorded path.
    async fn entries(&self) -> Result<BTreeSet<TreePath>, LedgerError>;

    /// Number of recorded paths
    async fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.entries().await?.len())
    }

    async fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len().await? == 0)
    }
}
