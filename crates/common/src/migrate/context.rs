use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::archive::StagedIndex;
use super::error::MigrationError;
use crate::ledger::{CheckpointStore, IdJournal};
use crate::path::TreePath;
use crate::progress::{CancelFlag, NoopObserver, Phase, ProgressEvent, ProgressObserver};
use crate::retry::RetryPolicy;

/// Source id to destination id for every unit created in this run.
///
/// The first mapping for a source id wins; inline copies of a shortcut
/// target never overwrite the canonical one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMapping {
    ids: HashMap<String, String>,
}

impl IdMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the source id was already mapped.
    pub fn insert(&mut self, source_id: impl Into<String>, dest_id: impl Into<String>) -> bool {
        match self.ids.entry(source_id.into()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(dest_id.into());
                true
            }
        }
    }

    pub fn get(&self, source_id: &str) -> Option<&str> {
        self.ids.get(source_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A shortcut seen during download, to be recreated once its target exists
/// at the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutRecord {
    pub shortcut_id: String,
    pub target_id: String,
    /// Folder that contains the shortcut
    pub parent: TreePath,
    /// Sanitized name of the shortcut, the same name its inline copy is
    /// staged under
    pub name: String,
}

impl ShortcutRecord {
    /// Ledger key for the recreated shortcut. `:` never survives
    /// sanitizing, so the key cannot collide with a staged path.
    pub fn ledger_key(&self) -> TreePath {
        TreePath::from_raw(format!("shortcut:{}", self.shortcut_id))
    }
}

/// State shared by every stage of one run.
pub struct MigrationContext {
    pub retry: RetryPolicy,
    pub observer: Arc<dyn ProgressObserver>,
    pub cancel: CancelFlag,
    pub ledger: Arc<dyn CheckpointStore>,
    /// Path index and shortcut records produced by the download
    pub index: StagedIndex,
    /// Filled by the upload, consumed by the shortcut pass
    pub id_mapping: IdMapping,
    /// Durable copy of `id_mapping`, when the run has one
    journal: Option<Arc<IdJournal>>,
}

impl MigrationContext {
    pub fn new(ledger: Arc<dyn CheckpointStore>) -> Self {
        Self {
            retry: RetryPolicy::default(),
            observer: Arc::new(NoopObserver),
            cancel: CancelFlag::new(),
            ledger,
            index: StagedIndex::default(),
            id_mapping: IdMapping::new(),
            journal: None,
        }
    }

    /// Persist new mappings to `journal`, starting from the pairs it holds.
    pub fn with_journal(mut self, journal: Arc<IdJournal>) -> Self {
        for (source_id, dest_id) in journal.replayed() {
            self.id_mapping.insert(source_id.as_str(), dest_id.as_str());
        }
        self.journal = Some(journal);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), MigrationError> {
        if self.cancel.is_cancelled() {
            tracing::warn!("cancellation requested, stopping between units");
            return Err(MigrationError::Cancelled);
        }
        Ok(())
    }

    /// Map `source_id` to `dest_id`, journaling the pair if it is new.
    pub(crate) fn map_id(&mut self, source_id: &str, dest_id: &str) -> Result<(), MigrationError> {
        if self.id_mapping.insert(source_id, dest_id) {
            if let Some(journal) = &self.journal {
                journal.append(source_id, dest_id)?;
            }
        }
        Ok(())
    }

    pub(crate) fn notify(&self, item: &str, phase: Phase, completed: u64, total: u64) {
        self.observer.on_progress(ProgressEvent {
            item: item.to_string(),
            phase,
            completed,
            total: total.max(completed),
        });
    }
}

impl std::fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationContext")
            .field("retry", &self.retry)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("ledger", &self.ledger)
            .field("indexed_paths", &self.index.paths.len())
            .field("shortcuts", &self.index.shortcuts.len())
            .field("mapped_ids", &self.id_mapping.len())
            .field("journal", &self.journal.as_ref().map(|j| j.path()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_mapping_wins() {
        let mut mapping = IdMapping::new();
        assert!(mapping.insert("src", "dest-1"));
        assert!(!mapping.insert("src", "dest-2"));
        assert_eq!(mapping.get("src"), Some("dest-1"));
        assert_eq!(mapping.get("other"), None);
    }

    #[test]
    fn test_journal_replays_and_records_new_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.ids");
        IdJournal::open(&path).unwrap().append("src-a", "dest-a").unwrap();

        let journal = Arc::new(IdJournal::open(&path).unwrap());
        let mut ctx = MigrationContext::new(Arc::new(crate::ledger::MemoryLedger::new()))
            .with_journal(journal);
        assert_eq!(ctx.id_mapping.get("src-a"), Some("dest-a"));

        ctx.map_id("src-a", "dest-other").unwrap();
        ctx.map_id("src-b", "dest-b").unwrap();

        let reopened = IdJournal::open(&path).unwrap();
        assert_eq!(
            reopened.replayed(),
            &[
                ("src-a".to_string(), "dest-a".to_string()),
                ("src-b".to_string(), "dest-b".to_string()),
            ]
        );
    }

    #[test]
    fn test_shortcut_key_is_not_a_staged_path() {
        let record = ShortcutRecord {
            shortcut_id: "s1".into(),
            target_id: "t1".into(),
            parent: TreePath::root(),
            name: "link".into(),
        };
        let key = record.ledger_key();
        assert_ne!(key, TreePath::root().child("shortcut:s1"));
        assert_eq!(key.as_str(), "shortcut:s1");
    }
}
