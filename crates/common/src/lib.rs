/**
 * Static formats that live workspace documents
 *  are exported to before staging.
 */
pub mod export;
/**
 * Append-only record of destination paths that
 *  finished uploading. Lets an interrupted run
 *  pick up where it stopped.
 */
pub mod ledger;
/**
 * The migration pipeline: download into a staging
 *  archive, upload from the unpacked tree, then
 *  permissions and shortcuts.
 */
pub mod migrate;
/**
 * Sanitized, slash-delimited paths that key
 *  the archive, the index and the ledger.
 */
pub mod path;
pub mod progress;
/**
 * Bounded exponential backoff for transient
 *  remote failures.
 */
pub mod retry;
/**
 * The remote store abstraction, plus the Drive
 *  REST client and an in-memory store.
 */
pub mod store;

pub mod prelude {
    pub use crate::ledger::{CheckpointStore, FileLedger, LedgerError, MemoryLedger};
    pub use crate::migrate::{
        DomainMapping, Migration, MigrationError, MigrationPlan, MigrationReport, RootSelector,
        Workspace,
    };
    pub use crate::path::TreePath;
    pub use crate::progress::{
        CancelFlag, ChannelObserver, NoopObserver, ProgressEvent, ProgressObserver,
    };
    pub use crate::retry::{RetryError, RetryPolicy};
    pub use crate::store::{DriveConfig, DriveStore, MemoryStore, RemoteStore, StoreError};
}
