//! Checkpoint ledger
//!
//! The ledger is the durable record of transfer units that fully completed
//! at a destination. A resumed upload consults it before every unit, so
//! membership has to be monotonic: paths are only ever added, and adding one
//! twice is a no-op.
//!
//! - [`CheckpointStore`]: set semantics over [`TreePath`](crate::path::TreePath)s
//! - [`FileLedger`]: append-only flat file, one path per line
//! - [`MemoryLedger`]: in-process, for tests and dry runs
//! - [`IdJournal`]: where each completed unit landed, kept next to the
//!   ledger so a resumed run still knows the destination ids

mod file;
mod ids;
mod memory;
mod provider;

pub use file::FileLedger;
pub use ids::IdJournal;
pub use memory::MemoryLedger;
pub use provider::{CheckpointStore, LedgerError};
