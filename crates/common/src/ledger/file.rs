use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::provider::{CheckpointStore, LedgerError};
use crate::path::TreePath;

/// Append-only ledger file with one relative path per line.
///
/// The whole file is read once at open to build the resume set. Afterwards
/// every new entry is appended and synced before `record` returns. `\n` and
/// `\r` inside names are written as `\n` / `\r` escapes; sanitized paths never
/// contain a backslash, so the encoding is unambiguous.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    inner: Mutex<FileLedgerInner>,
}

#[derive(Debug)]
struct FileLedgerInner {
    entries: BTreeSet<TreePath>,
    file: File,
}

impl FileLedger {
    /// Open (or create) the ledger at `path` and load every entry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let raw = read_complete(&path)?;

        let mut entries = BTreeSet::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            entries.insert(decode_line(line, idx + 1)?);
        }

        let file = open_append(&path)?;

        tracing::debug!(
            ledger = %path.display(),
            entries = entries.len(),
            "loaded checkpoint ledger"
        );

        Ok(Self {
            path,
            inner: Mutex::new(FileLedgerInner { entries, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileLedger {
    async fn contains(&self, path: &TreePath) -> Result<bool, LedgerError> {
        Ok(self.inner.lock().entries.contains(path))
    }

    async fn record(&self, path: &TreePath) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        if inner.entries.contains(path) {
            return Ok(());
        }

        let line = format!("{}\n", encode_line(path));
        append_synced(&mut inner.file, &line).map_err(|e| io_error(&self.path, e))?;
        inner.entries.insert(path.clone());
        Ok(())
    }

    async fn entries(&self) -> Result<BTreeSet<TreePath>, LedgerError> {
        Ok(self.inner.lock().entries.clone())
    }

    async fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.inner.lock().entries.len())
    }
}

pub(super) fn io_error(path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Contents of the file at `path` up to its last complete line, creating
/// parent directories on the way. A crash mid-append leaves a partial last
/// line; it never completed, so it is cut off before anything is appended
/// after it.
pub(super) fn read_complete(path: &Path) -> Result<String, LedgerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(path, e))?;
    }

    let mut raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(io_error(path, e)),
    };

    let complete_len = raw.rfind('\n').map(|idx| idx + 1).unwrap_or(0);
    if complete_len < raw.len() {
        tracing::warn!(
            file = %path.display(),
            "discarding partial trailing entry"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| io_error(path, e))?;
        file.set_len(complete_len as u64)
            .and_then(|_| file.sync_all())
            .map_err(|e| io_error(path, e))?;
        raw.truncate(complete_len);
    }
    Ok(raw)
}

pub(super) fn open_append(path: &Path) -> Result<File, LedgerError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_error(path, e))
}

/// Returns once `line` would survive a crash.
pub(super) fn append_synced(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes())?;
    file.sync_data()
}

fn encode_line(path: &TreePath) -> String {
    path.as_str().replace('\n', "\\n").replace('\r', "\\r")
}

fn decode_line(line: &str, line_no: usize) -> Result<TreePath, LedgerError> {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            other => {
                return Err(LedgerError::Corrupt {
                    line: line_no,
                    reason: format!("unknown escape {:?}", other),
                })
            }
        }
    }
    Ok(TreePath::from_raw(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger").join("resume.txt");

        let ledger = FileLedger::open(&path).unwrap();
        ledger.record(&TreePath::from_raw("a")).await.unwrap();
        ledger.record(&TreePath::from_raw("a/b.txt")).await.unwrap();
        drop(ledger);

        let reopened = FileLedger::open(&path).unwrap();
        assert!(reopened.contains(&TreePath::from_raw("a")).await.unwrap());
        assert!(reopened
            .contains(&TreePath::from_raw("a/b.txt"))
            .await
            .unwrap());
        assert_eq!(reopened.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.txt");

        let ledger = FileLedger::open(&path).unwrap();
        let entry = TreePath::from_raw("docs/report.pdf");
        ledger.record(&entry).await.unwrap();
        ledger.record(&entry).await.unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "docs/report.pdf\n");
    }

    #[tokio::test]
    async fn test_newlines_in_names_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.txt");
        let odd = TreePath::from_raw("line\none\rtwo");

        FileLedger::open(&path).unwrap().record(&odd).await.unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 1);

        let reopened = FileLedger::open(&path).unwrap();
        assert!(reopened.contains(&odd).await.unwrap());
    }

    #[tokio::test]
    async fn test_partial_trailing_line_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.txt");
        fs::write(&path, "done\nhalf-writ").unwrap();

        let ledger = FileLedger::open(&path).unwrap();
        assert_eq!(ledger.len().await.unwrap(), 1);
        ledger.record(&TreePath::from_raw("next")).await.unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "done\nnext\n");
    }

    #[test]
    fn test_unknown_escape_is_corrupt() {
        let err = decode_line("bad\\x", 3).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { line: 3, .. }));
    }
}
