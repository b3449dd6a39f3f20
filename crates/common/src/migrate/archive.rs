//! Staging archive
//!
//! The download stage streams the tree into a gzip-compressed tar archive.
//! Entries go to `<archive>.partial` and the file is renamed into place once
//! the encoder has been flushed; the index is written last and serves as the
//! commit marker, so an archive without its index is never reused.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tar::{EntryType, Header};

use super::context::ShortcutRecord;
use crate::path::TreePath;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("archive I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("archive index is invalid: {0}")]
    Index(#[from] serde_json::Error),
}

impl ArchiveError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> ArchiveError + '_ {
        move |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Everything the download learned that the archive itself cannot carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedIndex {
    /// Staged path to source id for every canonically placed unit
    pub paths: BTreeMap<TreePath, String>,
    pub shortcuts: Vec<ShortcutRecord>,
    /// Folders whose staged content is missing something
    pub incomplete: BTreeSet<TreePath>,
    /// Failures anywhere in the tree, the root included
    pub failures: usize,
}

impl StagedIndex {
    pub fn is_complete(&self) -> bool {
        self.failures == 0
    }

    /// Note a failure at `path`: every folder above it is now incomplete.
    pub fn mark_failed(&mut self, path: &TreePath) {
        self.failures += 1;
        let segments: Vec<&str> = path.segments().collect();
        let mut folder = TreePath::root();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            folder = folder.join_staged(segment);
            self.incomplete.insert(folder.clone());
        }
    }
}

/// Streams entries into `<archive>.partial`.
pub struct ArchiveWriter {
    builder: tar::Builder<GzEncoder<BufWriter<File>>>,
    partial_path: PathBuf,
    archive_path: PathBuf,
    entries: u64,
}

impl ArchiveWriter {
    pub fn create(archive_path: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let archive_path = archive_path.into();
        if let Some(parent) = archive_path.parent() {
            fs::create_dir_all(parent).map_err(ArchiveError::io(parent))?;
        }
        let partial_path = with_suffix(&archive_path, ".partial");
        let file = File::create(&partial_path).map_err(ArchiveError::io(&partial_path))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

        tracing::debug!(path = %partial_path.display(), "staging archive opened");
        Ok(Self {
            builder: tar::Builder::new(encoder),
            partial_path,
            archive_path,
            entries: 0,
        })
    }

    pub fn add_dir(&mut self, path: &TreePath) -> Result<(), ArchiveError> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(0);
        self.builder
            .append_data(&mut header, path.as_str(), io::empty())
            .map_err(ArchiveError::io(&self.partial_path))?;
        self.entries += 1;
        Ok(())
    }

    pub fn add_file<R: Read>(
        &mut self,
        path: &TreePath,
        size: u64,
        content: R,
    ) -> Result<(), ArchiveError> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(size);
        header.set_mtime(0);
        self.builder
            .append_data(&mut header, path.as_str(), content)
            .map_err(ArchiveError::io(&self.partial_path))?;
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Finish the archive, move it into place and commit the index.
    pub fn pack(self, index: &StagedIndex) -> Result<StagedArchive, ArchiveError> {
        let partial = self.partial_path;
        let encoder = self.builder.into_inner().map_err(ArchiveError::io(&partial))?;
        let mut writer = encoder.finish().map_err(ArchiveError::io(&partial))?;
        writer.flush().map_err(ArchiveError::io(&partial))?;
        let file = writer
            .into_inner()
            .map_err(|err| ArchiveError::io(&partial)(err.into_error()))?;
        file.sync_all().map_err(ArchiveError::io(&partial))?;
        drop(file);

        fs::rename(&partial, &self.archive_path).map_err(ArchiveError::io(&self.archive_path))?;

        let staged = StagedArchive::at(self.archive_path);
        let tmp_index = with_suffix(&staged.index_path, ".tmp");
        let json = serde_json::to_vec_pretty(index)?;
        fs::write(&tmp_index, json).map_err(ArchiveError::io(&tmp_index))?;
        fs::rename(&tmp_index, &staged.index_path).map_err(ArchiveError::io(&staged.index_path))?;

        tracing::info!(
            archive = %staged.archive_path.display(),
            entries = self.entries,
            indexed = index.paths.len(),
            "staging archive packed"
        );
        Ok(staged)
    }
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("partial_path", &self.partial_path)
            .field("entries", &self.entries)
            .finish()
    }
}

/// A packed archive together with its committed index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArchive {
    archive_path: PathBuf,
    index_path: PathBuf,
}

impl StagedArchive {
    fn at(archive_path: PathBuf) -> Self {
        let index_path = with_suffix(&archive_path, ".index.json");
        Self {
            archive_path,
            index_path,
        }
    }

    /// An archive left behind by an earlier run, if it was fully packed.
    pub fn open(archive_path: impl Into<PathBuf>) -> Option<Self> {
        let staged = Self::at(archive_path.into());
        (staged.archive_path.is_file() && staged.index_path.is_file()).then_some(staged)
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn load_index(&self) -> Result<StagedIndex, ArchiveError> {
        let raw = fs::read(&self.index_path).map_err(ArchiveError::io(&self.index_path))?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Extract into `dir`, overwriting whatever an earlier extraction left.
    pub fn unpack(&self, dir: &Path) -> Result<PathBuf, ArchiveError> {
        fs::create_dir_all(dir).map_err(ArchiveError::io(dir))?;
        let file = File::open(&self.archive_path).map_err(ArchiveError::io(&self.archive_path))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive.set_overwrite(true);
        archive.set_preserve_permissions(false);
        archive.unpack(dir).map_err(ArchiveError::io(dir))?;

        tracing::info!(dir = %dir.display(), "staging archive unpacked");
        Ok(dir.to_path_buf())
    }

    /// Delete the archive and its index.
    pub fn remove(self) -> Result<(), ArchiveError> {
        for path in [&self.index_path, &self.archive_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(ArchiveError::io(path)(err)),
            }
        }
        Ok(())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> StagedIndex {
        let mut index = StagedIndex::default();
        index.paths.insert(TreePath::from_raw("docs"), "f1".into());
        index.paths.insert(TreePath::from_raw("docs/a.txt"), "n1".into());
        index
    }

    #[test]
    fn test_pack_and_unpack() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("staging/run.tar.gz");

        let mut writer = ArchiveWriter::create(&archive_path).unwrap();
        writer.add_dir(&TreePath::from_raw("docs")).unwrap();
        writer
            .add_file(&TreePath::from_raw("docs/a.txt"), 5, &b"hello"[..])
            .unwrap();
        writer.add_dir(&TreePath::from_raw("empty")).unwrap();
        assert_eq!(writer.entries(), 3);
        let staged = writer.pack(&sample_index()).unwrap();

        assert!(!with_suffix(&archive_path, ".partial").exists());
        assert_eq!(staged.load_index().unwrap(), sample_index());

        let out = dir.path().join("out");
        staged.unpack(&out).unwrap();
        assert_eq!(fs::read(out.join("docs/a.txt")).unwrap(), b"hello");
        assert!(out.join("empty").is_dir());

        // a second extraction over the first is fine
        staged.unpack(&out).unwrap();
        assert_eq!(fs::read(out.join("docs/a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_unpacked_archive_without_index_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("run.tar.gz");
        let mut writer = ArchiveWriter::create(&archive_path).unwrap();
        writer.add_dir(&TreePath::from_raw("docs")).unwrap();
        drop(writer);

        assert!(StagedArchive::open(&archive_path).is_none());
    }

    #[test]
    fn test_mark_failed_flags_every_ancestor() {
        let mut index = StagedIndex::default();
        index.mark_failed(&TreePath::from_raw("a/b/c.txt"));
        index.mark_failed(&TreePath::from_raw("top.txt"));

        assert_eq!(index.failures, 2);
        assert!(!index.is_complete());
        let incomplete: Vec<_> = index.incomplete.iter().map(|p| p.as_str()).collect();
        assert_eq!(incomplete, vec!["a", "a/b"]);
    }

    #[test]
    fn test_remove_deletes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("run.tar.gz");
        let staged = ArchiveWriter::create(&archive_path)
            .unwrap()
            .pack(&StagedIndex::default())
            .unwrap();
        staged.clone().remove().unwrap();
        assert!(StagedArchive::open(&archive_path).is_none());
        assert!(!archive_path.exists());
    }
}
