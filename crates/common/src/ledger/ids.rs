use std::fs::File;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::file::{append_synced, io_error, open_append, read_complete};
use super::provider::LedgerError;

/// Append-only journal of source id to destination id pairs.
///
/// Lines are `<source>\t<dest>`, with `\`, tab, `\n` and `\r` inside ids
/// escaped. Pairs written by earlier runs are loaded at open; every new pair
/// is synced before `append` returns, so a pair is never younger than the
/// ledger entry of the unit it describes.
#[derive(Debug)]
pub struct IdJournal {
    path: PathBuf,
    file: Mutex<File>,
    replayed: Vec<(String, String)>,
}

impl IdJournal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let raw = read_complete(&path)?;

        let mut replayed = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            replayed.push(decode_pair(line, idx + 1)?);
        }

        let file = open_append(&path)?;
        tracing::debug!(
            journal = %path.display(),
            pairs = replayed.len(),
            "loaded id journal"
        );

        Ok(Self {
            path,
            file: Mutex::new(file),
            replayed,
        })
    }

    /// Pairs recorded before this journal was opened, oldest first.
    pub fn replayed(&self) -> &[(String, String)] {
        &self.replayed
    }

    pub fn append(&self, source_id: &str, dest_id: &str) -> Result<(), LedgerError> {
        let line = format!("{}\t{}\n", escape(source_id), escape(dest_id));
        append_synced(&mut self.file.lock(), &line).map_err(|e| io_error(&self.path, e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn escape(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(field: &str, line_no: usize) -> Result<String, LedgerError> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
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
    Ok(out)
}

fn decode_pair(line: &str, line_no: usize) -> Result<(String, String), LedgerError> {
    let (source, dest) = line.split_once('\t').ok_or_else(|| LedgerError::Corrupt {
        line: line_no,
        reason: "expected two tab separated ids".into(),
    })?;
    if source.is_empty() || dest.is_empty() || dest.contains('\t') {
        return Err(LedgerError::Corrupt {
            line: line_no,
            reason: "expected two tab separated ids".into(),
        });
    }
    Ok((unescape(source, line_no)?, unescape(dest, line_no)?))
}
