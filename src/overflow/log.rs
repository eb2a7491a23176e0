//! Overflow log file
//!
//! The on-disk side of the overflow log. It picks a writable location and
//! reads, appends to, replaces or removes the file there.
//! Callers serialize access; this type does no locking of its own.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, warn};

use super::codec::{parse_chunks, ChunkCodecError, OverflowChunk};
use crate::utils::atomic_write_with;

/// Errors raised by overflow log operations
#[derive(Error, Debug)]
pub enum OverflowError {
    #[error("overflow log IO error: {0}")]
    Io(#[from] io::Error),

    #[error("overflow log is malformed: {0}")]
    Codec(#[from] ChunkCodecError),

    #[error("no writable overflow location (configured: {})", .path.display())]
    Unwritable { path: PathBuf },
}

/// Result type for overflow log operations
pub type OverflowResult<T> = Result<T, OverflowError>;

/// How [`OverflowLog::write_chunks`] treats existing content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Add after whatever is already there
    #[default]
    Append,
    /// Discard existing content first
    Replace,
}

/// One overflow log location
#[derive(Debug)]
pub struct OverflowLog {
    configured: PathBuf,
    resolved: Option<PathBuf>,
    temp_fallback: bool,
}

impl OverflowLog {
    /// The canonical log. If `path` cannot be written on first use, a fresh
    /// temporary file is used instead and its path is logged.
    pub fn canonical<P: AsRef<Path>>(path: P) -> Self {
        Self {
            configured: path.as_ref().to_path_buf(),
            resolved: None,
            temp_fallback: true,
        }
    }

    /// A log at exactly `path`, with no fallback
    pub fn at<P: AsRef<Path>>(path: P) -> Self {
        Self {
            configured: path.as_ref().to_path_buf(),
            resolved: None,
            temp_fallback: false,
        }
    }

    pub fn configured_path(&self) -> &Path {
        &self.configured
    }

    /// The location in use, once resolved
    pub fn path(&self) -> Option<&Path> {
        self.resolved.as_deref()
    }

    /// Pick the location on first use and remember it
    pub fn resolve(&mut self) -> OverflowResult<PathBuf> {
        if let Some(path) = &self.resolved {
            return Ok(path.clone());
        }

        let path = match probe_writable(&self.configured) {
            Ok(()) => self.configured.clone(),
            Err(e) if self.temp_fallback => {
                error!(
                    path = %self.configured.display(),
                    error = %e,
                    "Overflow log location is not writable"
                );
                let fallback = create_temp_location().map_err(|e| {
                    error!(error = %e, "Unable to create a temporary overflow log, giving up");
                    OverflowError::Unwritable {
                        path: self.configured.clone(),
                    }
                })?;
                warn!(path = %fallback.display(), "Using temporary overflow log");
                fallback
            }
            Err(e) => {
                error!(
                    path = %self.configured.display(),
                    error = %e,
                    "Overflow log location is not writable"
                );
                return Err(OverflowError::Unwritable {
                    path: self.configured.clone(),
                });
            }
        };

        self.resolved = Some(path.clone());
        Ok(path)
    }

    /// Raw content, or `None` if the log is missing or empty
    pub fn read(&mut self) -> OverflowResult<Option<String>> {
        let path = self.resolve()?;
        match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Parsed chunks; empty if the log is missing or empty
    pub fn load(&mut self) -> OverflowResult<Vec<OverflowChunk>> {
        match self.read()? {
            Some(content) => Ok(parse_chunks(&content)?),
            None => Ok(Vec::new()),
        }
    }

    /// Write chunks in the given mode. Replacing with no chunks clears the log.
    pub fn write_chunks(&mut self, chunks: &[OverflowChunk], mode: WriteMode) -> OverflowResult<()> {
        let path = self.resolve()?;
        match mode {
            WriteMode::Append => {
                if chunks.is_empty() {
                    return Ok(());
                }
                let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
                for chunk in chunks {
                    chunk.write_to(&mut file)?;
                }
                file.sync_all()?;
            }
            WriteMode::Replace if chunks.is_empty() => return self.clear(),
            WriteMode::Replace => atomic_write_with(&path, |file| {
                chunks.iter().try_for_each(|chunk| chunk.write_to(file))
            })?,
        }
        debug!(path = %path.display(), chunks = chunks.len(), ?mode, "Wrote overflow chunks");
        Ok(())
    }

    /// Append chunks
    pub fn append(&mut self, chunks: &[OverflowChunk]) -> OverflowResult<()> {
        self.write_chunks(chunks, WriteMode::Append)
    }

    /// Replace the whole log with `chunks`
    pub fn replace(&mut self, chunks: &[OverflowChunk]) -> OverflowResult<()> {
        self.write_chunks(chunks, WriteMode::Replace)
    }

    /// Remove the log file
    pub fn clear(&mut self) -> OverflowResult<()> {
        let path = self.resolve()?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn probe_writable(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let existed = path.exists();
    OpenOptions::new().create(true).append(true).open(path)?;
    if !existed {
        // Missing and empty logs read the same; do not leave a stray file
        fs::remove_file(path)?;
    }
    Ok(())
}

fn create_temp_location() -> io::Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("access-ledger-")
        .suffix(".overflow")
        .tempfile()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AccessEvent;
    use tempfile::TempDir;

    fn chunk(comment: &str, ids: &[i64]) -> OverflowChunk {
        let events = ids
            .iter()
            .map(|&id| AccessEvent::new(id, 1, 1, "h").at(0))
            .collect();
        OverflowChunk::new([comment], events)
    }

    #[test]
    fn test_missing_log_reads_as_none() {
        let temp_dir = TempDir::new().unwrap();
        let mut log = OverflowLog::canonical(temp_dir.path().join("overflow"));

        assert!(log.read().unwrap().is_none());
        assert!(log.load().unwrap().is_empty());
        assert_eq!(log.path(), Some(temp_dir.path().join("overflow").as_path()));
    }

    #[test]
    fn test_append_then_replace() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("overflow");
        let mut log = OverflowLog::canonical(&path);

        log.append(&[chunk("#one", &[1])]).unwrap();
        log.append(&[chunk("#two", &[2, 3])]).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "#one\n1;1;1;0;h;\n#two\n2;1;1;0;h;\n3;1;1;0;h;\n"
        );

        log.replace(&[chunk("#three", &[4])]).unwrap();
        let chunks = log.load().unwrap();
        assert_eq!(chunks, vec![chunk("#three", &[4])]);
    }

    #[test]
    fn test_replace_with_nothing_clears() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("overflow");
        let mut log = OverflowLog::canonical(&path);

        log.append(&[chunk("#one", &[1])]).unwrap();
        log.replace(&[]).unwrap();
        assert!(!path.exists());

        // clearing twice is fine
        log.clear().unwrap();
    }

    #[test]
    fn test_unwritable_location_falls_back_to_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let mut log = OverflowLog::canonical(blocker.join("overflow"));

        log.append(&[chunk("#one", &[1])]).unwrap();

        let used = log.path().unwrap().to_path_buf();
        assert_ne!(used, blocker.join("overflow"));
        assert_eq!(log.load().unwrap().len(), 1);
        fs::remove_file(used).unwrap();
    }

    #[test]
    fn test_exact_location_has_no_fallback() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let mut log = OverflowLog::at(blocker.join("overflow"));

        assert!(matches!(
            log.read(),
            Err(OverflowError::Unwritable { .. })
        ));
    }

    #[test]
    fn test_malformed_log_fails_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("overflow");
        fs::write(&path, "#c\n1;2;3\n").unwrap();

        let mut log = OverflowLog::canonical(&path);
        assert!(matches!(log.load(), Err(OverflowError::Codec(_))));
    }
}
