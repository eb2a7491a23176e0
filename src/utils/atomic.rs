//! Atomic file replacement
//!
//! Full rewrites of the overflow log go through here so a crash mid-write
//! never leaves a truncated log behind:
//!
//! 1. Write to a sibling temporary file (`.tmp`)
//! 2. Call `sync_all()` to flush it to disk
//! 3. Rename it over the final path
//!
//! The final file is either the old version or the new version, never a
//! partial one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Path of the temporary sibling used while replacing `path`
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically replace the content of `path`
pub fn atomic_write<P: AsRef<Path>>(path: P, content: &str) -> io::Result<()> {
    atomic_write_with(path, |file| file.write_all(content.as_bytes()))
}

/// Atomically replace the content of `path` using a writer function
pub fn atomic_write_with<P, F>(path: P, write_fn: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let path = path.as_ref();
    let temp_path = temp_path_for(path);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let result = File::create(&temp_path).and_then(|mut file| {
        write_fn(&mut file)?;
        file.sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("overflow");

        fs::write(&path, "old content\nmore old content\n").unwrap();
        atomic_write(&path, "new\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new\n");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_atomic_write_with() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("overflow");

        atomic_write_with(&path, |file| {
            writeln!(file, "#comment")?;
            writeln!(file, "1;2;3;4;host;")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "#comment\n1;2;3;4;host;\n");
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dir").join("overflow");

        atomic_write(&path, "x").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_failed_writer_leaves_original() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("overflow");
        fs::write(&path, "keep me").unwrap();

        let result = atomic_write_with(&path, |_| Err(io::Error::other("boom")));

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "keep me");
        assert!(!temp_path_for(&path).exists());
    }
}
