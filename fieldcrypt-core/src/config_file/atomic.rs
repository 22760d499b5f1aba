//! Atomic file replacement: temp file in the target directory, fsync, rename

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Failure while replacing a file; the target is untouched in every case
#[derive(Debug, thiserror::Error)]
pub enum AtomicWriteError {
    #[error("cannot create temporary file in {dir}: {source}")]
    TempFile {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("writing temporary file for {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("fsync of temporary file for {path} failed: {source}")]
    Sync {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("renaming temporary file over {path} failed: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Replace `target` with `contents` so readers see either the old or the new file
pub fn write_atomically(target: &Path, contents: &[u8]) -> Result<(), AtomicWriteError> {
    write_atomically_with(target, contents, File::sync_all)
}

/// Same as [`write_atomically`] with the fsync step supplied by the caller
pub fn write_atomically_with<F>(
    target: &Path,
    contents: &[u8],
    sync: F,
) -> Result<(), AtomicWriteError>
where
    F: FnOnce(&File) -> io::Result<()>,
{
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());

    // Dropped on any early return, which deletes the temporary file
    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name))
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(|source| AtomicWriteError::TempFile {
            dir: dir.clone(),
            source,
        })?;

    let write_err = |source| AtomicWriteError::Write {
        path: target.to_path_buf(),
        source,
    };
    temp.write_all(contents).map_err(write_err)?;
    temp.flush().map_err(write_err)?;

    // New files keep the temp file's owner-only mode; existing files keep theirs
    if let Ok(metadata) = fs::metadata(target) {
        temp.as_file()
            .set_permissions(metadata.permissions())
            .map_err(write_err)?;
    }

    sync(temp.as_file()).map_err(|source| AtomicWriteError::Sync {
        path: target.to_path_buf(),
        source,
    })?;

    temp.persist(target)
        .map_err(|e| AtomicWriteError::Rename {
            path: target.to_path_buf(),
            source: e.error,
        })?;

    if let Err(e) = sync_dir(&dir) {
        tracing::warn!(dir = %dir.display(), error = %e, "Directory fsync failed; the rename may not survive a crash");
    }
    tracing::debug!(path = %target.display(), bytes = contents.len(), "Atomically replaced file");
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
