//! On-disk storage for the server side.
//!
//! Every transfer maps to one flat file at `{dir}/{name}`. Uploads refuse to
//! overwrite; downloads require the file to already exist.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{Result, TransferError};

/// Characters never allowed in a stored file name.
const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

/// True when `name` is acceptable as a flat entry in the storage directory.
pub fn valid_entry_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(FORBIDDEN)
}

/// The server's storage directory.
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Open (creating if needed) the storage directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Storage> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(TransferError::FileIo)?;
        info!(dir = %dir.display(), "storage directory ready");
        Ok(Storage { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Open the destination for an upload. Never truncates an existing file.
    pub fn create_upload(&self, name: &str) -> Result<(File, PathBuf)> {
        let path = self.entry_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => TransferError::FileExists(name.to_string()),
                _ => TransferError::FileIo(e),
            })?;
        Ok((file, path))
    }

    /// Open an existing file for download, returning it with its size.
    pub fn open_download(&self, name: &str) -> Result<(File, u64)> {
        let file = File::open(self.entry_path(name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TransferError::FileNotFound(name.to_string()),
            _ => TransferError::FileIo(e),
        })?;
        let size = file.metadata().map_err(TransferError::FileIo)?.len();
        Ok((file, size))
    }
}

/// Remove the half-written destination of a failed upload so a retry is not
/// rejected as already existing.
pub fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove partial upload");
        }
    }
}
