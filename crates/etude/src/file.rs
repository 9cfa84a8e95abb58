// src/file.rs
//! Static file resolution under the document root.

use crate::http::Status;
use crate::syscalls::MappedFile;
use std::ffi::OsStr;
use std::fs::{self, File};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

const INDEX_FILE: &[u8] = b"/index.html";
const OTHERS_READ: u32 = 0o004;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    NotFound,
    Forbidden,
    IsDirectory,
    /// Open or mmap failed after the file passed its checks.
    Unreadable,
}

impl FileError {
    pub fn status(&self) -> Status {
        match self {
            FileError::NotFound => Status::NotFound,
            FileError::Forbidden => Status::Forbidden,
            FileError::IsDirectory => Status::BadRequest,
            FileError::Unreadable => Status::InternalError,
        }
    }
}

/// A resolved response body.
#[derive(Debug)]
pub enum FileBody {
    Mapped(MappedFile),
    /// Zero-length file; mmap cannot map it.
    Empty,
}

impl FileBody {
    pub fn len(&self) -> usize {
        match self {
            FileBody::Mapped(map) => map.len(),
            FileBody::Empty => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct DocumentRoot {
    root: PathBuf,
}

impl DocumentRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for a request target: the root with the target
    /// appended byte for byte, `/` standing for `/index.html`.
    // TODO: collapse `..` segments and reject targets that climb out of the root.
    pub fn path_for(&self, target: &[u8]) -> PathBuf {
        let target = if target == b"/" { INDEX_FILE } else { target };
        let mut raw = self.root.as_os_str().as_bytes().to_vec();
        raw.extend_from_slice(target);
        PathBuf::from(OsStr::from_bytes(&raw))
    }

    pub fn resolve(&self, target: &[u8]) -> Result<FileBody, FileError> {
        let path = self.path_for(target);
        let meta = fs::metadata(&path).map_err(|_| FileError::NotFound)?;

        if meta.mode() & OTHERS_READ == 0 {
            return Err(FileError::Forbidden);
        }
        if meta.is_dir() {
            return Err(FileError::IsDirectory);
        }

        let file = File::open(&path).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "open failed");
            FileError::Unreadable
        })?;
        let len = meta.len() as usize;
        if len == 0 {
            return Ok(FileBody::Empty);
        }
        // The mapping outlives the descriptor; `file` closes on return.
        let map = MappedFile::map(file.as_raw_fd(), len).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "mmap failed");
            FileError::Unreadable
        })?;
        Ok(FileBody::Mapped(map))
    }
}
