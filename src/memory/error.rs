use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A step of chunk creation failed. The partially built chunk has already
/// been rolled back when this is returned.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("{}: {source}", .path.display())]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}: cannot size file to {size} bytes: {source}", .path.display())]
    FileSizeFailed {
        path: PathBuf,
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("{}: cannot map memory: {source}", .path.display())]
    MapFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ChunkError {
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        match self {
            ChunkError::FileCreateFailed { path, .. }
            | ChunkError::FileSizeFailed { path, .. }
            | ChunkError::MapFailed { path, .. } => path,
        }
    }

    /// The underlying system error.
    #[must_use]
    pub fn io_error(&self) -> &io::Error {
        match self {
            ChunkError::FileCreateFailed { source, .. }
            | ChunkError::FileSizeFailed { source, .. }
            | ChunkError::MapFailed { source, .. } => source,
        }
    }
}

#[derive(Debug, Error)]
pub enum FileMemoryError {
    #[error("zero-sized allocation requested")]
    InvalidArgument,
    #[error("cannot allocate host memory for bookkeeping")]
    OutOfHostMemory,
    #[error("chunk limit reached: {next_index} + {needed} chunk(s) exceeds maximum of {max_chunks}")]
    ChunkLimit {
        next_index: usize,
        needed: usize,
        max_chunks: usize,
    },
    #[error("allocation size overflow ({requested} bytes requested)")]
    SizeOverflow { requested: usize },
    #[error("cannot create memory chunk: {0}")]
    ChunkCreation(#[from] ChunkError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("file memory is not initialized")]
    NotInitialized,
}

/// Coarse error category, recorded as the "last error" by the process-wide
/// API in the way `errno` would be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfHostMemory,
    OutOfMemory,
}

impl FileMemoryError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            FileMemoryError::InvalidArgument
            | FileMemoryError::InvalidConfig(_)
            | FileMemoryError::NotInitialized => ErrorKind::InvalidArgument,
            FileMemoryError::OutOfHostMemory => ErrorKind::OutOfHostMemory,
            FileMemoryError::ChunkLimit { .. }
            | FileMemoryError::SizeOverflow { .. }
            | FileMemoryError::ChunkCreation(_) => ErrorKind::OutOfMemory,
        }
    }
}
