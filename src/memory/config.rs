use std::path::PathBuf;

use super::error::FileMemoryError;
use super::map::{MapOps, PlatformMapOps};
use super::util::POINTER_WIDTH;

/// Configuration for `FileMemoryManager`.
/// Set at init time via `FileMemoryManager::with_config()`.
#[derive(Clone, Debug, Default)]
pub struct FileMemoryConfig {
    /// Directory plus filename prefix for chunk files. Chunk `i` lives at
    /// `{base_path}.{i}`. Must not be empty.
    pub base_path: PathBuf,

    /// Cap on the number of chunks. 0 means unlimited. Default: 0.
    pub max_chunks: usize,

    /// Byte quantum chunk sizes are rounded to. Must be a power of two and at
    /// least the pointer width. Default: 0 (auto-detect, system page size).
    pub chunk_granule: usize,

    /// Write zeros over the whole chunk file at creation instead of only its
    /// last byte. Slower, but lets the filesystem lay the file out
    /// contiguously. Default: false.
    pub zero_fill: bool,
}

impl FileMemoryConfig {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks;
        self
    }

    #[must_use]
    pub fn with_chunk_granule(mut self, chunk_granule: usize) -> Self {
        self.chunk_granule = chunk_granule;
        self
    }

    #[must_use]
    pub fn with_zero_fill(mut self, zero_fill: bool) -> Self {
        self.zero_fill = zero_fill;
        self
    }

    /// Resolve auto-detected values and reject unusable ones.
    pub(crate) fn validate(mut self) -> Result<Self, FileMemoryError> {
        if self.base_path.as_os_str().is_empty() {
            return Err(FileMemoryError::InvalidConfig(
                "base path must not be empty".to_string(),
            ));
        }
        if self.chunk_granule == 0 {
            self.chunk_granule = PlatformMapOps::page_size();
        }
        let granule = self.chunk_granule;
        if !granule.is_power_of_two() || granule < POINTER_WIDTH {
            return Err(FileMemoryError::InvalidConfig(format!(
                "chunk granule {granule} must be a power of two of at least {POINTER_WIDTH} bytes"
            )));
        }
        Ok(self)
    }
}
