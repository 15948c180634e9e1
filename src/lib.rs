//! File-backed bump allocation.
//!
//! Allocations are served out of memory-mapped chunk files named
//! `{base_path}.{n}`, so working memory is backed by the page cache and the
//! filesystem rather than anonymous memory. Chunks are only released as a
//! whole, at teardown.

#[cfg(not(unix))]
compile_error!("filemem supports only unix targets.");

#[cfg(feature = "file-memory")]
pub(crate) mod sync;

#[cfg(feature = "file-memory")]
pub mod memory;

// manager
#[cfg(feature = "file-memory")]
pub use memory::manager::{ChunkInfo, FileMemoryManager, GlobalFileMemory, MemoryStats};

// config
#[cfg(feature = "file-memory")]
pub use memory::config::FileMemoryConfig;

// errors
#[cfg(feature = "file-memory")]
pub use memory::error::{ChunkError, ErrorKind, FileMemoryError};

// helpers and diagnostics
#[cfg(feature = "file-memory")]
pub use memory::stats::{ProcessTotals, process_totals};
#[cfg(feature = "file-memory")]
pub use memory::util::{POINTER_WIDTH, num_digits, round_up};
