use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use super::error::ChunkError;
use super::map::{MapOps, PlatformMapOps};
use super::stats;

/// Permissions of chunk files.
const CHUNK_FILE_MODE: u32 = 0o660;

/// Block size used when zero-filling a chunk file.
const ZERO_FILL_BLOCK: usize = 64 * 1024;

/// In-band prefix written immediately before every user allocation.
///
/// Records the ordinal of the owning chunk. Ordinals index the manager's
/// chunk arena, so pointer-to-chunk lookup is one negative offset and a load.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AllocationHeader {
    pub(crate) chunk: usize,
}

pub(crate) const HEADER_SIZE: usize = std::mem::size_of::<AllocationHeader>();

const _: () = assert!(HEADER_SIZE == std::mem::size_of::<*const u8>());

/// One memory-mapped chunk file and its bump cursor.
pub(crate) struct FileChunk {
    ordinal: usize,
    path: PathBuf,
    // Closed on drop, after the mapping is gone.
    file: Option<File>,
    base: NonNull<u8>,
    size: usize,
    next_free_offset: usize,
    refcount: usize,
}

// Raw pointers are !Send. The chunk exclusively owns its mapping and file,
// so moving it to another thread is sound.
// Safety: FileChunk owns the mapped region.
unsafe impl Send for FileChunk {}

impl FileChunk {
    /// Create `path` exclusively, grow it to `size` bytes and map it.
    ///
    /// On failure every completed step is undone (file closed and unlinked)
    /// before the error is returned.
    pub(crate) fn create(
        ordinal: usize,
        path: PathBuf,
        size: usize,
        zero_fill: bool,
    ) -> Result<Self, ChunkError> {
        debug_assert!(size > 0, "chunk size must be positive");

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(CHUNK_FILE_MODE)
            .open(&path)
        {
            Ok(file) => file,
            Err(source) => return Err(ChunkError::FileCreateFailed { path, source }),
        };

        let base = match Self::size_and_map(&file, &path, size, zero_fill) {
            Ok(base) => base,
            Err(err) => {
                drop(file);
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("create_chunk(): cannot unlink '{}': {e}", path.display());
                }
                return Err(err);
            }
        };

        stats::MAPPED_BYTES.add(size);
        stats::LIVE_CHUNKS.add(1);
        log::debug!(
            "create_chunk(): memory file '{}' created ({size} bytes), mapped @{:p}",
            path.display(),
            base
        );

        Ok(Self {
            ordinal,
            path,
            file: Some(file),
            base,
            size,
            next_free_offset: 0,
            refcount: 0,
        })
    }

    fn size_and_map(
        file: &File,
        path: &Path,
        size: usize,
        zero_fill: bool,
    ) -> Result<NonNull<u8>, ChunkError> {
        let sized = if zero_fill {
            Self::zero_fill(file, size)
        } else {
            Self::touch_last_byte(file, size)
        };
        if let Err(source) = sized {
            return Err(ChunkError::FileSizeFailed {
                path: path.to_path_buf(),
                size,
                source,
            });
        }

        // Safety: the file was just grown to `size` bytes.
        unsafe { PlatformMapOps::map_shared(file, size) }.map_err(|source| ChunkError::MapFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Extend the file by writing a single zero byte at `size - 1`.
    fn touch_last_byte(mut file: &File, size: usize) -> io::Result<()> {
        let last = u64::try_from(size - 1).map_err(io::Error::other)?;
        if file.seek(SeekFrom::Start(last))? != last {
            return Err(io::Error::other("short seek"));
        }
        file.write_all(&[0])
    }

    fn zero_fill(mut file: &File, size: usize) -> io::Result<()> {
        let block = vec![0u8; size.min(ZERO_FILL_BLOCK)];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(block.len());
            file.write_all(&block[..n])?;
            remaining -= n;
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn fits(&self, aligned_size: usize) -> bool {
        aligned_size <= self.size - self.next_free_offset
    }

    /// Carve `aligned_size` bytes off the cursor, write the header and return
    /// the address just past it.
    ///
    /// `aligned_size` must include the header, be a multiple of the pointer
    /// width and satisfy [`fits`](Self::fits).
    pub(crate) fn bump(&mut self, aligned_size: usize) -> NonNull<u8> {
        debug_assert!(aligned_size >= HEADER_SIZE);
        debug_assert!(self.fits(aligned_size), "bump past end of chunk {}", self.ordinal);

        // Safety: next_free_offset + aligned_size <= size, so both the header
        // and the user region lie inside the mapping. The base is page aligned
        // and every offset is a multiple of the pointer width.
        let user = unsafe {
            let header = self
                .base
                .as_ptr()
                .add(self.next_free_offset)
                .cast::<AllocationHeader>();
            header.write(AllocationHeader {
                chunk: self.ordinal,
            });
            NonNull::new_unchecked(header.cast::<u8>().add(HEADER_SIZE))
        };

        self.next_free_offset += aligned_size;
        self.refcount += 1;
        stats::USED_BYTES.add(aligned_size);
        stats::LIVE_ALLOCATIONS.add(1);
        user
    }

    /// Whether `header_addr` is the address of a header this chunk wrote.
    #[inline]
    pub(crate) fn contains_header(&self, header_addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        header_addr >= start && header_addr < start + self.next_free_offset
    }

    /// Drop one reference. Returns the remaining count, or `None` when the
    /// chunk had no live allocations.
    pub(crate) fn release(&mut self) -> Option<usize> {
        self.refcount = self.refcount.checked_sub(1)?;
        stats::LIVE_ALLOCATIONS.sub(1);
        Some(self.refcount)
    }

    /// Rewind the cursor to the start of the mapping. Only valid once every
    /// allocation in the chunk has been released.
    pub(crate) fn reset(&mut self) {
        debug_assert_eq!(self.refcount, 0, "reset of chunk {} with live allocations", self.ordinal);
        stats::USED_BYTES.sub(self.next_free_offset);
        self.next_free_offset = 0;
    }

    pub(crate) fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn next_free_offset(&self) -> usize {
        self.next_free_offset
    }

    pub(crate) fn refcount(&self) -> usize {
        self.refcount
    }
}

impl Drop for FileChunk {
    fn drop(&mut self) {
        // Safety: the mapping was created with this size and is released once.
        if let Err(e) = unsafe { PlatformMapOps::unmap(self.base, self.size) } {
            log::error!("destroy_chunk(): cannot unmap '{}': {e}", self.path.display());
        }
        drop(self.file.take());
        if let Err(e) = fs::remove_file(&self.path) {
            log::error!("destroy_chunk(): {}: {e}", self.path.display());
        }

        stats::MAPPED_BYTES.sub(self.size);
        stats::LIVE_CHUNKS.sub(1);
        stats::USED_BYTES.sub(self.next_free_offset);
        stats::LIVE_ALLOCATIONS.sub(self.refcount);
        log::debug!(
            "destroy_chunk(): memory file '{}' destroyed ({} bytes)",
            self.path.display(),
            self.size
        );
    }
}
