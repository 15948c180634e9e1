use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use super::chunk::{AllocationHeader, FileChunk, HEADER_SIZE};
use super::config::FileMemoryConfig;
use super::error::{ErrorKind, FileMemoryError};
use super::util::{self, POINTER_WIDTH};
use crate::sync::{Mutex, OnceLock};

/// Per-manager usage snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Live chunks (list length).
    pub chunks: usize,
    /// Sum of chunk sizes, i.e. bytes mapped from chunk files.
    pub mapped_bytes: usize,
    /// Bytes consumed by allocations, headers and padding included.
    pub used_bytes: usize,
    /// Allocations not yet freed.
    pub live_allocations: usize,
    /// Ordinal the next chunk will receive.
    pub next_chunk_index: usize,
}

/// Read-only view of one chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    pub ordinal: usize,
    pub path: PathBuf,
    pub base_addr: usize,
    pub size: usize,
    pub next_free_offset: usize,
    pub refcount: usize,
}

impl ChunkInfo {
    fn of(chunk: &FileChunk) -> Self {
        Self {
            ordinal: chunk.ordinal(),
            path: chunk.path().to_path_buf(),
            base_addr: chunk.base().as_ptr() as usize,
            size: chunk.size(),
            next_free_offset: chunk.next_free_offset(),
            refcount: chunk.refcount(),
        }
    }
}

/// Serves allocations out of memory-mapped chunk files.
///
/// Chunks are kept in creation order; the last one is the current chunk, the
/// only one whose cursor still advances. Every allocation is prefixed with a
/// one-word header naming its chunk.
///
/// Single-threaded: all operations take `&mut self`. Wrap in a mutex (or use
/// [`GlobalFileMemory`]) to share between threads.
pub struct FileMemoryManager {
    // None once torn down.
    base_path: Option<PathBuf>,
    // Indexed by ordinal; creation order.
    chunks: Vec<FileChunk>,
    next_chunk_index: usize,
    max_chunks: usize,
    chunk_granule: usize,
    zero_fill: bool,
}

impl FileMemoryManager {
    /// Create a manager with default settings.
    ///
    /// # Errors
    ///
    /// Returns `OutOfHostMemory` if the base path cannot be copied, or
    /// `InvalidConfig` if it is empty.
    pub fn initialize(base_path: &Path, max_chunks: usize) -> Result<Self, FileMemoryError> {
        let base_path = util::copy_path(base_path).inspect_err(|e| {
            log::error!("initialize(): {e}");
        })?;
        Self::with_config(FileMemoryConfig {
            base_path,
            max_chunks,
            ..FileMemoryConfig::default()
        })
    }

    /// Create a manager with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the base path is empty or the chunk granule
    /// is not a power of two of at least the pointer width.
    pub fn with_config(config: FileMemoryConfig) -> Result<Self, FileMemoryError> {
        let config = config.validate().inspect_err(|e| {
            log::error!("initialize(): {e}");
        })?;

        log::debug!(
            "initialize(): base path '{}', max_chunks = {}, chunk granule = {}",
            config.base_path.display(),
            config.max_chunks,
            config.chunk_granule
        );

        Ok(Self {
            base_path: Some(config.base_path),
            chunks: Vec::new(),
            next_chunk_index: 0,
            max_chunks: config.max_chunks,
            chunk_granule: config.chunk_granule,
            zero_fill: config.zero_fill,
        })
    }

    /// Allocate `size` bytes, pointer-width aligned.
    ///
    /// The memory stays valid until [`teardown`](Self::teardown) (or drop).
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `size` is 0.
    /// - `ChunkLimit` if a new chunk is needed and `max_chunks` forbids it.
    /// - `ChunkCreation` if the chunk file cannot be created, sized or mapped.
    /// - `SizeOverflow` if `size` is too large to be represented.
    /// - `NotInitialized` after teardown.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, FileMemoryError> {
        self.try_allocate(size).inspect_err(|e| {
            log::error!("allocate(): cannot allocate memory: {e}");
        })
    }

    fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, FileMemoryError> {
        if size == 0 {
            return Err(FileMemoryError::InvalidArgument);
        }
        if self.base_path.is_none() {
            return Err(FileMemoryError::NotInitialized);
        }

        // Bytes consumed in a chunk, header included.
        let aligned_size = size
            .checked_add(HEADER_SIZE)
            .and_then(|n| util::round_up(n, POINTER_WIDTH))
            .ok_or(FileMemoryError::SizeOverflow { requested: size })?;
        // Granules backing a fresh chunk for this request.
        let needed_chunks = aligned_size.div_ceil(self.chunk_granule);

        log::trace!(
            "allocate(): requested = {size}, aligned = {aligned_size}, needed_chunks = {needed_chunks}"
        );

        let grow = self
            .chunks
            .last()
            .is_none_or(|current| !current.fits(aligned_size));
        if grow {
            self.grow(needed_chunks, size)?;
        }

        let current = self
            .chunks
            .last_mut()
            .expect("current chunk should exist after grow");
        let ptr = current.bump(aligned_size);

        log::trace!(
            "allocate(): {aligned_size} bytes @{ptr:p} in chunk {}",
            current.ordinal()
        );
        Ok(ptr)
    }

    /// Append a chunk of `needed_chunks` granules and make it current.
    fn grow(&mut self, needed_chunks: usize, requested: usize) -> Result<(), FileMemoryError> {
        // Ordinals are compared against the cap directly, as a count of
        // granules, even though the new chunk is a single list entry.
        if self.max_chunks > 0
            && self.next_chunk_index.saturating_add(needed_chunks) > self.max_chunks
        {
            return Err(FileMemoryError::ChunkLimit {
                next_index: self.next_chunk_index,
                needed: needed_chunks,
                max_chunks: self.max_chunks,
            });
        }

        let chunk_size = needed_chunks
            .checked_mul(self.chunk_granule)
            .ok_or(FileMemoryError::SizeOverflow { requested })?;
        let Some(base_path) = self.base_path.as_deref() else {
            return Err(FileMemoryError::NotInitialized);
        };
        let path = util::chunk_path(base_path, self.next_chunk_index)?;
        self.chunks
            .try_reserve(1)
            .map_err(|_| FileMemoryError::OutOfHostMemory)?;

        let chunk = FileChunk::create(self.next_chunk_index, path, chunk_size, self.zero_fill)
            .inspect_err(|e| log::error!("create_chunk(): {e}"))?;
        self.chunks.push(chunk);
        self.next_chunk_index += 1;
        Ok(())
    }

    /// Release an allocation.
    ///
    /// Drops one reference on the owning chunk. When the current chunk's count
    /// reaches zero its cursor is rewound and the whole region is reused.
    /// Empty older chunks stay mapped until teardown. Null is ignored.
    ///
    /// # Safety
    /// - `ptr` must be null or have been returned by `allocate` on this
    ///   manager, before the last teardown.
    /// - `ptr` must not have been freed already.
    /// - `ptr` must not be used after this call.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        // Safety: upheld by caller.
        let Some(index) = (unsafe { self.owning_chunk(ptr) }) else {
            debug_assert!(false, "Pointer {ptr:p} does not belong to this FileMemoryManager");
            return;
        };

        let is_current = index + 1 == self.chunks.len();
        let chunk = &mut self.chunks[index];
        match chunk.release() {
            None => {
                debug_assert!(false, "Double free detected in FileMemoryManager for pointer {ptr:p}");
            }
            Some(0) if is_current => {
                log::trace!("free(): chunk {} empty, rewinding", chunk.ordinal());
                chunk.reset();
            }
            Some(_) => {}
        }
    }

    /// Chunk index recorded in the header before `ptr`, checked against the
    /// chunk's used range.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this manager.
    unsafe fn owning_chunk(&self, ptr: NonNull<u8>) -> Option<usize> {
        let header_addr = (ptr.as_ptr() as usize).checked_sub(HEADER_SIZE)?;
        // Safety: allocate wrote a header immediately before every pointer it
        // returned.
        let header = unsafe { (header_addr as *const AllocationHeader).read() };
        let chunk = self.chunks.get(header.chunk)?;
        chunk.contains_header(header_addr).then_some(header.chunk)
    }

    /// Look up the chunk an allocation lives in via its header.
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate` on this manager and the
    /// manager must not have been torn down since.
    #[must_use]
    pub unsafe fn chunk_of(&self, ptr: NonNull<u8>) -> Option<ChunkInfo> {
        // Safety: upheld by caller.
        let index = unsafe { self.owning_chunk(ptr) }?;
        Some(ChunkInfo::of(&self.chunks[index]))
    }

    /// Unmap, close and unlink every chunk, newest first, and return to the
    /// uninitialized state. Calling it again is a no-op.
    pub fn teardown(&mut self) {
        while let Some(chunk) = self.chunks.pop() {
            drop(chunk);
        }
        if let Some(base_path) = self.base_path.take() {
            log::debug!("teardown(): '{}' released", base_path.display());
        }
        self.chunks = Vec::new();
        self.next_chunk_index = 0;
        self.max_chunks = 0;
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.base_path.is_some()
    }

    #[must_use]
    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    #[must_use]
    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    #[must_use]
    pub fn chunk_granule(&self) -> usize {
        self.chunk_granule
    }

    #[must_use]
    pub fn next_chunk_index(&self) -> usize {
        self.next_chunk_index
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Backing file paths, oldest first.
    #[must_use]
    pub fn chunk_paths(&self) -> Vec<PathBuf> {
        self.chunks.iter().map(|c| c.path().to_path_buf()).collect()
    }

    /// Chunks, oldest first.
    #[must_use]
    pub fn chunks(&self) -> Vec<ChunkInfo> {
        self.chunks.iter().map(ChunkInfo::of).collect()
    }

    #[must_use]
    pub fn current_chunk(&self) -> Option<ChunkInfo> {
        self.chunks.last().map(ChunkInfo::of)
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            chunks: self.chunks.len(),
            next_chunk_index: self.next_chunk_index,
            ..MemoryStats::default()
        };
        for chunk in &self.chunks {
            stats.mapped_bytes += chunk.size();
            stats.used_bytes += chunk.next_free_offset();
            stats.live_allocations += chunk.refcount();
        }
        stats
    }
}

impl Drop for FileMemoryManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

// ---------------------------------------------------------------------------
// Process-wide manager
// ---------------------------------------------------------------------------

static GLOBAL_FILE_MEMORY: OnceLock<Mutex<Option<FileMemoryManager>>> = OnceLock::new();

thread_local! {
    static LAST_ERROR: Cell<Option<ErrorKind>> = const { Cell::new(None) };
}

/// Process-wide file memory, bracketed by [`init`](Self::init) and
/// [`teardown`](Self::teardown). Every operation takes one mutex.
pub struct GlobalFileMemory;

impl GlobalFileMemory {
    fn cell() -> &'static Mutex<Option<FileMemoryManager>> {
        GLOBAL_FILE_MEMORY.get_or_init(|| Mutex::new(None))
    }

    fn record(err: &FileMemoryError) {
        LAST_ERROR.with(|last| last.set(Some(err.kind())));
    }

    /// Initialize with default settings. A previously initialized manager is
    /// torn down first.
    ///
    /// # Errors
    ///
    /// See [`FileMemoryManager::initialize`]. On failure the global state is
    /// left uninitialized and safe to tear down.
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    pub fn init(base_path: impl AsRef<Path>, max_chunks: usize) -> Result<(), FileMemoryError> {
        let result = FileMemoryManager::initialize(base_path.as_ref(), max_chunks);
        Self::install(result)
    }

    /// Initialize with custom configuration.
    ///
    /// # Errors
    ///
    /// See [`FileMemoryManager::with_config`].
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    pub fn init_with_config(config: FileMemoryConfig) -> Result<(), FileMemoryError> {
        Self::install(FileMemoryManager::with_config(config))
    }

    fn install(result: Result<FileMemoryManager, FileMemoryError>) -> Result<(), FileMemoryError> {
        let mut guard = Self::cell().lock().unwrap();
        // Tear the old manager down before its files could collide with the
        // new one's.
        drop(guard.take());
        match result {
            Ok(manager) => {
                *guard = Some(manager);
                Ok(())
            }
            Err(e) => {
                Self::record(&e);
                Err(e)
            }
        }
    }

    /// Allocate from the global manager. On failure returns `None` and
    /// records the error kind for [`last_error`](Self::last_error).
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    #[must_use]
    pub fn allocate(size: usize) -> Option<NonNull<u8>> {
        let mut guard = Self::cell().lock().unwrap();
        let result = match guard.as_mut() {
            Some(manager) => manager.allocate(size),
            None => {
                log::error!("allocate(): file memory is not initialized");
                Err(FileMemoryError::NotInitialized)
            }
        };
        result.inspect_err(Self::record).ok()
    }

    /// Free an allocation made by [`allocate`](Self::allocate).
    ///
    /// # Safety
    /// Same contract as [`FileMemoryManager::free`], against the global
    /// manager.
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    pub unsafe fn free(ptr: *mut u8) {
        if let Some(manager) = Self::cell().lock().unwrap().as_mut() {
            // Safety: upheld by caller.
            unsafe { manager.free(ptr) };
        }
    }

    /// Release every chunk. Safe to call repeatedly or without `init`.
    ///
    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    pub fn teardown() {
        let manager = Self::cell().lock().unwrap().take();
        drop(manager);
    }

    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    #[must_use]
    pub fn is_initialized() -> bool {
        Self::cell().lock().unwrap().is_some()
    }

    /// # Panics
    ///
    /// Panics if the global lock is poisoned.
    #[must_use]
    pub fn stats() -> Option<MemoryStats> {
        Self::cell().lock().unwrap().as_ref().map(FileMemoryManager::stats)
    }

    /// Kind of the last failure seen by this thread through the global API.
    #[must_use]
    pub fn last_error() -> Option<ErrorKind> {
        LAST_ERROR.with(Cell::get)
    }

    /// Forget the recorded last error for this thread.
    pub fn clear_last_error() {
        LAST_ERROR.with(|last| last.set(None));
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::fs;

    fn manager_in(dir: &tempfile::TempDir, granule: usize, max_chunks: usize) -> FileMemoryManager {
        crate::memory::init_test_logging();
        FileMemoryManager::with_config(
            FileMemoryConfig::new(dir.path().join("fm"))
                .with_chunk_granule(granule)
                .with_max_chunks(max_chunks),
        )
        .expect("Failed to create manager")
    }

    #[test]
    fn test_zero_size_rejected() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 4096, 0);

        let err = mem.allocate(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(mem.chunk_count(), 0, "rejected call must not create a chunk");
    }

    #[test]
    fn test_single_small_allocation() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 4096, 0);

        let p = mem.allocate(100).unwrap();
        assert_eq!(p.as_ptr() as usize % POINTER_WIDTH, 0);

        let current = mem.current_chunk().unwrap();
        assert_eq!(current.ordinal, 0);
        assert_eq!(current.size, 4096);
        assert_eq!(current.next_free_offset, 112);
        assert_eq!(current.refcount, 1);
        assert_eq!(current.path, dir.path().join("fm.0"));
        assert_eq!(mem.next_chunk_index(), 1);
    }

    #[test]
    fn test_alignment_for_odd_sizes() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 4096, 0);

        for size in [1, 3, 7, 9, 13, 31, 33, 100, 255] {
            let p = mem.allocate(size).unwrap();
            assert_eq!(p.as_ptr() as usize % POINTER_WIDTH, 0, "size {size}");
        }
        assert_eq!(mem.current_chunk().unwrap().next_free_offset % POINTER_WIDTH, 0);
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 4096, 0);

        let sizes = [24usize, 1, 40, 8, 17];
        let ptrs: Vec<_> = sizes.iter().map(|&s| mem.allocate(s).unwrap()).collect();

        for (i, (&p, &size)) in ptrs.iter().zip(&sizes).enumerate() {
            // Safety: Test code.
            unsafe { p.as_ptr().write_bytes(i as u8 + 1, size) };
        }
        for (i, (&p, &size)) in ptrs.iter().zip(&sizes).enumerate() {
            // Safety: Test code.
            let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
            assert!(bytes.iter().all(|&b| b == i as u8 + 1), "allocation {i} clobbered");
        }

        for pair in ptrs.windows(2) {
            let end_of_first = pair[0].as_ptr() as usize;
            assert!(pair[1].as_ptr() as usize > end_of_first);
        }
    }

    #[test]
    fn test_header_names_owning_chunk() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 64, 0);

        let ptrs: Vec<_> = (0..6).map(|_| mem.allocate(16).unwrap()).collect();
        assert_eq!(mem.chunk_count(), 3);

        for (i, &p) in ptrs.iter().enumerate() {
            // Safety: Test code.
            let info = unsafe { mem.chunk_of(p) }.expect("header lookup failed");
            assert_eq!(info.ordinal, i / 2);
            let addr = p.as_ptr() as usize;
            assert!(addr >= info.base_addr + HEADER_SIZE);
            assert!(addr <= info.base_addr + info.next_free_offset);
        }
    }

    #[test]
    fn test_grow_when_current_full() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 64, 0);

        // 56 + 8 fills the 64-byte chunk exactly.
        mem.allocate(56).unwrap();
        assert_eq!(mem.chunk_count(), 1);
        assert_eq!(mem.current_chunk().unwrap().next_free_offset, 64);

        mem.allocate(1).unwrap();
        assert_eq!(mem.chunk_count(), 2);
        let chunks = mem.chunks();
        assert_eq!(chunks[0].next_free_offset, 64);
        assert_eq!(chunks[1].next_free_offset, 16);
    }

    #[test]
    fn test_oversize_allocation_gets_dedicated_chunk() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 4096, 0);

        let n = 3 * 4096 + 1;
        let p = mem.allocate(n).unwrap();
        let current = mem.current_chunk().unwrap();
        let aligned = (n + HEADER_SIZE).next_multiple_of(POINTER_WIDTH);
        assert_eq!(current.size, aligned.div_ceil(4096) * 4096);
        assert_eq!(current.next_free_offset, aligned);
        assert_eq!(fs::metadata(&current.path).unwrap().len(), current.size as u64);

        // Whole region is writable.
        // Safety: Test code.
        unsafe {
            p.as_ptr().write_bytes(0xCD, n);
            assert_eq!(*p.as_ptr().add(n - 1), 0xCD);
        }
    }

    #[test]
    fn test_small_after_oversize_reuses_tail() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 4096, 0);

        mem.allocate(4096).unwrap(); // 4104 bytes, two-granule chunk
        mem.allocate(100).unwrap();
        assert_eq!(mem.chunk_count(), 1);
        assert_eq!(mem.current_chunk().unwrap().next_free_offset, 4104 + 112);
    }

    #[test]
    fn test_cap_enforced() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 64, 2);

        mem.allocate(56).unwrap();
        mem.allocate(56).unwrap();
        let err = mem.allocate(56).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(matches!(
            err,
            FileMemoryError::ChunkLimit { next_index: 2, needed: 1, max_chunks: 2 }
        ));
        assert_eq!(mem.chunk_count(), 2);
        assert_eq!(mem.next_chunk_index(), 2);

        // Requests that still fit nowhere keep failing; nothing was consumed.
        assert!(mem.allocate(1).is_err());
        assert_eq!(mem.chunk_count(), 2);
    }

    #[test]
    fn test_cap_counts_granules_of_new_chunk() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 64, 3);

        // Needs 4 granules: refused even though it would be one chunk.
        let err = mem.allocate(4 * 64 - HEADER_SIZE).unwrap_err();
        assert!(matches!(err, FileMemoryError::ChunkLimit { needed: 4, .. }), "{err}");
        assert_eq!(mem.chunk_count(), 0);

        // Three granules fit the cap exactly.
        mem.allocate(3 * 64 - HEADER_SIZE).unwrap();
        assert_eq!(mem.chunk_count(), 1);
        assert_eq!(mem.current_chunk().unwrap().size, 3 * 64);
    }

    #[test]
    fn test_size_overflow() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 4096, 0);

        let err = mem.allocate(usize::MAX - 2).unwrap_err();
        assert!(matches!(err, FileMemoryError::SizeOverflow { .. }), "{err}");
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(mem.chunk_count(), 0);
    }

    #[test]
    fn test_ordinals_strictly_increase() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 64, 0);

        for _ in 0..12 {
            mem.allocate(40).unwrap();
        }
        let ordinals: Vec<_> = mem.chunks().iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, (0..12).collect::<Vec<_>>());
        assert_eq!(mem.next_chunk_index(), mem.chunk_count());
        for (i, path) in mem.chunk_paths().iter().enumerate() {
            assert_eq!(*path, dir.path().join(format!("fm.{i}")));
        }
    }

    #[test]
    fn test_cursor_bound() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 128, 0);

        for size in (1..200).step_by(13) {
            mem.allocate(size).unwrap();
            for chunk in mem.chunks() {
                assert!(chunk.next_free_offset <= chunk.size);
                assert_eq!(chunk.size % 128, 0);
            }
        }
    }

    #[test]
    fn test_collision_leaves_state_intact() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let collide = dir.path().join("fm.0");
        fs::write(&collide, b"").unwrap();
        let mut mem = manager_in(&dir, 4096, 0);

        let err = mem.allocate(1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert!(err.to_string().contains(&collide.display().to_string()), "{err}");
        assert_eq!(mem.chunk_count(), 0);
        assert_eq!(mem.next_chunk_index(), 0);

        // Once the obstacle is gone, ordinal 0 is used as if nothing happened.
        fs::remove_file(&collide).unwrap();
        mem.allocate(1).unwrap();
        assert_eq!(mem.current_chunk().unwrap().ordinal, 0);
    }

    #[test]
    fn test_free_rewinds_current_chunk() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 4096, 0);

        let a = mem.allocate(32).unwrap();
        let b = mem.allocate(32).unwrap();
        // Safety: Test code.
        unsafe { mem.free(a.as_ptr()) };
        assert_eq!(mem.current_chunk().unwrap().refcount, 1);
        assert_eq!(mem.current_chunk().unwrap().next_free_offset, 80);

        // Safety: Test code.
        unsafe { mem.free(b.as_ptr()) };
        let current = mem.current_chunk().unwrap();
        assert_eq!(current.refcount, 0);
        assert_eq!(current.next_free_offset, 0);

        // Region is reused from the start.
        let c = mem.allocate(32).unwrap();
        assert_eq!(c, a);
        assert_eq!(mem.chunk_count(), 1);
    }

    #[test]
    fn test_free_keeps_empty_older_chunk() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 64, 0);

        let a = mem.allocate(56).unwrap();
        let _b = mem.allocate(56).unwrap();
        // Safety: Test code.
        unsafe { mem.free(a.as_ptr()) };

        let chunks = mem.chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].refcount, 0);
        assert_eq!(chunks[0].next_free_offset, 64, "older chunk is not rewound");
        assert!(chunks[0].path.exists());
    }

    #[test]
    fn test_free_null_is_noop() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 4096, 0);
        mem.allocate(8).unwrap();
        // Safety: Test code.
        unsafe { mem.free(std::ptr::null_mut()) };
        assert_eq!(mem.stats().live_allocations, 1);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "Double free detected")]
    fn test_double_free() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 64, 0);
        let a = mem.allocate(8).unwrap();
        let _b = mem.allocate(56).unwrap(); // moves on to chunk 1
        // Safety: Test code.
        unsafe {
            mem.free(a.as_ptr());
            mem.free(a.as_ptr());
        }
    }

    #[test]
    fn test_teardown_removes_files_and_is_idempotent() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 64, 0);

        for _ in 0..5 {
            mem.allocate(40).unwrap();
        }
        let paths = mem.chunk_paths();
        assert_eq!(paths.len(), 5);
        assert!(paths.iter().all(|p| p.exists()));

        mem.teardown();
        assert!(paths.iter().all(|p| !p.exists()));
        assert!(!mem.is_initialized());
        assert_eq!(mem.next_chunk_index(), 0);
        assert_eq!(mem.stats(), MemoryStats::default());

        mem.teardown();
        assert_eq!(mem.allocate(8).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_drop_tears_down() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let paths = {
            let mut mem = manager_in(&dir, 4096, 0);
            mem.allocate(10).unwrap();
            mem.allocate(5000).unwrap();
            mem.chunk_paths()
        };
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_stats() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut mem = manager_in(&dir, 64, 0);

        let a = mem.allocate(16).unwrap();
        mem.allocate(16).unwrap();
        mem.allocate(16).unwrap();
        // Safety: Test code.
        unsafe { mem.free(a.as_ptr()) };

        assert_eq!(
            mem.stats(),
            MemoryStats {
                chunks: 2,
                mapped_bytes: 128,
                used_bytes: 72,
                live_allocations: 2,
                next_chunk_index: 2,
            }
        );
    }

    #[test]
    fn test_initialize_defaults() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("graph");
        let mut mem = FileMemoryManager::initialize(&base, 7).unwrap();

        assert!(mem.is_initialized());
        assert_eq!(mem.base_path(), Some(base.as_path()));
        assert_eq!(mem.max_chunks(), 7);
        assert!(mem.chunk_granule().is_power_of_two());
        mem.allocate(1).unwrap();
        assert!(dir.path().join("graph.0").exists());
    }

    #[test]
    fn test_initialize_rejects_empty_path() {
        let err = FileMemoryManager::initialize(Path::new(""), 0).err().unwrap();
        assert!(matches!(err, FileMemoryError::InvalidConfig(_)));
    }
}
