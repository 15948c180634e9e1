use std::fs::File;
use std::io;
use std::ptr::NonNull;

/// Abstract interface for mapping chunk files into the address space.
pub(crate) trait MapOps {
    /// Map the first `size` bytes of `file` read/write, `MAP_SHARED`, at
    /// offset 0. The file must already be at least `size` bytes long.
    unsafe fn map_shared(file: &File, size: usize) -> io::Result<NonNull<u8>>;

    /// Unmap a region returned by [`map_shared`](MapOps::map_shared).
    /// Pointers into it are invalid afterwards.
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct PlatformMapOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{File, MapOps, NonNull, PlatformMapOps, io};
    use std::os::fd::AsRawFd;

    impl MapOps for PlatformMapOps {
        unsafe fn map_shared(file: &File, size: usize) -> io::Result<NonNull<u8>> {
            // Safety: FFI call to mmap. The descriptor stays open for the
            // duration of the call; the mapping survives its closing.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            NonNull::new(ptr.cast::<u8>()).ok_or_else(|| io::Error::other("mmap returned null"))
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed mappings.
//
// Neither loom nor Miri can issue mmap. Every "mapping" is a plain heap block
// and the file contents are never read through it. This is enough to check
// the manager's locking (loom) and its pointer arithmetic (Miri); real
// file-backed behaviour is covered by the platform implementation.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl MapOps for PlatformMapOps {
    unsafe fn map_shared(_file: &File, size: usize) -> io::Result<NonNull<u8>> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-size mapping"));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096).map_err(io::Error::other)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "alloc returned null"))
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        let layout = std::alloc::Layout::from_size_align(size, 4096).map_err(io::Error::other)?;
        // Safety: ptr was allocated with the same layout via `map_shared`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}
