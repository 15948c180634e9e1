use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::error::FileMemoryError;

/// Width of a machine pointer; every allocation is rounded to it.
pub const POINTER_WIDTH: usize = std::mem::size_of::<usize>();

/// Round `value` up to the next multiple of `multiple`.
/// Returns `None` on overflow or when `multiple` is zero.
#[inline]
#[must_use]
pub fn round_up(value: usize, multiple: usize) -> Option<usize> {
    value.checked_next_multiple_of(multiple)
}

/// Number of decimal digits needed to print `n`.
#[must_use]
pub fn num_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Owned copy of `path`, reporting allocation failure instead of aborting.
pub(crate) fn copy_path(path: &Path) -> Result<PathBuf, FileMemoryError> {
    let src = path.as_os_str();
    let mut copy = OsString::new();
    copy.try_reserve_exact(src.len())
        .map_err(|_| FileMemoryError::OutOfHostMemory)?;
    copy.push(src);
    Ok(PathBuf::from(copy))
}

/// `{base}.{ordinal}`, decimal, no leading zeros.
pub(crate) fn chunk_path(base: &Path, ordinal: usize) -> Result<PathBuf, FileMemoryError> {
    let base = base.as_os_str();
    let mut path = OsString::new();
    path.try_reserve_exact(base.len() + 1 + num_digits(ordinal))
        .map_err(|_| FileMemoryError::OutOfHostMemory)?;
    path.push(base);
    path.push(".");
    path.push(ordinal.to_string());
    Ok(PathBuf::from(path))
}
