use std::ffi::CStr;
use std::ffi::OsStr;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::io::Error;
use std::mem::align_of;
use std::mem::size_of;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::io::RawFd;
use std::slice;
use std::sync::LockResult;
use std::sync::PoisonError;


/// Retrieve the status of the file referenced by `fd`.
pub(crate) fn fstat(fd: RawFd) -> Result<libc::stat, Error> {
    let mut stat = MaybeUninit::uninit();
    // SAFETY: `stat` is valid for writes of a `struct stat`.
    let rc = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::last_os_error())
    }
    // SAFETY: `fstat` succeeded and filled in the object.
    Ok(unsafe { stat.assume_init() })
}

#[inline]
pub(crate) fn bytes_to_os_str(bytes: &[u8]) -> &OsStr {
    OsStr::from_bytes(bytes)
}

/// Take the guard out of a lock result, whether the lock is poisoned
/// or not.
#[inline]
pub(crate) fn unpoison<G>(result: LockResult<G>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}


/// Format a byte slice as lower case hex digits.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Hexify<'bytes>(pub &'bytes [u8]);

impl Display for Hexify<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        self.0
            .iter()
            .try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}


/// Find the element with the greatest key less than or equal to `key`
/// in a slice sorted by key.
///
/// If multiple elements share that key, the index of the first of
/// them is reported.
pub(crate) fn find_floor_by_key<T, K, F>(slice: &[T], key: K, mut f: F) -> Option<usize>
where
    K: Ord,
    F: FnMut(&T) -> K,
{
    let end = slice.partition_point(|e| f(e) <= key);
    let floor = f(slice.get(end.checked_sub(1)?)?);
    let candidates = slice.get(..end)?;
    Some(candidates.partition_point(|e| f(e) < floor))
}


/// A marker trait for "plain old data" types.
///
/// # Safety
/// Only safe to implement for types that are valid for any bit pattern.
pub(crate) unsafe trait Pod {}

unsafe impl Pod for u32 {}


/// Cursor style reading of data from a byte buffer.
pub(crate) trait ReadRaw<'data> {
    /// Consume and return `len` bytes.
    fn read_slice(&mut self, len: usize) -> Option<&'data [u8]>;

    /// Read a NUL terminated string.
    fn read_cstr(&mut self) -> Option<&'data CStr>;

    /// Read an unaligned copy of a `Pod` value.
    #[inline]
    fn read_pod<T>(&mut self) -> Option<T>
    where
        T: Pod,
    {
        let data = self.read_slice(size_of::<T>())?;
        // SAFETY: `T` is valid for any bit pattern and `data` spans
        //         `size_of::<T>()` bytes.
        Some(unsafe { data.as_ptr().cast::<T>().read_unaligned() })
    }

    /// Borrow `count` consecutive `Pod` values, provided that the data
    /// is suitably aligned for `T`.
    #[inline]
    fn read_pod_slice_ref<T>(&mut self, count: usize) -> Option<&'data [T]>
    where
        T: Pod,
    {
        let data = self.read_slice(size_of::<T>().checked_mul(count)?)?;
        let ptr = data.as_ptr();
        if ptr.align_offset(align_of::<T>()) != 0 {
            return None
        }
        // SAFETY: `T` is valid for any bit pattern, the pointer is
        //         aligned, and it covers `count` objects.
        Some(unsafe { slice::from_raw_parts(ptr.cast::<T>(), count) })
    }

    #[inline]
    fn read_u32(&mut self) -> Option<u32> {
        self.read_pod::<u32>()
    }
}

impl<'data> ReadRaw<'data> for &'data [u8] {
    #[inline]
    fn read_slice(&mut self, len: usize) -> Option<&'data [u8]> {
        if len > self.len() {
            return None
        }
        let (head, tail) = self.split_at(len);
        *self = tail;
        Some(head)
    }

    #[inline]
    fn read_cstr(&mut self) -> Option<&'data CStr> {
        let nul = self.iter().position(|byte| *byte == b'\0')?;
        CStr::from_bytes_with_nul(self.read_slice(nul + 1)?).ok()
    }
}
