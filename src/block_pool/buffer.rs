//! Anonymous memory mapping backing a pool block
//!
//! `MmapBuffer` owns a private, zero-filled anonymous mapping of a fixed size.
//! The mapping is created once and never resized; it is unmapped either
//! explicitly through [`MmapBuffer::release`] (which reports failures) or
//! implicitly on drop (which logs them).

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use tracing::error;

use crate::error::{Error, Result};

/// A fixed-size, zero-filled memory mapping.
///
/// # Memory Safety
///
/// - The pointer is non-null and valid for `size` bytes while mapped
/// - The mapping is owned exclusively; `Send` but not `Sync`
/// - Dropping unmaps the region if it was not released explicitly
#[derive(Debug)]
pub struct MmapBuffer {
    /// Start of the mapping, `None` once released
    ptr: Option<NonNull<u8>>,
    /// Size of the mapping in bytes
    size: usize,
}

// SAFETY: MmapBuffer owns its mapping exclusively and can be moved between
// threads. Shared access goes through &self/&mut self like any Vec<u8>.
unsafe impl Send for MmapBuffer {}

impl MmapBuffer {
    /// Map a new zero-filled buffer of exactly `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::BufferAllocation` if `size` is 0 ("invalid size") or
    /// the kernel refuses the mapping ("mmap error").
    pub fn allocate(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::BufferAllocation {
                size: 0,
                reason: "invalid size".into(),
            });
        }

        let ptr = sys::map(size).map_err(|e| Error::BufferAllocation {
            size: size as u64,
            reason: format!("mmap error: {}", e),
        })?;

        Ok(Self {
            ptr: Some(ptr),
            size,
        })
    }

    /// Size of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false for a constructed buffer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Unmap the buffer, reporting any failure to the caller.
    ///
    /// A failure here means the region was already unmapped or never
    /// belonged to us; there is nothing to retry.
    pub fn release(mut self) -> Result<()> {
        match self.ptr.take() {
            Some(ptr) => sys::unmap(ptr, self.size).map_err(|e| Error::BufferRelease {
                failed: 1,
                reason: format!("munmap error: {}", e),
            }),
            None => Err(Error::BufferRelease {
                failed: 1,
                reason: "invalid buffer".into(),
            }),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: ptr is valid for self.size bytes while mapped.
            Some(ptr) => unsafe { slice::from_raw_parts(ptr.as_ptr(), self.size) },
            None => &[],
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: ptr is valid for self.size bytes and we have exclusive access.
            Some(ptr) => unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), self.size) },
            None => &mut [],
        }
    }
}

impl Drop for MmapBuffer {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            if let Err(e) = sys::unmap(ptr, self.size) {
                error!(size = self.size, "munmap failed on drop, possible memory corruption: {}", e);
            }
        }
    }
}

impl Deref for MmapBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for MmapBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

#[cfg(unix)]
mod sys {
    use std::io;
    use std::ptr::NonNull;

    pub(super) fn map(size: usize) -> io::Result<NonNull<u8>> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned NULL"))
    }

    pub(super) fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: ptr/size describe a mapping created by `map`.
        let rc = unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Heap fallback for targets without mmap.
#[cfg(not(unix))]
mod sys {
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::io;
    use std::ptr::NonNull;

    const PAGE_ALIGNMENT: usize = 4096;

    fn layout(size: usize) -> io::Result<Layout> {
        Layout::from_size_align(size, PAGE_ALIGNMENT)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
    }

    pub(super) fn map(size: usize) -> io::Result<NonNull<u8>> {
        let layout = layout(size)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "allocation failed"))
    }

    pub(super) fn unmap(ptr: NonNull<u8>, size: usize) -> io::Result<()> {
        let layout = layout(size)?;
        // SAFETY: ptr was allocated with this layout.
        unsafe { dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}
