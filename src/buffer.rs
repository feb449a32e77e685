use core::{
    fmt,
    ptr::{self, NonNull},
};

use crate::{error::SecmemError, router};

/// A byte buffer living in the secure pool.
///
/// This is the explicit way of keeping a secret (passphrase, key material)
/// in page-locked memory without relying on a registered
/// [`SecureRouter`](crate::SecureRouter). The bytes are wiped when the buffer
/// is dropped.
///
/// A buffer still alive when
/// [`secure_memory_terminate`](crate::secure_memory_terminate) runs is wiped
/// along with the pool. Its contents must not be read afterwards, and
/// dropping it only forgets the pointer.
pub struct SecureBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// The pool is shared by the whole process and guarded internally.
unsafe impl Send for SecureBuf {}
unsafe impl Sync for SecureBuf {}

impl SecureBuf {
    /// Allocates a zero-filled buffer of `len` bytes from the secure pool.
    ///
    /// # Errors
    /// [`SecmemError::Unavailable`] when no pool exists,
    /// [`SecmemError::Exhausted`] when it has no room left.
    pub fn with_len(len: usize) -> Result<Self, SecmemError> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len,
            });
        }

        if !router::secure_memory_state().is_usable() {
            return Err(SecmemError::Unavailable);
        }

        let ptr = NonNull::new(router::allocate_secure(len))
            .ok_or(SecmemError::Exhausted { requested: len })?;
        Ok(Self { ptr, len })
    }

    /// Copies `bytes` into a new secure buffer.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SecmemError> {
        let mut buf = Self::with_len(bytes.len())?;
        buf.as_bytes_mut().copy_from_slice(bytes);
        Ok(buf)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Provides a byte slice view of the buffer.
    /// This function is a convenience wrapper around the `AsRef` implementation.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        self.as_ref()
    }

    /// Provides a mutable byte slice view of the buffer.
    /// This function is a convenience wrapper around the `AsMut` implementation.
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.as_mut()
    }
}

impl AsRef<[u8]> for SecureBuf {
    fn as_ref(&self) -> &[u8] {
        let slice_ptr = ptr::slice_from_raw_parts(self.ptr.as_ptr(), self.len);
        unsafe { &(*slice_ptr) }
    }
}

impl AsMut<[u8]> for SecureBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        let slice_ptr = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        unsafe { &mut (*slice_ptr) }
    }
}

impl fmt::Debug for SecureBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuf")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl Drop for SecureBuf {
    fn drop(&mut self) {
        if self.len > 0 {
            // Wiped by the pool before the block is reused.
            unsafe { router::release_secure(self.ptr) };
        }
    }
}
