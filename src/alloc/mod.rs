//! Backing memory for the secure pool.
//!
//! A [`Region`] is obtained once, pinned in RAM when the system allows it and
//! released (after a full wipe) when dropped.

use core::{alloc::Layout, ptr::NonNull};
use std::{
    alloc::{GlobalAlloc, System},
    io,
};

use crate::{config::SecmemConfig, error::SecmemError, wipe};

pub mod ffi;

/// How the bytes of a [`Region`] were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Anonymous mapping (`mmap` / `VirtualAlloc`).
    Mapped,
    /// Page-aligned allocation from the system heap, used when mapping fails.
    Heap,
}

/// A contiguous, zero-filled, page-aligned memory region.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
    locked: bool,
}

// The region is plain memory owned by whoever holds the `Region`.
unsafe impl Send for Region {}

impl Region {
    /// Obtains `len` bytes (a multiple of the page size) and applies the
    /// locking and dump policy of `config`.
    ///
    /// A refused page lock only downgrades the region to unlocked unless
    /// `config.require_lock` is set; any other locking failure is an error.
    pub fn new(len: usize, config: &SecmemConfig) -> Result<Self, SecmemError> {
        let mut region = Self::obtain(len)?;

        match region.lock() {
            Ok(()) => region.locked = true,
            Err(err) if lock_refused(&err) => {
                if config.require_lock {
                    return Err(SecmemError::LockRefused(err));
                }
                tracing::warn!(
                    error = %err,
                    "unable to lock the secure memory pool in RAM; secrets may be swapped to disk"
                );
            }
            Err(err) => return Err(SecmemError::Lock(err)),
        }

        if config.exclude_from_core_dumps {
            if let Err(err) = region.exclude_from_core_dumps() {
                tracing::warn!(error = %err, "unable to exclude the secure memory pool from core dumps");
            }
        }

        Ok(region)
    }

    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Whether `addr` falls inside the region.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr.as_ptr() as usize;
        addr >= start && addr < start + self.len
    }

    fn obtain(len: usize) -> Result<Self, SecmemError> {
        let mapped = map_anonymous(len);
        let (ptr, backing) = match mapped {
            Ok(ptr) => (ptr, Backing::Mapped),
            Err(map_err) => {
                tracing::debug!(error = %map_err, "mapping failed, falling back to the heap");
                let ptr = heap_layout(len)
                    .and_then(|layout| NonNull::new(unsafe { System.alloc_zeroed(layout) }))
                    .ok_or(SecmemError::Map {
                        len,
                        source: map_err,
                    })?;
                (ptr, Backing::Heap)
            }
        };

        Ok(Self {
            ptr,
            len,
            backing,
            locked: false,
        })
    }

    fn lock(&self) -> io::Result<()> {
        #[cfg(target_family = "unix")]
        {
            ffi::unix::mlock(self.ptr, self.len)
        }
        #[cfg(target_family = "windows")]
        {
            ffi::windows::virtual_lock(self.ptr, self.len)
        }
        #[cfg(not(any(target_family = "unix", target_family = "windows")))]
        {
            Err(io::Error::from(io::ErrorKind::Unsupported))
        }
    }

    fn exclude_from_core_dumps(&self) -> io::Result<()> {
        #[cfg(target_family = "unix")]
        {
            ffi::unix::madvise_dontdump(self.ptr, self.len)
        }
        // Windows does not include locked pages in minidumps by default
        #[cfg(not(target_family = "unix"))]
        {
            Ok(())
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        wipe::wipe(unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) });

        // May fail (unchecked)
        if self.locked {
            #[cfg(target_family = "unix")]
            let _ = ffi::unix::munlock(self.ptr, self.len);
            #[cfg(target_family = "windows")]
            let _ = ffi::windows::virtual_unlock(self.ptr, self.len);
        }

        match self.backing {
            Backing::Mapped => {
                #[cfg(target_family = "unix")]
                let _ = ffi::unix::munmap(self.ptr, self.len);
                #[cfg(target_family = "windows")]
                let _ = ffi::windows::virtual_free(self.ptr);
            }
            Backing::Heap => {
                if let Some(layout) = heap_layout(self.len) {
                    unsafe { System.dealloc(self.ptr.as_ptr(), layout) };
                }
            }
        }
    }
}

#[inline]
fn heap_layout(len: usize) -> Option<Layout> {
    Layout::from_size_align(len, ffi::page_size()).ok()
}

fn map_anonymous(len: usize) -> io::Result<NonNull<u8>> {
    #[cfg(target_family = "unix")]
    {
        ffi::unix::mmap_anonymous(len).map(NonNull::cast)
    }
    #[cfg(target_family = "windows")]
    {
        ffi::windows::virtual_alloc(len).map(NonNull::cast)
    }
    #[cfg(not(any(target_family = "unix", target_family = "windows")))]
    {
        let _ = len;
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

fn lock_refused(err: &io::Error) -> bool {
    #[cfg(target_family = "unix")]
    {
        ffi::unix::lock_refused(err)
    }
    #[cfg(target_family = "windows")]
    {
        ffi::windows::lock_refused(err)
    }
    #[cfg(not(any(target_family = "unix", target_family = "windows")))]
    {
        err.kind() == io::ErrorKind::Unsupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_is_page_aligned_and_zeroed() {
        let len = 4 * ffi::page_size();
        let region = Region::new(len, &SecmemConfig::new(len)).expect("Failed to create region");

        assert_eq!(region.len(), len);
        assert_eq!(region.as_ptr().as_ptr() as usize % ffi::page_size(), 0);

        let bytes = unsafe { core::slice::from_raw_parts(region.as_ptr().as_ptr(), len) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_region_contains() {
        let len = ffi::page_size();
        let region = Region::new(len, &SecmemConfig::new(len)).expect("Failed to create region");
        let start = region.as_ptr().as_ptr() as usize;

        assert!(region.contains(start));
        assert!(region.contains(start + len - 1));
        assert!(!region.contains(start + len));
        assert!(!region.contains(start.wrapping_sub(1)));
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn test_region_is_mapped_on_unix() {
        let len = ffi::page_size();
        let region = Region::new(len, &SecmemConfig::new(len)).expect("Failed to create region");
        assert_eq!(region.backing, Backing::Mapped);
    }
}
