use std::io;

/// Errors reported by the secure memory subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SecmemError {
    /// `init` was called while the subsystem was already set up (or torn down).
    #[error("secure memory has already been initialized")]
    AlreadyInitialized,

    /// The backing region could not be obtained at all.
    #[error("unable to obtain {len} bytes for the secure memory pool: {source}")]
    Map { len: usize, source: io::Error },

    /// Page locking failed for a reason other than missing permission.
    #[error("unable to lock the secure memory pool: {0}")]
    Lock(#[source] io::Error),

    /// Page locking was refused and the configuration requires a locked pool.
    #[error("locking the secure memory pool was refused: {0}")]
    LockRefused(#[source] io::Error),

    /// No free block and no free tail large enough for the request.
    #[error("secure memory pool exhausted ({requested} bytes requested)")]
    Exhausted { requested: usize },

    /// A block header did not carry the expected signature.
    #[error("secure memory block at {addr:#x} is corrupted or already freed")]
    Corrupted { addr: usize },

    /// The pool is missing (uninitialized, disabled or terminated).
    #[error("secure memory is not available")]
    Unavailable,
}

impl SecmemError {
    /// Whether the error describes broken allocator bookkeeping, which
    /// allocator entry points turn into an abort.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}
