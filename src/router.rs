//! Process-wide secure memory context and allocation routing.
//!
//! New allocations go to the secure pool when the calling thread is inside a
//! [`with_secure_memory`](crate::with_secure_memory) scope and the pool is
//! usable; everything else goes to the system heap. Releasing and resizing
//! never look at the scope: the owning backend is found from the address.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};
use std::{
    alloc::System,
    io::{self, Write},
    process,
};

use crate::{
    config::SecmemConfig,
    error::SecmemError,
    pool::{Pool, SecmemStats, BLOCK_ALIGN},
    scope,
    sync::SpinLock,
};

/// Lifecycle of the process-wide secure memory context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecmemState {
    /// `init` has not completed yet.
    Uninitialized = 0,
    /// The pool exists and is pinned in RAM.
    Locked = 1,
    /// The pool exists but the system refused to pin it.
    Unlocked = 2,
    /// Initialized without a pool; every allocation uses the heap.
    Disabled = 3,
    /// The pool has been wiped and released.
    Terminated = 4,
}

const INITIALIZING: u8 = u8::MAX;

impl SecmemState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Locked,
            2 => Self::Unlocked,
            3 => Self::Disabled,
            4 => Self::Terminated,
            _ => Self::Uninitialized,
        }
    }

    /// Whether a pool exists to serve secure allocations.
    #[inline]
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Locked | Self::Unlocked)
    }
}

struct Context {
    state: AtomicU8,
    // Pool bounds, published for lock-free provenance checks.
    pool_start: AtomicUsize,
    pool_end: AtomicUsize,
    pool: SpinLock<Option<Pool>>,
}

static CONTEXT: Context = Context {
    state: AtomicU8::new(SecmemState::Uninitialized as u8),
    pool_start: AtomicUsize::new(0),
    pool_end: AtomicUsize::new(0),
    pool: SpinLock::new(None),
};

impl Context {
    #[inline]
    fn state(&self) -> SecmemState {
        SecmemState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn owns(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.pool_start.load(Ordering::Acquire) && addr < self.pool_end.load(Ordering::Acquire)
    }

    /// Runs `f` on the pool under the lock. `f` must not allocate.
    #[inline]
    fn with_pool<R>(&self, f: impl FnOnce(&mut Pool) -> R) -> Option<R> {
        self.pool.lock().as_mut().map(f)
    }
}

/// Sets up the secure memory context as described by `config`.
///
/// Returns the resulting state: [`SecmemState::Locked`] or
/// [`SecmemState::Unlocked`] when a pool was created,
/// [`SecmemState::Disabled`] when `config.min_bytes` is zero.
///
/// # Errors
/// - [`SecmemError::AlreadyInitialized`] on any call after the first
///   successful one.
/// - [`SecmemError::Map`], [`SecmemError::Lock`] or
///   [`SecmemError::LockRefused`] when the pool cannot be set up; the
///   context stays uninitialized.
pub fn try_init(config: &SecmemConfig) -> Result<SecmemState, SecmemError> {
    CONTEXT
        .state
        .compare_exchange(
            SecmemState::Uninitialized as u8,
            INITIALIZING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .map_err(|_| SecmemError::AlreadyInitialized)?;

    if !config.is_enabled() {
        CONTEXT
            .state
            .store(SecmemState::Disabled as u8, Ordering::Release);
        tracing::info!("secure memory disabled, all allocations use the heap");
        return Ok(SecmemState::Disabled);
    }

    let pool = match Pool::new(config) {
        Ok(pool) => pool,
        Err(err) => {
            CONTEXT
                .state
                .store(SecmemState::Uninitialized as u8, Ordering::Release);
            return Err(err);
        }
    };

    let state = if pool.is_locked() {
        SecmemState::Locked
    } else {
        SecmemState::Unlocked
    };
    let (start, total) = (pool.base(), pool.total_size());

    *CONTEXT.pool.lock() = Some(pool);
    CONTEXT.pool_start.store(start, Ordering::Release);
    CONTEXT.pool_end.store(start + total, Ordering::Release);
    CONTEXT.state.store(state as u8, Ordering::Release);

    tracing::info!(
        bytes = total,
        locked = state == SecmemState::Locked,
        "secure memory pool ready"
    );
    Ok(state)
}

/// Sets up secure memory with a pool of at least `min_bytes`
/// (`0` disables the pool but keeps routing in place).
///
/// # Panics
/// When called more than once, or when the pool cannot be obtained or locked
/// for a reason other than missing permission. Use [`try_init`] to handle
/// those cases.
pub fn secure_memory_init(min_bytes: usize) -> SecmemState {
    match self::try_init(&SecmemConfig::new(min_bytes)) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(error = %err, "secure memory initialization failed");
            panic!("secure memory initialization failed: {err}");
        }
    }
}

/// Wipes and releases the secure pool. Does nothing if secure memory was
/// never initialized.
///
/// # Safety
/// No pointer handed out by the pool may be used, released or resized
/// afterwards: the memory behind it is gone and such pointers are no longer
/// recognized as pool memory.
pub unsafe fn secure_memory_terminate() {
    if CONTEXT.state() == SecmemState::Uninitialized {
        return;
    }

    let pool = {
        let mut guard = CONTEXT.pool.lock();
        CONTEXT.pool_start.store(0, Ordering::Release);
        CONTEXT.pool_end.store(0, Ordering::Release);
        CONTEXT
            .state
            .store(SecmemState::Terminated as u8, Ordering::Release);
        guard.take()
    };

    if let Some(pool) = pool {
        let stats = pool.stats();
        if stats.current_blocks > 0 {
            tracing::warn!(
                blocks = stats.current_blocks,
                bytes = stats.current_bytes,
                "releasing secure memory pool with live allocations"
            );
        }
        drop(pool);
        tracing::info!("secure memory pool released");
    }
}

/// Current lifecycle state.
pub fn secure_memory_state() -> SecmemState {
    CONTEXT.state()
}

/// Whether secure allocations are backed by a pool pinned in RAM.
pub fn secure_memory_available() -> bool {
    CONTEXT.state() == SecmemState::Locked
}

/// Whether `ptr` points into the secure pool.
pub fn secure_memory_check(ptr: *const u8) -> bool {
    CONTEXT.owns(ptr)
}

/// Snapshot of the pool counters, also written to the `debug` log.
///
/// All zero while no pool exists.
pub fn dump_stats() -> SecmemStats {
    let stats = CONTEXT.with_pool(|pool| pool.stats()).unwrap_or_default();
    tracing::debug!(
        current_bytes = stats.current_bytes,
        peak_bytes = stats.peak_bytes,
        current_blocks = stats.current_blocks,
        peak_blocks = stats.peak_blocks,
        pool_used = stats.pool_used,
        pool_total = stats.pool_total,
        "secure memory stats"
    );
    stats
}

/// Allocates `n` bytes from the secure pool regardless of the current scope.
///
/// Returns null when `n` is zero, when no pool exists or when the pool is
/// exhausted; the heap is never used instead.
pub fn allocate_secure(n: usize) -> *mut u8 {
    match n {
        0 => ptr::null_mut(),
        n => self::pool_alloc(n).map_or(ptr::null_mut(), NonNull::as_ptr),
    }
}

/// Allocates `n` bytes, from the secure pool inside a secure scope and from
/// the heap otherwise.
///
/// Returns null when `n` is zero or on failure. A failed secure request never
/// falls back to the heap.
pub fn allocate(n: usize) -> *mut u8 {
    self::route_alloc(n, false)
}

/// Allocates `count * n` zeroed bytes (see [`allocate`]). An overflowing
/// product is a failure.
pub fn zero_allocate(count: usize, n: usize) -> *mut u8 {
    match count.checked_mul(n) {
        Some(total) => self::route_alloc(total, true),
        None => ptr::null_mut(),
    }
}

/// Resizes an allocation obtained from this module.
///
/// `n == 0` releases `ptr` and returns null; a null `ptr` allocates.
/// Pool memory stays in the pool and heap memory stays on the heap. On
/// failure null is returned and `ptr` is left untouched.
///
/// # Safety
/// `ptr` must be null or come from [`allocate`], [`zero_allocate`],
/// [`allocate_secure`] or [`reallocate`], and not have been released.
pub unsafe fn reallocate(ptr: *mut u8, n: usize) -> *mut u8 {
    if n == 0 {
        self::release(ptr);
        return ptr::null_mut();
    }

    let Some(ptr) = NonNull::new(ptr) else {
        return self::allocate(n);
    };

    if CONTEXT.owns(ptr.as_ptr()) {
        self::pool_realloc(ptr, n).map_or(ptr::null_mut(), NonNull::as_ptr)
    } else {
        heap::realloc(ptr, n)
    }
}

/// Releases an allocation obtained from this module. Pool blocks are wiped
/// before they can be reused. Null is ignored.
///
/// # Safety
/// Same requirements on `ptr` as [`reallocate`]; it must not be used after
/// this call.
pub unsafe fn release(ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };

    if CONTEXT.owns(ptr.as_ptr()) {
        self::pool_free(ptr);
    } else {
        heap::free(ptr);
    }
}

/// Returns a block to the pool. Does nothing once the pool is gone.
///
/// # Safety
/// `ptr` must come from [`allocate_secure`] and not have been released.
pub(crate) unsafe fn release_secure(ptr: NonNull<u8>) {
    self::pool_free(ptr);
}

#[inline]
fn routes_to_pool() -> bool {
    scope::is_secure_scope() && CONTEXT.state().is_usable()
}

fn route_alloc(n: usize, zeroed: bool) -> *mut u8 {
    if n == 0 {
        return ptr::null_mut();
    }

    if !routes_to_pool() {
        return heap::alloc(n, zeroed);
    }

    match self::pool_alloc(n) {
        Some(ptr) => {
            if zeroed {
                unsafe { ptr::write_bytes(ptr.as_ptr(), 0, n) };
            }
            ptr.as_ptr()
        }
        None => ptr::null_mut(),
    }
}

fn pool_alloc(n: usize) -> Option<NonNull<u8>> {
    match CONTEXT.with_pool(|pool| pool.alloc(n))? {
        Ok(ptr) => Some(ptr),
        Err(err) if err.is_fatal() => self::fatal(&err),
        Err(_) => None,
    }
}

unsafe fn pool_realloc(ptr: NonNull<u8>, n: usize) -> Option<NonNull<u8>> {
    match CONTEXT.with_pool(|pool| pool.realloc(ptr, n))? {
        Ok(ptr) => Some(ptr),
        Err(err) if err.is_fatal() => self::fatal(&err),
        Err(_) => None,
    }
}

/// `None` from `with_pool` means there is no pool left to return `ptr` to.
unsafe fn pool_free(ptr: NonNull<u8>) {
    if let Some(Err(err)) = CONTEXT.with_pool(|pool| pool.free(ptr)) {
        self::fatal(&err);
    }
}

/// Reports broken pool bookkeeping and aborts. Must not allocate.
#[cold]
fn fatal(err: &SecmemError) -> ! {
    let _ = writeln!(io::stderr(), "secure memory: {err}, aborting");
    process::abort()
}

/// Heap path of the untyped entry points. A small prefix remembers the size
/// so callers do not have to pass it back.
mod heap {
    use core::{
        alloc::{GlobalAlloc, Layout},
        ptr::{self, NonNull},
    };
    use std::alloc::System;

    const PREFIX: usize = 16;

    #[inline]
    fn layout_for(n: usize) -> Option<Layout> {
        Layout::from_size_align(n.checked_add(PREFIX)?, PREFIX).ok()
    }

    #[inline]
    unsafe fn header(ptr: NonNull<u8>) -> (*mut u8, Layout) {
        let base = ptr.as_ptr().sub(PREFIX);
        let n = base.cast::<usize>().read();
        (base, Layout::from_size_align_unchecked(n + PREFIX, PREFIX))
    }

    pub(super) fn alloc(n: usize, zeroed: bool) -> *mut u8 {
        let Some(layout) = layout_for(n) else {
            return ptr::null_mut();
        };

        unsafe {
            let base = if zeroed {
                System.alloc_zeroed(layout)
            } else {
                System.alloc(layout)
            };
            if base.is_null() {
                return ptr::null_mut();
            }
            base.cast::<usize>().write(n);
            base.add(PREFIX)
        }
    }

    pub(super) unsafe fn realloc(ptr: NonNull<u8>, n: usize) -> *mut u8 {
        let (base, layout) = header(ptr);
        let Some(new_layout) = layout_for(n) else {
            return ptr::null_mut();
        };

        let base = System.realloc(base, layout, new_layout.size());
        if base.is_null() {
            return ptr::null_mut();
        }
        base.cast::<usize>().write(n);
        base.add(PREFIX)
    }

    pub(super) unsafe fn free(ptr: NonNull<u8>) {
        let (base, layout) = header(ptr);
        System.dealloc(base, layout);
    }
}

/// Global allocator routing through the secure memory context.
///
/// Register it in the binary to make ordinary allocations (`Box`, `Vec`,
/// `String`, ...) made inside [`with_secure_memory`](crate::with_secure_memory)
/// land in the secure pool:
///
/// ```no_run
/// #[global_allocator]
/// static GLOBAL: secure_mem::SecureRouter = secure_mem::SecureRouter;
///
/// fn main() {
///     secure_mem::secure_memory_init(65536);
///     let passphrase = secure_mem::with_secure_memory(|| String::from("hunter2"));
///     assert!(secure_mem::secure_memory_check(passphrase.as_ptr()));
/// }
/// ```
///
/// Secure requests aligned beyond 16 bytes fail instead of using the heap.
///
/// Everything the thread allocates while a scope is open goes to the pool,
/// including what the panic hook allocates when a panic starts inside the
/// scope. With `RUST_BACKTRACE` set, rendering the backtrace can take far more
/// than a small pool holds. Keep panicking code out of secure scopes, or raise
/// the unwind with [`std::panic::resume_unwind`], which skips the hook.
#[derive(Debug, Default, Clone, Copy)]
pub struct SecureRouter;

impl SecureRouter {
    #[inline]
    fn secure_alloc(layout: Layout, zeroed: bool) -> *mut u8 {
        if layout.align() > BLOCK_ALIGN {
            return ptr::null_mut();
        }

        match self::pool_alloc(layout.size()) {
            Some(ptr) => {
                if zeroed {
                    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, layout.size()) };
                }
                ptr.as_ptr()
            }
            None => ptr::null_mut(),
        }
    }
}

unsafe impl GlobalAlloc for SecureRouter {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if routes_to_pool() {
            Self::secure_alloc(layout, false)
        } else {
            System.alloc(layout)
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if routes_to_pool() {
            Self::secure_alloc(layout, true)
        } else {
            System.alloc_zeroed(layout)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if CONTEXT.owns(ptr) {
            self::pool_free(NonNull::new_unchecked(ptr));
        } else {
            System.dealloc(ptr, layout);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if CONTEXT.owns(ptr) {
            self::pool_realloc(NonNull::new_unchecked(ptr), new_size)
                .map_or(ptr::null_mut(), NonNull::as_ptr)
        } else {
            System.realloc(ptr, layout, new_size)
        }
    }
}
