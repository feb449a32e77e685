//! The "use secure memory here" marker.
//!
//! The routing flag is per thread: a scope opened on one thread never sends
//! another thread's allocations to the pool.

use core::{cell::Cell, marker::PhantomData};

thread_local! {
    static SECURE_SCOPE: Cell<bool> = const { Cell::new(false) };
}

/// Whether allocations made by the current thread are routed to the pool.
#[inline]
pub fn is_secure_scope() -> bool {
    // The slot is gone while the thread is being torn down.
    SECURE_SCOPE.try_with(Cell::get).unwrap_or(false)
}

#[inline]
fn replace_flag(value: bool) -> bool {
    SECURE_SCOPE.try_with(|flag| flag.replace(value)).unwrap_or(false)
}

/// Guard routing the current thread's new allocations to the secure pool
/// until it is dropped, at which point the previous routing is restored.
#[must_use = "the secure scope ends as soon as the guard is dropped"]
pub struct SecureScope {
    previous: bool,
    // The flag belongs to the thread that entered the scope.
    _not_send: PhantomData<*const ()>,
}

impl SecureScope {
    pub fn enter() -> Self {
        Self {
            previous: replace_flag(true),
            _not_send: PhantomData,
        }
    }
}

impl Drop for SecureScope {
    fn drop(&mut self) {
        replace_flag(self.previous);
    }
}

/// Runs `body` with new allocations routed to the secure pool.
///
/// The previous routing is restored when `body` returns, including through
/// `?`-style early returns inside it and panics, so scopes nest freely.
///
/// The panic hook runs before unwinding starts, so its allocations (the
/// message, and the backtrace when `RUST_BACKTRACE` is set) are still served
/// from the pool and can exhaust it.
///
/// ```
/// let secret = secure_mem::with_secure_memory(|| String::from("passphrase"));
/// # drop(secret);
/// ```
pub fn with_secure_memory<R>(body: impl FnOnce() -> R) -> R {
    let _scope = SecureScope::enter();
    body()
}
