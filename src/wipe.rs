//! Multi-pass overwrite of released secure memory.

use core::{
    ptr,
    sync::atomic::{compiler_fence, Ordering},
};

use zeroize::Zeroize;

/// Fill patterns written, in order, before the final zero pass.
pub const WIPE_PATTERNS: [u8; 3] = [0xFF, 0xAA, 0x55];

/// Overwrites `bytes` with every pattern of [`WIPE_PATTERNS`] and then zeroes
/// it. Each pass goes through volatile writes so none of them can be removed
/// as a dead store.
pub fn wipe(bytes: &mut [u8]) {
    for pattern in WIPE_PATTERNS {
        fill_volatile(bytes, pattern);
    }
    bytes.zeroize();
}

#[inline(never)]
fn fill_volatile(bytes: &mut [u8], pattern: u8) {
    for byte in bytes.iter_mut() {
        unsafe { ptr::write_volatile(byte, pattern) };
    }
    compiler_fence(Ordering::SeqCst);
}
