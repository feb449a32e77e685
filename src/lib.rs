//! Secure memory for secrets held by the key manager.
//!
//! Allocations made inside [`with_secure_memory`] are served from a single
//! pool that is pinned in RAM (so it is never swapped out) and every block is
//! overwritten with several bit patterns as soon as it is released. All other
//! allocations keep using the system heap through the same entry points.
//!
//! Call [`secure_memory_init`] once at startup, then either register
//! [`SecureRouter`] as the `#[global_allocator]` to route ordinary `Box`,
//! `Vec` and `String` allocations transparently, or use the explicit entry
//! points ([`allocate`], [`zero_allocate`], [`reallocate`], [`release`],
//! [`allocate_secure`]) and [`SecureBuf`].

mod alloc;
mod buffer;
mod config;
mod error;
mod pool;
mod router;
mod scope;
mod sync;
mod wipe;

pub use buffer::SecureBuf;
pub use config::{SecmemConfig, DEFAULT_POOL_SIZE, POOL_FLOOR};
pub use error::SecmemError;
pub use pool::{Pool, SecmemStats, BLOCK_ALIGN, BLOCK_GRANULARITY, HEADER_SIZE};
pub use router::{
    allocate, allocate_secure, dump_stats, reallocate, release, secure_memory_available,
    secure_memory_check, secure_memory_init, secure_memory_state, secure_memory_terminate,
    try_init, zero_allocate, SecmemState, SecureRouter,
};
pub use scope::{is_secure_scope, with_secure_memory, SecureScope};
pub use wipe::{wipe, WIPE_PATTERNS};
