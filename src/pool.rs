//! Block manager for the secure pool.
//!
//! The pool is carved from its unallocated tail on demand. Released blocks
//! are wiped and pushed onto a singly linked free list (most recently freed
//! first) and handed out again first-fit, without splitting or coalescing.
//!
//! Every block starts with a 16-byte header (signature, size) followed by the
//! payload handed to callers. While a block sits on the free list the first
//! word of its payload links to the next free block.

use core::{
    mem,
    ptr::{self, NonNull},
};

use crate::{
    alloc::{ffi, Region},
    config::{align_up, SecmemConfig},
    error::SecmemError,
    wipe,
};

/// Every block size is a multiple of this.
pub const BLOCK_GRANULARITY: usize = 32;

/// Alignment guaranteed for payload pointers.
pub const BLOCK_ALIGN: usize = 16;

/// Bytes taken by the header in front of each payload.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

const SIGNATURE_USED: usize = 0x5EC0_B10C;
const SIGNATURE_FREE: usize = 0xF4EE_B10C;

const _: () = assert!(HEADER_SIZE == BLOCK_ALIGN);
const _: () = assert!(BLOCK_GRANULARITY % BLOCK_ALIGN == 0);

#[repr(C, align(16))]
struct BlockHeader {
    signature: usize,
    /// Whole block, header included.
    size: usize,
}

type Link = Option<NonNull<BlockHeader>>;

/// Usage counters of the secure pool.
///
/// `current_*`/`peak_*` follow live blocks; `pool_used` is the carved part
/// of the pool, which never shrinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecmemStats {
    pub current_bytes: usize,
    pub peak_bytes: usize,
    pub current_blocks: usize,
    pub peak_blocks: usize,
    pub pool_used: usize,
    pub pool_total: usize,
}

/// Fixed-size, optionally page-locked pool serving secure allocations.
pub struct Pool {
    region: Region,
    used: usize,
    free_head: Link,
    stats: SecmemStats,
}

// Block links only ever point inside `region`, which the pool owns.
unsafe impl Send for Pool {}

impl Pool {
    /// Creates a pool of at least `config.min_bytes` (see
    /// [`SecmemConfig::pool_size`]).
    pub fn new(config: &SecmemConfig) -> Result<Self, SecmemError> {
        let len = config.pool_size(ffi::page_size());
        let region = Region::new(len, config)?;

        Ok(Self {
            region,
            used: 0,
            free_head: None,
            stats: SecmemStats {
                pool_total: len,
                ..SecmemStats::default()
            },
        })
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.region.as_ptr().as_ptr() as usize
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.region.len()
    }

    #[inline]
    pub fn used_size(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.region.is_locked()
    }

    /// Whether `ptr` lies inside the pool, whatever the state of the block
    /// it points into.
    #[inline]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr as usize)
    }

    #[inline]
    pub fn stats(&self) -> SecmemStats {
        SecmemStats {
            pool_used: self.used,
            ..self.stats
        }
    }

    /// Allocates a block with room for at least `n` payload bytes.
    ///
    /// The payload of a fresh or recycled block is zero-filled.
    pub fn alloc(&mut self, n: usize) -> Result<NonNull<u8>, SecmemError> {
        let size = block_size(n).ok_or(SecmemError::Exhausted { requested: n })?;

        let block = match self.take_free(size)? {
            Some(block) => block,
            None => self
                .carve(size)
                .ok_or(SecmemError::Exhausted { requested: n })?,
        };

        let size = unsafe { block.as_ref().size };
        self.stats.current_bytes += size;
        self.stats.current_blocks += 1;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.current_bytes);
        self.stats.peak_blocks = self.stats.peak_blocks.max(self.stats.current_blocks);

        Ok(payload_of(block))
    }

    /// Wipes the block behind `ptr` and puts it on the free list.
    ///
    /// # Safety
    /// The payload of `ptr` must not be accessed after this call.
    ///
    /// # Errors
    /// [`SecmemError::Corrupted`] when `ptr` does not lead to a live block
    /// (foreign pointer, damaged header or double free). The pool is left
    /// untouched in that case.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), SecmemError> {
        let block = self.live_block(ptr)?;
        let size = block.as_ref().size;

        wipe::wipe(core::slice::from_raw_parts_mut(block.as_ptr().cast::<u8>(), size));

        // The wipe destroyed the header.
        block.as_ptr().write(BlockHeader {
            signature: SIGNATURE_FREE,
            size,
        });
        link_of(block).write(self.free_head);
        self.free_head = Some(block);

        self.stats.current_bytes -= size;
        self.stats.current_blocks -= 1;
        Ok(())
    }

    /// Grows the block behind `ptr` so it holds at least `new_n` bytes.
    ///
    /// Returns `ptr` itself when the block is already large enough (blocks are
    /// never shrunk). Otherwise the payload moves to a new block, the bytes
    /// past the old payload are zeroed and the old block is freed.
    ///
    /// # Safety
    /// On success, `ptr` must not be accessed anymore unless it was returned.
    ///
    /// # Errors
    /// [`SecmemError::Exhausted`] leaves the old block intact;
    /// [`SecmemError::Corrupted`] as for [`Pool::free`].
    pub unsafe fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        new_n: usize,
    ) -> Result<NonNull<u8>, SecmemError> {
        let capacity = self.capacity_of(ptr)?;
        if new_n <= capacity {
            return Ok(ptr);
        }

        let new_ptr = self.alloc(new_n)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), capacity);
        ptr::write_bytes(new_ptr.as_ptr().add(capacity), 0, new_n - capacity);

        self.free(ptr)?;
        Ok(new_ptr)
    }

    /// Payload bytes available behind `ptr`, which may exceed what was asked.
    pub fn capacity_of(&self, ptr: NonNull<u8>) -> Result<usize, SecmemError> {
        let block = self.live_block(ptr)?;
        Ok(unsafe { block.as_ref().size } - HEADER_SIZE)
    }

    /// First-fit search of the free list.
    fn take_free(&mut self, size: usize) -> Result<Link, SecmemError> {
        let mut prev: Link = None;
        let mut cursor = self.free_head;

        while let Some(block) = cursor {
            let header = unsafe { block.as_ref() };
            if header.signature != SIGNATURE_FREE {
                return Err(SecmemError::Corrupted {
                    addr: block.as_ptr() as usize,
                });
            }

            let next = unsafe { link_of(block).read() };
            if header.size >= size {
                match prev {
                    Some(prev) => unsafe { link_of(prev).write(next) },
                    None => self.free_head = next,
                }

                unsafe {
                    ptr::write_volatile(link_of(block), None);
                    (*block.as_ptr()).signature = SIGNATURE_USED;
                }
                return Ok(Some(block));
            }

            prev = cursor;
            cursor = next;
        }

        Ok(None)
    }

    /// Takes `size` bytes from the unallocated tail.
    fn carve(&mut self, size: usize) -> Link {
        if size > self.total_size() - self.used {
            return None;
        }

        let block = unsafe {
            let addr = self.region.as_ptr().as_ptr().add(self.used);
            NonNull::new_unchecked(addr.cast::<BlockHeader>())
        };
        unsafe {
            block.as_ptr().write(BlockHeader {
                signature: SIGNATURE_USED,
                size,
            })
        };

        self.used += size;
        Some(block)
    }

    /// Recovers the header of a block currently handed out.
    fn live_block(&self, ptr: NonNull<u8>) -> Result<NonNull<BlockHeader>, SecmemError> {
        let base = self.base();
        let addr = (ptr.as_ptr() as usize)
            .checked_sub(HEADER_SIZE)
            .filter(|&addr| addr >= base && addr < base + self.used)
            .filter(|&addr| (addr - base) % BLOCK_GRANULARITY == 0)
            .ok_or_else(|| corrupted_at(ptr))?;

        let block = unsafe { NonNull::new_unchecked(addr as *mut BlockHeader) };
        let header = unsafe { block.as_ref() };

        let sane = header.signature == SIGNATURE_USED
            && header.size >= BLOCK_GRANULARITY
            && header.size % BLOCK_GRANULARITY == 0
            && header.size <= base + self.used - addr;

        if sane {
            Ok(block)
        } else {
            Err(corrupted_at(ptr))
        }
    }

    /// Walks the free list checking its invariants; returns its length.
    #[cfg(test)]
    fn free_list_len(&self) -> Result<usize, SecmemError> {
        let mut seen = Vec::new();
        let mut cursor = self.free_head;

        while let Some(block) = cursor {
            let addr = block.as_ptr() as usize;
            let header = unsafe { block.as_ref() };
            let valid = header.signature == SIGNATURE_FREE
                && header.size >= BLOCK_GRANULARITY
                && self.owns(addr as *const u8)
                && !seen.contains(&addr);
            if !valid {
                return Err(SecmemError::Corrupted { addr });
            }

            seen.push(addr);
            cursor = unsafe { link_of(block).read() };
        }

        Ok(seen.len())
    }
}

#[inline]
fn corrupted_at(ptr: NonNull<u8>) -> SecmemError {
    SecmemError::Corrupted {
        addr: ptr.as_ptr() as usize,
    }
}

/// Total block size for `n` payload bytes, `None` on overflow.
#[inline]
fn block_size(n: usize) -> Option<usize> {
    n.checked_add(HEADER_SIZE + BLOCK_GRANULARITY - 1)
        .map(|padded| align_up(padded - (BLOCK_GRANULARITY - 1), BLOCK_GRANULARITY))
}

#[inline]
fn payload_of(block: NonNull<BlockHeader>) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(block.as_ptr().cast::<u8>().add(HEADER_SIZE)) }
}

#[inline]
fn link_of(block: NonNull<BlockHeader>) -> *mut Link {
    payload_of(block).as_ptr().cast::<Link>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pool() -> Pool {
        Pool::new(&SecmemConfig::new(16384).exclude_from_core_dumps(false))
            .expect("Failed to create pool")
    }

    fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { ptr::write_bytes(ptr.as_ptr(), byte, len) };
    }

    fn bytes<'a>(ptr: NonNull<u8>, len: usize) -> &'a [u8] {
        unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) }
    }

    #[test]
    fn test_block_size_rounding() {
        assert_eq!(block_size(0), Some(32));
        assert_eq!(block_size(16), Some(32));
        assert_eq!(block_size(17), Some(64));
        assert_eq!(block_size(100), Some(128));
        assert_eq!(block_size(usize::MAX), None);
    }

    #[test]
    fn test_alloc_is_aligned_and_owned() {
        let mut pool = pool();
        let ptr = pool.alloc(100).expect("Failed to allocate");

        assert!(pool.owns(ptr.as_ptr()));
        assert_eq!(ptr.as_ptr() as usize % BLOCK_ALIGN, 0);
        assert_eq!(pool.capacity_of(ptr).unwrap(), 128 - HEADER_SIZE);
        assert_eq!(pool.used_size(), 128);
    }

    #[test]
    fn test_freed_block_is_reused_and_wiped() {
        let mut pool = pool();
        let first = pool.alloc(100).unwrap();
        fill(first, 100, 0xAB);
        unsafe { pool.free(first).unwrap() };

        let second = pool.alloc(100).unwrap();
        assert_eq!(first, second);
        assert!(bytes(second, 100).iter().all(|&b| b == 0));
        assert_eq!(pool.used_size(), 128);
    }

    #[test]
    fn test_free_wipes_whole_payload() {
        let mut pool = pool();
        let ptr = pool.alloc(64).unwrap();
        fill(ptr, 64, 0x5A);
        unsafe { pool.free(ptr).unwrap() };

        // Only the free-list link may be non-zero.
        let tail = &bytes(ptr, 64)[mem::size_of::<Link>()..];
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_first_fit_without_splitting() {
        let mut pool = pool();
        let big = pool.alloc(200).unwrap();
        let _guard = pool.alloc(10).unwrap();
        unsafe { pool.free(big).unwrap() };

        let small = pool.alloc(10).unwrap();
        assert_eq!(small, big);
        assert_eq!(pool.capacity_of(small).unwrap(), 224 - HEADER_SIZE);
    }

    #[test]
    fn test_free_list_is_lifo() {
        let mut pool = pool();
        let a = pool.alloc(10).unwrap();
        let b = pool.alloc(10).unwrap();
        unsafe {
            pool.free(a).unwrap();
            pool.free(b).unwrap();
        }
        assert_eq!(pool.free_list_len().unwrap(), 2);

        assert_eq!(pool.alloc(10).unwrap(), b);
        assert_eq!(pool.alloc(10).unwrap(), a);
        assert_eq!(pool.free_list_len().unwrap(), 0);
    }

    #[test]
    fn test_stats_balance() {
        let mut pool = pool();
        for _ in 0..10 {
            let a = pool.alloc(40).unwrap();
            let b = pool.alloc(40).unwrap();
            unsafe {
                pool.free(a).unwrap();
                pool.free(b).unwrap();
            }
        }

        let stats = pool.stats();
        assert_eq!(stats.current_bytes, 0);
        assert_eq!(stats.current_blocks, 0);
        assert_eq!(stats.peak_blocks, 2);
        assert_eq!(stats.peak_bytes, 128);
        assert_eq!(stats.pool_used, 128);
        assert_eq!(stats.pool_total, pool.total_size());
    }

    #[test]
    fn test_exhaustion_then_recovery() {
        let mut pool = pool();
        let mut blocks = Vec::new();
        loop {
            match pool.alloc(480) {
                Ok(ptr) => blocks.push(ptr),
                Err(SecmemError::Exhausted { requested }) => {
                    assert_eq!(requested, 480);
                    break;
                }
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(blocks.len(), pool.total_size() / 512);
        assert_eq!(pool.used_size(), pool.total_size());

        let victim = blocks[3];
        unsafe { pool.free(victim).unwrap() };
        assert_eq!(pool.alloc(300).unwrap(), victim);
        assert!(matches!(
            pool.alloc(1),
            Err(SecmemError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_realloc_in_place_when_fits() {
        let mut pool = pool();
        let ptr = pool.alloc(20).unwrap();
        let same = unsafe { pool.realloc(ptr, 16 + 10).unwrap() };
        assert_eq!(ptr, same);
        let shrunk = unsafe { pool.realloc(ptr, 1).unwrap() };
        assert_eq!(ptr, shrunk);
    }

    #[test]
    fn test_realloc_moves_and_preserves() {
        let mut pool = pool();
        let ptr = pool.alloc(16).unwrap();
        fill(ptr, 16, 0x42);

        let grown = unsafe { pool.realloc(ptr, 100).unwrap() };
        assert_ne!(ptr, grown);
        assert!(bytes(grown, 16).iter().all(|&b| b == 0x42));
        assert!(bytes(grown, 100)[16..].iter().all(|&b| b == 0));
        assert_eq!(pool.stats().current_blocks, 1);
        assert_eq!(pool.free_list_len().unwrap(), 1);
    }

    #[test]
    fn test_realloc_failure_keeps_block() {
        let mut pool = pool();
        let ptr = pool.alloc(16).unwrap();
        fill(ptr, 16, 0x42);

        let err = unsafe { pool.realloc(ptr, pool.total_size()) }.unwrap_err();
        assert!(matches!(err, SecmemError::Exhausted { .. }));
        assert!(bytes(ptr, 16).iter().all(|&b| b == 0x42));
        unsafe { pool.free(ptr).unwrap() };
    }

    #[test]
    fn test_corrupted_signature_is_detected() {
        let mut pool = pool();
        let ptr = pool.alloc(32).unwrap();
        unsafe { *ptr.as_ptr().sub(HEADER_SIZE) ^= 0xFF };

        let err = unsafe { pool.free(ptr) }.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(pool.stats().current_blocks, 1);
    }

    #[test]
    fn test_double_free_is_detected() {
        let mut pool = pool();
        let ptr = pool.alloc(32).unwrap();
        unsafe { pool.free(ptr).unwrap() };

        let err = unsafe { pool.free(ptr) }.unwrap_err();
        assert!(matches!(err, SecmemError::Corrupted { .. }));
        assert_eq!(pool.free_list_len().unwrap(), 1);
    }

    #[test]
    fn test_misaligned_pointer_is_rejected() {
        let mut pool = pool();
        let ptr = pool.alloc(64).unwrap();
        let inner = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(8)) };
        assert!(pool.owns(inner.as_ptr()));
        assert!(unsafe { pool.free(inner) }.is_err());
    }

    #[test]
    fn test_foreign_pointer_is_rejected() {
        let mut pool = pool();
        let mut outside = [0u8; 64];
        let ptr = NonNull::new(outside.as_mut_ptr().wrapping_add(32)).unwrap();
        assert!(!pool.owns(ptr.as_ptr()));
        assert!(unsafe { pool.free(ptr) }.is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Alloc(usize),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..600).prop_map(Op::Alloc),
            any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn prop_random_interleavings_keep_invariants(ops in prop::collection::vec(op(), 1..200)) {
            let mut pool = pool();
            let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

            for (step, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Alloc(n) => match pool.alloc(n) {
                        Ok(ptr) => {
                            prop_assert!(bytes(ptr, n).iter().all(|&b| b == 0));
                            let tag = (step % 251) as u8 + 1;
                            fill(ptr, n, tag);
                            live.push((ptr, n, tag));
                        }
                        Err(err) => {
                            prop_assert!(
                                matches!(err, SecmemError::Exhausted { .. }),
                                "unexpected error: {:?}",
                                err
                            );
                        }
                    },
                    Op::Free(index) if !live.is_empty() => {
                        let (ptr, n, tag) = live.swap_remove(index % live.len());
                        prop_assert!(bytes(ptr, n).iter().all(|&b| b == tag));
                        unsafe { pool.free(ptr).unwrap() };
                    }
                    Op::Free(_) => {}
                }

                let stats = pool.stats();
                prop_assert_eq!(stats.current_blocks, live.len());
                prop_assert!(stats.current_bytes <= stats.pool_used);
                prop_assert!(pool.free_list_len().is_ok());
            }

            for (ptr, _, _) in live.drain(..) {
                unsafe { pool.free(ptr).unwrap() };
            }
            prop_assert_eq!(pool.stats().current_bytes, 0);
        }
    }
}
