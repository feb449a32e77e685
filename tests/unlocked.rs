//! A pool the system refuses to pin in RAM.
//!
//! The locked-memory limit is lowered to zero before the pool is created, so
//! `mlock` is refused and the context degrades to an unlocked pool.

#![cfg(target_family = "unix")]

use std::slice;

use secure_mem::*;

fn forbid_page_locking() -> bool {
    // Root may lock pages whatever the limit says.
    if unsafe { libc::geteuid() } == 0 {
        return false;
    }

    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) == 0 }
}

#[test]
fn refused_lock_degrades_to_unlocked_pool() {
    if !forbid_page_locking() {
        eprintln!("skipping: page locking cannot be forbidden for this process");
        return;
    }

    let strict = SecmemConfig::new(16384).require_lock(true);
    assert!(matches!(try_init(&strict), Err(SecmemError::LockRefused(_))));
    assert_eq!(secure_memory_state(), SecmemState::Uninitialized);

    let state = try_init(&SecmemConfig::new(16384)).expect("unlocked pool");
    assert_eq!(state, SecmemState::Unlocked);
    assert_eq!(secure_memory_state(), SecmemState::Unlocked);
    assert!(state.is_usable());
    assert!(!secure_memory_available());

    let key = allocate_secure(64);
    assert!(!key.is_null());
    assert!(secure_memory_check(key));
    assert!(unsafe { slice::from_raw_parts(key, 64) }
        .iter()
        .all(|&b| b == 0));

    let scoped = with_secure_memory(|| allocate(40));
    assert!(secure_memory_check(scoped));

    let buf = SecureBuf::from_slice(b"swappable secret").unwrap();
    assert!(secure_memory_check(buf.as_ptr()));
    drop(buf);

    unsafe {
        release(scoped);
        release(key);
    }
    assert_eq!(dump_stats().current_blocks, 0);
}
