//! The engine mutex: a three-state futex lock.
//!
//! State 0 is unlocked, 1 locked with no waiters, 2 locked with waiters.
//! The uncontended paths are a single compare-and-swap / decrement; the
//! kernel is only entered when a waiter actually has to sleep.

use crate::os;
use core::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

pub struct Futex {
    state: AtomicU32,
}

impl Futex {
    pub const fn new() -> Futex {
        Futex {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    pub fn lock(&self) {
        if let Err(mut c) =
            self.state
                .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
        {
            loop {
                // Mark the lock contended before sleeping; skip the wait if
                // it was released in the meantime.
                let held = c == CONTENDED
                    || self
                        .state
                        .compare_exchange(LOCKED, CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                        .map_or_else(|old| old != UNLOCKED, |_| true);
                if held {
                    os::futex_wait(&self.state, CONTENDED);
                }
                match self.state.compare_exchange(
                    UNLOCKED,
                    CONTENDED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(cur) => c = cur,
                }
            }
        }
    }

    pub fn unlock(&self) {
        if self.state.fetch_sub(1, Ordering::Release) != LOCKED {
            self.state.store(UNLOCKED, Ordering::Release);
            os::futex_wake(&self.state, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_unlock() {
        let futex = Futex::new();
        futex.lock();
        assert_eq!(futex.state.load(Ordering::Relaxed), LOCKED);
        futex.unlock();
        assert_eq!(futex.state.load(Ordering::Relaxed), UNLOCKED);
    }

    #[test]
    fn serializes_across_threads() {
        use std::sync::Arc;

        struct Shared {
            futex: Futex,
            counter: core::cell::UnsafeCell<usize>,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            futex: Futex::new(),
            counter: core::cell::UnsafeCell::new(0),
        });
        let mut handles = Vec::new();
        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    shared.futex.lock();
                    unsafe {
                        let counter = shared.counter.get();
                        counter.write(counter.read() + 1);
                    }
                    shared.futex.unlock();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(unsafe { shared.counter.get().read() }, 4000);
        assert_eq!(shared.futex.state.load(Ordering::Relaxed), UNLOCKED);
    }
}
