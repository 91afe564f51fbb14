//! Mutual exclusion for short critical sections.
//!
//! A `Spinlock` never sleeps: a hart that cannot acquire one spins with
//! interrupts disabled. `push_off`/`pop_off` implement the matched
//! interrupt-disable nesting count described by the concurrency model —
//! it takes as many `pop_off`s as there were `push_off`s to turn interrupts
//! back on, and if they were already off when the nesting began, they stay
//! off.

use crate::proc::cpuid;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const NO_HOLDER: usize = usize::MAX;

#[derive(Debug)]
pub struct Spinlock {
    locked: AtomicBool,
    name: &'static str,
    holder: AtomicUsize,
}

impl Spinlock {
    pub const fn init_lock(name: &'static str) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            name,
            holder: AtomicUsize::new(NO_HOLDER),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the lock. Loops (spins) until it succeeds.
    pub fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("acquire: {} already held by this hart", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.holder.store(cpuid(), Ordering::Relaxed);
    }

    pub fn release(&self) {
        if !self.holding() {
            panic!("release: {} not held by this hart", self.name);
        }
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }

    /// True iff the calling hart holds this lock. Callers must already
    /// have interrupts off (true of any hart that could plausibly hold a
    /// spinlock).
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.holder.load(Ordering::Relaxed) == cpuid()
    }
}

/// Push one level of interrupt-disable nesting onto the current hart.
pub fn push_off() {
    let old = crate::riscv::intr_get();
    crate::riscv::intr_off();
    let cpu = crate::proc::mycpu();
    unsafe {
        if (*cpu).noff == 0 {
            (*cpu).intena = old;
        }
        (*cpu).noff += 1;
    }
}

/// Pop one level of interrupt-disable nesting; re-enables interrupts once
/// nesting reaches zero and they were on beforehand.
pub fn pop_off() {
    let cpu = crate::proc::mycpu();
    if crate::riscv::intr_get() {
        panic!("pop_off: interruptible");
    }
    unsafe {
        if (*cpu).noff == 0 {
            panic!("pop_off: not nested");
        }
        (*cpu).noff -= 1;
        if (*cpu).noff == 0 && (*cpu).intena {
            crate::riscv::intr_on();
        }
    }
}

/// A lock guarding a single value, built on [`Spinlock`]. Every table added
/// to this kernel beyond the original process/buffer-cache set (semaphores,
/// the ready queue, paging metadata, signal state) uses this in preference
/// to a bare lock field plus manual acquire/release pairs: the guard ties
/// the critical section to the data it protects, so a missed `release` is
/// a borrow-check error rather than a hang discovered at 3 a.m.
pub struct Mutex<T> {
    raw: Spinlock,
    data: core::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Mutex {
            raw: Spinlock::init_lock(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.acquire();
        MutexGuard { lock: self }
    }

    pub fn name(&self) -> &'static str {
        self.raw.name()
    }
}

impl<'a, T> core::ops::Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> core::ops::DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_serializes_access() {
        let lk: Mutex<u32> = Mutex::new("test", 0);
        {
            let mut g = lk.lock();
            *g += 1;
        }
        assert_eq!(*lk.lock(), 1);
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn double_acquire_panics() {
        let lk = Spinlock::init_lock("reentrant");
        lk.acquire();
        lk.acquire();
    }
}
