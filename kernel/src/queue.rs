//! Bounded ring buffer of process references, used by the FCFS scheduler.
//!
//! Single producer, multiple consumers, one spinlock. No priority and no
//! fairness beyond insertion order: `enqueue` appends at the tail,
//! `dequeue` takes the head. The buffer must be dimensioned at least
//! `NPROC` entries — under FCFS every runnable process can be enqueued at
//! once, and a full queue is a kernel bug, not a recoverable condition.

use crate::param::NPROC;
use crate::spinlock::Spinlock;

/// Ring capacity. Sized strictly larger than `NPROC` so that a process
/// which is simultaneously "in the queue" and briefly re-enqueued during a
/// wakeup race can never overflow it.
const CAPACITY: usize = NPROC + 1;

struct Ring {
    entries: [usize; CAPACITY],
    base: usize,
    size: usize,
}

impl Ring {
    const fn new() -> Self {
        Ring {
            entries: [0; CAPACITY],
            base: 0,
            size: 0,
        }
    }
}

static LOCK: Spinlock = Spinlock::init_lock("ready_queue");
static mut RING: Ring = Ring::new();

pub fn init() {}

fn add_index(i: usize, delta: usize) -> usize {
    (i + delta) % CAPACITY
}

/// Append `slot` (a process-table index) at the tail. Returns `false`
/// (the full ready queue is a kernel bug, per the data model) instead of
/// silently dropping work.
pub fn enqueue(slot: usize) -> bool {
    LOCK.acquire();
    let ring = unsafe { &mut *core::ptr::addr_of_mut!(RING) };
    let ok = if ring.size == CAPACITY {
        false
    } else {
        let tail = add_index(ring.base, ring.size);
        ring.entries[tail] = slot;
        ring.size += 1;
        true
    };
    LOCK.release();
    if !ok {
        panic!("ready queue full: dimensioned below live demand");
    }
    ok
}

/// Remove and return the head entry, or `None` if the queue is empty.
pub fn dequeue() -> Option<usize> {
    LOCK.acquire();
    let ring = unsafe { &mut *core::ptr::addr_of_mut!(RING) };
    let r = if ring.size == 0 {
        None
    } else {
        let slot = ring.entries[ring.base];
        ring.base = add_index(ring.base, 1);
        ring.size -= 1;
        Some(slot)
    };
    LOCK.release();
    r
}

pub fn len() -> usize {
    LOCK.acquire();
    let n = unsafe { (*core::ptr::addr_of!(RING)).size };
    LOCK.release();
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain() {
        while dequeue().is_some() {}
    }

    #[test]
    fn fifo_order_is_preserved() {
        drain();
        enqueue(3);
        enqueue(1);
        enqueue(4);
        assert_eq!(dequeue(), Some(3));
        assert_eq!(dequeue(), Some(1));
        assert_eq!(dequeue(), Some(4));
        assert_eq!(dequeue(), None);
    }

    #[test]
    fn enqueue_then_dequeue_round_trips_for_a_single_user() {
        drain();
        enqueue(42);
        assert_eq!(dequeue(), Some(42));
    }

    #[test]
    fn len_tracks_pending_entries() {
        drain();
        assert_eq!(len(), 0);
        enqueue(1);
        enqueue(2);
        assert_eq!(len(), 2);
        dequeue();
        assert_eq!(len(), 1);
    }
}
