//! Fixed-capacity pool of binary semaphores.
//!
//! Two locks, not one, guard a slot: a single table-wide lock arbitrates
//! *identity* (which slots are free, who owns which id), while each slot
//! carries its own lock for its *value* and sleep channel. That split is
//! what lets `free` race a sleeping `down` without corrupting either: the
//! waiter either wakes to find the slot already reallocated under a new
//! id (and leaves without touching it) or wakes to find it freed but not
//! yet reused, in which case the id check alone stops it from acquiring
//! someone else's semaphore.

use crate::param::MAX_BSEM;
use crate::proc::{sleep, wakeup};
use crate::spinlock::Spinlock;

const INITIAL_ID: i32 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LifeState {
    Unused,
    Used,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Value {
    Acquired,
    Released,
}

struct Bsem {
    sync: Spinlock,
    state: LifeState,
    id: i32,
    value: Value,
}

impl Bsem {
    const fn new() -> Self {
        Bsem {
            sync: Spinlock::init_lock("bsem_sync"),
            state: LifeState::Unused,
            id: 0,
            value: Value::Released,
        }
    }
}

struct Table {
    next_id: i32,
    slots: [Bsem; MAX_BSEM],
}

// A `[CONST_ITEM; N]` repeat expression re-instantiates the const at each
// position rather than copying a value, so this works even though
// `Bsem` (it embeds a `Spinlock`, which embeds atomics) is not `Copy`.
const EMPTY_BSEM: Bsem = Bsem::new();

static TABLE_LIFE: Spinlock = Spinlock::init_lock("bsem_table_life");
static mut TABLE: Table = Table {
    next_id: INITIAL_ID,
    slots: [EMPTY_BSEM; MAX_BSEM],
};

pub fn init() {
    // slots already zero/UNUSED from their const initializer; nothing
    // further to do. Kept as an explicit entry point so boot order reads
    // the same as every other subsystem's `init`.
}

fn is_valid_id(id: i32) -> bool {
    id >= INITIAL_ID
}

/// `alloc() -> id | -1`. Walks the table under the table-life lock,
/// takes the first UNUSED slot, assigns the next id, and always releases
/// the lock before returning — including on the no-free-slot path, which
/// an earlier draft of this table got wrong.
pub fn alloc() -> i32 {
    TABLE_LIFE.acquire();
    let table = unsafe { &mut *core::ptr::addr_of_mut!(TABLE) };
    let found = table.slots.iter().position(|b| b.state == LifeState::Unused);
    let id = match found {
        Some(i) => {
            let id = table.next_id;
            table.next_id += 1;
            table.slots[i].id = id;
            table.slots[i].state = LifeState::Used;
            table.slots[i].value = Value::Released;
            id
        }
        None => -1,
    };
    TABLE_LIFE.release();
    id
}

/// `free(id)`: locate the slot by id under the life lock and zero it to
/// UNUSED. Invalid or already-freed ids are a silent no-op.
pub fn free(id: i32) {
    if !is_valid_id(id) {
        return;
    }
    TABLE_LIFE.acquire();
    let table = unsafe { &mut *core::ptr::addr_of_mut!(TABLE) };
    if let Some(i) = table.slots.iter().position(|b| b.state == LifeState::Used && b.id == id) {
        table.slots[i].state = LifeState::Unused;
        table.slots[i].id = 0;
        table.slots[i].value = Value::Released;
    }
    TABLE_LIFE.release();
}

fn find_for_op(id: i32) -> Option<usize> {
    if !is_valid_id(id) {
        return None;
    }
    TABLE_LIFE.acquire();
    let table = unsafe { &*core::ptr::addr_of!(TABLE) };
    let found = table.slots.iter().position(|b| b.state == LifeState::Used && b.id == id);
    TABLE_LIFE.release();
    found
}

fn has_changed(table: &Table, slot: usize, id: i32) -> bool {
    table.slots[slot].state == LifeState::Unused || table.slots[slot].id != id
}

/// `down(id)`: block until the semaphore is RELEASED, then take it. A
/// bogus id, or a slot that is freed/reallocated out from under a
/// sleeping caller, causes a silent no-op return instead of acquiring.
pub fn down(id: i32) {
    let Some(slot) = find_for_op(id) else { return };
    let table = unsafe { &mut *core::ptr::addr_of_mut!(TABLE) };
    table.slots[slot].sync.acquire();
    loop {
        if has_changed(table, slot, id) {
            table.slots[slot].sync.release();
            return;
        }
        if table.slots[slot].value == Value::Released {
            break;
        }
        let chan = &table.slots[slot] as *const Bsem as usize;
        sleep(chan, &table.slots[slot].sync);
    }
    table.slots[slot].value = Value::Acquired;
    table.slots[slot].sync.release();
}

/// `up(id)`: release and wake every sleeper on this slot's channel. A
/// bogus id is a silent no-op.
pub fn up(id: i32) {
    let Some(slot) = find_for_op(id) else { return };
    let table = unsafe { &mut *core::ptr::addr_of_mut!(TABLE) };
    table.slots[slot].sync.acquire();
    if !has_changed(table, slot, id) {
        table.slots[slot].value = Value::Released;
    }
    let chan = &table.slots[slot] as *const Bsem as usize;
    table.slots[slot].sync.release();
    wakeup(chan);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_assigns_monotone_ids_from_one() {
        let a = alloc();
        let b = alloc();
        assert!(a >= INITIAL_ID);
        assert_eq!(b, a + 1);
        free(a);
        free(b);
    }

    #[test]
    fn free_then_find_for_op_misses() {
        let id = alloc();
        free(id);
        assert!(find_for_op(id).is_none());
    }

    #[test]
    fn invalid_id_is_always_a_no_op() {
        assert!(find_for_op(0).is_none());
        assert!(find_for_op(-5).is_none());
        free(-1); // must not panic
        up(-1);
    }

    #[test]
    fn up_without_a_waiter_just_sets_released() {
        let id = alloc();
        up(id); // already RELEASED after alloc; must not deadlock or panic
        free(id);
    }
}
