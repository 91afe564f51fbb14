//! Process/thread/signal/scheduling syscalls. File-table-adjacent
//! syscalls (`exec`, `open`, ...) live in `sysfile.rs`; everything here
//! delegates straight into `proc.rs`/`signal.rs`, marshalling arguments
//! and return values across the user/kernel boundary.

use crate::proc::{self, myproc};
use crate::signal::{self, Handler, Sigset};

use super::syscall::{argaddr, argint, fetchaddr, put_user};

pub(crate) fn sys_fork() -> u64 {
    proc::fork() as u64
}

pub(crate) fn sys_exit() -> u64 {
    let status = argint(0);
    proc::exit(status);
}

pub(crate) fn sys_wait() -> u64 {
    let addr = argaddr(0);
    let mut status = 0i32;
    let pid = proc::wait(&mut status);
    if pid >= 0 && addr != 0 {
        let bytes = status.to_ne_bytes();
        if put_user(addr, bytes.as_ptr(), bytes.len()) < 0 {
            return u64::MAX;
        }
    }
    pid as u64
}

pub(crate) fn sys_kill() -> u64 {
    let pid = argint(0) as u32;
    let signum = argint(1);
    proc::kill(pid, signum) as u64
}

pub(crate) fn sys_getpid() -> u64 {
    myproc().pid() as u64
}

/// Classic `sbrk`: grow (or, for a negative argument, shrink) the
/// process's address space by `n` bytes. Returns the address space size
/// from before the change, or `u64::MAX` on failure.
pub(crate) fn sys_sbrk() -> u64 {
    let n = argint(0);
    let old_sz = myproc().sz();
    let new_sz = if n >= 0 {
        crate::vm::uvmalloc(myproc().pagetable(), old_sz, old_sz + n as usize, crate::riscv::PTE_W)
    } else {
        let shrink = (-n) as usize;
        let target = old_sz.saturating_sub(shrink);
        crate::vm::uvmunmap(
            myproc().pagetable(),
            crate::PGROUNDUP!(target),
            (crate::PGROUNDUP!(old_sz) - crate::PGROUNDUP!(target)) / crate::riscv::PGSIZE,
            true,
        );
        target
    };
    if n >= 0 && new_sz == 0 && old_sz != 0 {
        return u64::MAX;
    }
    myproc().set_sz(new_sz);
    old_sz as u64
}

/// This kernel has no wall clock of its own; `sleep(n)` here is the
/// scheduling primitive, not libc's — it blocks for `n` timer ticks on
/// a dedicated channel that the tick routine wakes every interrupt.
pub(crate) fn sys_sleep() -> u64 {
    let ticks = argint(0).max(0) as u32;
    crate::trap::sleep_ticks(ticks);
    0
}

pub(crate) fn sys_uptime() -> u64 {
    crate::trap::uptime() as u64
}

// --- threads (4.D.3) ----------------------------------------------------

pub(crate) fn sys_kthread_create() -> u64 {
    let start_fn = argaddr(0);
    let user_stack_bottom = argaddr(1);
    const STACK_SIZE: usize = crate::riscv::PGSIZE;
    proc::kthread_create(start_fn, user_stack_bottom, STACK_SIZE) as i64 as u64
}

pub(crate) fn sys_kthread_id() -> u64 {
    proc::kthread_id() as u64
}

pub(crate) fn sys_kthread_exit() -> u64 {
    let status = argint(0);
    proc::kthread_exit(status);
}

pub(crate) fn sys_kthread_join() -> u64 {
    let tid = argint(0);
    let addr = argaddr(1);
    let mut status = 0i32;
    let r = proc::kthread_join(tid, &mut status, false);
    if r == 0 && addr != 0 {
        let bytes = status.to_ne_bytes();
        if put_user(addr, bytes.as_ptr(), bytes.len()) < 0 {
            return u64::MAX;
        }
    }
    r as i64 as u64
}

// --- signals (4.G) --------------------------------------------------------
//
// Wire layout for `struct sigaction { u64 handler; u64 mask; }`: two
// 8-byte words so `fetchaddr`/`put_user` can move it without a packed
// repr crossing the user/kernel boundary.

fn handler_to_wire(h: Handler) -> u64 {
    match h {
        Handler::Default => 0,
        Handler::Ignore => 1,
        Handler::Kill => 2,
        Handler::Stop => 3,
        Handler::Cont => 4,
        Handler::User(addr) => addr as u64,
    }
}

fn wire_to_handler(raw: u64) -> Handler {
    match raw {
        0 => Handler::Default,
        1 => Handler::Ignore,
        2 => Handler::Kill,
        3 => Handler::Stop,
        4 => Handler::Cont,
        addr => Handler::User(addr as usize),
    }
}

pub(crate) fn sys_sigaction() -> u64 {
    let signum = argint(0);
    let new_addr = argaddr(1);
    let old_addr = argaddr(2);

    let new = if new_addr != 0 {
        let mut h = 0usize;
        let mut m = 0usize;
        if fetchaddr(new_addr, &mut h) < 0 || fetchaddr(new_addr + 8, &mut m) < 0 {
            return u64::MAX;
        }
        Some((wire_to_handler(h as u64), m as Sigset))
    } else {
        None
    };

    let mut old = (Handler::Default, 0 as Sigset);
    if signal::sigaction(myproc().signal_mut(), signum, new, &mut old).is_err() {
        return u64::MAX;
    }

    if old_addr != 0 {
        let handler_bytes = handler_to_wire(old.0).to_ne_bytes();
        let mask_bytes = (old.1 as u64).to_ne_bytes();
        if put_user(old_addr, handler_bytes.as_ptr(), 8) < 0
            || put_user(old_addr + 8, mask_bytes.as_ptr(), 8) < 0
        {
            return u64::MAX;
        }
    }
    0
}

pub(crate) fn sys_sigprocmask() -> u64 {
    let new_mask = argint(0) as u32 as Sigset;
    signal::sigprocmask(myproc().signal_mut(), new_mask) as u64
}

pub(crate) fn sys_sigret() -> u64 {
    let Some(restored) = signal::sigret(myproc().signal_mut()) else {
        return u64::MAX;
    };
    *crate::proc::mythread().trapframe() = restored;
    // The restored trapframe's a0 is the real return value for the
    // instruction sigret is resuming; `syscall()` would otherwise clobber
    // it with sigret's own result.
    crate::proc::mythread().trapframe().a0
}

// --- tracing / scheduling introspection -----------------------------------

pub(crate) fn sys_trace() -> u64 {
    let mask = argint(0) as u32;
    myproc().set_trace_mask(mask);
    0
}

pub(crate) fn sys_set_priority() -> u64 {
    let p = argint(0);
    if !(0..5).contains(&p) {
        return u64::MAX;
    }
    myproc().set_priority(p as u8);
    0
}

#[repr(C)]
struct WireStat {
    ctime: u64,
    ttime: u64,
    stime: u64,
    retime: u64,
    rutime: u64,
}

pub(crate) fn sys_wait_stat() -> u64 {
    let status_addr = argaddr(0);
    let perf_addr = argaddr(1);
    let mut status = 0i32;
    let mut perf = proc::PerfCounters::default();
    let pid = proc::wait_with_perf(&mut status, &mut perf);
    if pid < 0 {
        return u64::MAX;
    }
    if status_addr != 0 {
        let bytes = status.to_ne_bytes();
        if put_user(status_addr, bytes.as_ptr(), bytes.len()) < 0 {
            return u64::MAX;
        }
    }
    if perf_addr != 0 {
        let wire = WireStat {
            ctime: perf.ctime,
            ttime: perf.ttime,
            stime: perf.stime,
            retime: perf.retime,
            rutime: perf.rutime,
        };
        let bytes = unsafe {
            core::slice::from_raw_parts(
                &wire as *const WireStat as *const u8,
                core::mem::size_of::<WireStat>(),
            )
        };
        if put_user(perf_addr, bytes.as_ptr(), bytes.len()) < 0 {
            return u64::MAX;
        }
    }
    pid as u64
}

pub(crate) fn sys_pgfault_reset() -> u64 {
    myproc().paging_mut().take_pgfault_count() as u64
}

pub(crate) fn sys_bsem_alloc() -> u64 {
    crate::bsem::alloc() as u64
}

pub(crate) fn sys_bsem_free() -> u64 {
    let id = argint(0);
    crate::bsem::free(id);
    0
}

pub(crate) fn sys_bsem_down() -> u64 {
    let id = argint(0);
    crate::bsem::down(id);
    0
}

pub(crate) fn sys_bsem_up() -> u64 {
    let id = argint(0);
    crate::bsem::up(id);
    0
}
