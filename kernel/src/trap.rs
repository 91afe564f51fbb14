//! Trap glue (4.H): the single entry the trampoline drains every user trap
//! into, plus the kernel-trap path for traps that arrive while already in
//! supervisor mode. Dispatches on trap cause — syscall, device IRQ, page
//! fault, other fault — and drives both preemption (timer ticks call
//! `yield`) and signal delivery (the trap-return path runs the two-phase
//! pipeline in `signal.rs` before handing control back to user mode).

use crate::memlayout::TRAMPOLINE;
use crate::param::NTHREAD;
use crate::proc::{self, myproc, mythread};
use crate::riscv::{
    intr_get, intr_off, intr_on, r_satp, r_scause, r_sepc, r_sstatus, r_stval, r_tp, PageTable,
    PGSIZE, SSTATUS_SPIE, SSTATUS_SPP, w_sepc, w_sstatus, w_stvec,
};
use crate::signal::SpecialOutcome;
use crate::spinlock::Spinlock;
use crate::MAKE_SATP;

extern "C" {
    // in kernelvec.S, calls kerneltrap().
    static kernelvec: u8;
    static trampoline: u8;
    static uservec: u8;
    static userret: u8;
}

static mut TICKS_LOCK: Option<Spinlock> = None;
static mut TICKS: u32 = 0;

pub fn trapinit() {
    unsafe {
        TICKS_LOCK = Some(Spinlock::init_lock("time"));
    }
}

fn ticks_lock() -> &'static Spinlock {
    unsafe { (*core::ptr::addr_of!(TICKS_LOCK)).as_ref().expect("trapinit not called") }
}

/// Set up to take exceptions and traps while in the kernel.
pub fn trapinithart() {
    w_stvec((unsafe { &kernelvec } as *const u8).expose_addr());
}

/// `uptime()` syscall: ticks since boot.
pub fn uptime() -> u32 {
    ticks_lock().acquire();
    let t = unsafe { TICKS };
    ticks_lock().release();
    t
}

/// `sleep(n)` syscall: block the calling thread for `n` timer ticks on the
/// shared tick channel, which every timer interrupt wakes.
pub fn sleep_ticks(n: u32) {
    ticks_lock().acquire();
    let start = unsafe { TICKS };
    while unsafe { TICKS } - start < n {
        if mythread().is_killed() {
            ticks_lock().release();
            return;
        }
        proc::sleep(tick_chan(), ticks_lock());
    }
    ticks_lock().release();
}

fn tick_chan() -> usize {
    (unsafe { core::ptr::addr_of!(TICKS) }) as usize
}

/// Advance the shared clock and wake everyone sleeping on it. Called once
/// per timer interrupt, only by the hart that takes it (the other harts'
/// timer interrupts still drive `sched::on_timer_tick`'s per-hart quantum
/// accounting, but only one clock needs incrementing globally).
fn clockintr() {
    ticks_lock().acquire();
    unsafe { TICKS += 1 };
    ticks_lock().release();
    proc::wakeup(tick_chan());
}

/// Check for a supervisor external interrupt (routed through the PLIC) or
/// a software interrupt forwarded from the machine-mode timer handler.
/// Returns 2 for a timer interrupt, 1 for any other recognised device
/// interrupt, 0 if `scause` wasn't an interrupt this trap path handles.
fn devintr() -> i32 {
    let scause = r_scause();

    if scause & 0x8000000000000000 != 0 && (scause & 0xff) == 9 {
        let irq = crate::plic::plic_claim();
        if irq as usize == crate::memlayout::UART0_IRQ {
            crate::uart::uartintr();
        } else if irq as usize == crate::memlayout::VIRTIO0_IRQ {
            // The block/inode/file layer is an external collaborator;
            // this core only owns acking the IRQ, not completing the
            // in-flight disk request.
        } else if irq > 0 {
            crate::printf!("unexpected interrupt irq={}\n", irq);
        }
        if irq > 0 {
            crate::plic::plic_complete(irq);
        }
        1
    } else if scause == 0x8000000000000001 {
        if crate::proc::cpuid() == 0 {
            clockintr();
        }
        // Acknowledge the software interrupt by clearing SSIP.
        crate::riscv::w_sip(crate::riscv::r_sip() & !2);
        2
    } else {
        0
    }
}

/// Drain pending signals on the trap-return path: run the fixed-point
/// "handle specials" pass (freezing/killing/continuing as needed, yielding
/// and re-looping while frozen), then inject at most one custom handler.
/// Runs under the process lock the whole time signal state is touched, as
/// the delivery pipeline in `signal.rs` requires.
fn deliver_signals() {
    let p = myproc();
    loop {
        p.lock.acquire();
        let outcome = crate::signal::handle_specials(p.signal_mut());
        p.lock.release();
        match outcome {
            SpecialOutcome::Settled => break,
            SpecialOutcome::Killed => {
                proc::exit(-1);
            }
            SpecialOutcome::Frozen => {
                proc::yield_();
            }
        }
    }

    p.lock.acquire();
    if let Some(injection) = crate::signal::find_custom_handler(p.signal_mut()) {
        inject_custom_handler(p, &injection);
    }
    p.lock.release();
}

const STUB_LEN: usize = 8;
/// `li a7, SYS_sigret; ecall`, with `SYS_sigret`'s value baked in (see
/// `syscall::SYS_sigret`). Must never drift from that constant.
const SIGRET_STUB: [u8; STUB_LEN] = {
    let sys_sigret = crate::syscall::SYS_sigret as u32;
    let li = 0x00000893u32 | (sys_sigret << 20); // li a7, imm  (addi a7, x0, imm)
    let ecall = 0x00000073u32;
    let li_bytes = li.to_le_bytes();
    let ecall_bytes = ecall.to_le_bytes();
    [
        li_bytes[0], li_bytes[1], li_bytes[2], li_bytes[3],
        ecall_bytes[0], ecall_bytes[1], ecall_bytes[2], ecall_bytes[3],
    ]
};

/// Push the handler stub onto the user stack, back up the live trapframe,
/// and reroute the user PC/SP/A0 so the handler runs next and returns
/// through the stub's `sigret` call.
fn inject_custom_handler(p: &mut crate::proc::Proc, injection: &crate::signal::Injection) {
    let live = *mythread().trapframe();
    let sp = (live.sp as usize).saturating_sub(STUB_LEN);
    if crate::vm::copyout(p.pagetable(), sp, SIGRET_STUB.as_ptr(), STUB_LEN) != 0 {
        // Can't write the stub: drop the handler rather than corrupt the
        // stack. The signal was already cleared from pending by
        // `find_custom_handler`.
        return;
    }
    crate::signal::begin_custom_handler(p.signal_mut(), live, injection);
    let tf = mythread().trapframe();
    tf.sp = sp as u64;
    tf.ra = sp as u64;
    tf.epc = injection.entry as u64;
    tf.a0 = injection.signum as u64;
}

/// Handle an interrupt, exception, or system call from user space. Called
/// from `uservec` in trampoline.S with the trapframe already populated and
/// the trap vector still pointing at `usertrap` itself (so a nested trap
/// here would misbehave — the very first thing done is redirecting to
/// `kerneltrap` for the duration).
fn usertrap() {
    if r_sstatus() & SSTATUS_SPP != 0 {
        panic!("usertrap: not from user mode");
    }
    w_stvec((unsafe { &kernelvec } as *const u8).expose_addr());

    mythread().trapframe().epc = r_sepc() as u64;

    let scause = r_scause();
    if scause == 8 {
        // Environment call from U-mode: a syscall.
        if mythread().is_killed() {
            // A sibling's teardown (exit's kill loop, or exec's collapse)
            // marked only this thread, not the whole process: drain
            // through the alive-count protocol rather than re-entering
            // exit() and livelocking against whichever thread is already
            // waiting on us there.
            proc::kthread_exit(-1);
        }
        // sepc points at the ecall instruction; resume at the next one.
        mythread().trapframe().epc += 4;
        intr_on();
        crate::syscall::syscall();
    } else {
        let which_dev = devintr();
        if which_dev == 0 {
            if is_page_fault(scause) {
                handle_page_fault_trap();
            } else {
                crate::printf!(
                    "usertrap(): unexpected scause {:#x} pid={}\n\tsepc={:#x} stval={:#x}\n",
                    scause,
                    myproc().pid(),
                    r_sepc(),
                    r_stval()
                );
                mark_killed();
            }
        } else if which_dev == 2 {
            if proc::sched_support::current().is_some() {
                if crate::sched::on_timer_tick() {
                    proc::yield_();
                }
            }
        }
    }

    if mythread().is_killed() {
        // Same sibling-teardown case as the syscall path above.
        proc::kthread_exit(-1);
    }

    deliver_signals();
    usertrapret();
}

/// Store-AMO (15) and load (13) page faults are the two `scause` values
/// this kernel's swap-backed demand mechanism can legitimately service;
/// anything else with a faulting stval is a real fault, not ours.
fn is_page_fault(scause: u64) -> bool {
    scause == 13 || scause == 15
}

fn handle_page_fault_trap() {
    let va = r_stval() as usize;
    let p = myproc();
    let pagetable = p.pagetable_ptr();
    let mut space = crate::vm::KernelAddressSpace::new(unsafe { &mut *pagetable });
    let result = p.paging_mut().handle_page_fault(&mut space, va);
    if result.is_err() {
        mark_killed();
    }
}

fn mark_killed() {
    let p = myproc();
    p.lock.acquire();
    proc::set_killed_locked(p);
    p.lock.release();
}

/// Return to user space: point the trap vector at `uservec`, stash the
/// values `uservec` will need on the *next* trap into the trapframe, and
/// tail-call the trampoline's `userret`.
pub fn usertrapret() {
    let p = myproc();

    intr_off();

    let uservec_addr = (unsafe { &uservec } as *const u8).expose_addr();
    let trampoline_addr = (unsafe { &trampoline } as *const u8).expose_addr();
    let trampoline_uservec = TRAMPOLINE + uservec_addr - trampoline_addr;
    w_stvec(trampoline_uservec);

    let (pslot, tidx) = proc::sched_support::current().expect("usertrapret: no thread dispatched");
    let t = mythread();
    let trapframe = t.trapframe();
    trapframe.kernel_satp = r_satp() as u64;
    trapframe.kernel_sp = (t_kstack(pslot, tidx) + PGSIZE) as u64;
    trapframe.kernel_trap = usertrap as usize as u64;
    trapframe.kernel_hartid = r_tp();

    let mut x = r_sstatus();
    x &= !SSTATUS_SPP;
    x |= SSTATUS_SPIE;
    w_sstatus(x);

    w_sepc(trapframe.epc as usize);

    trap_to_user();
}

/// Re-reads the kernel stack address for `(pslot, tidx)` through
/// `proc.rs`'s own bookkeeping rather than caching it here, since a
/// non-thread-0 kernel stack is allocated at `kthread_create` time, not
/// fixed at boot.
fn t_kstack(pslot: usize, tidx: usize) -> usize {
    crate::proc::kstack_of(pslot, tidx)
}

/// Tail-call the trampoline's `userret` with the calling process's SATP.
/// Never returns: control passes to user mode via `sret`.
fn trap_to_user() -> ! {
    let p = myproc();
    let trampoline_addr = (unsafe { &trampoline } as *const u8).expose_addr();
    let userret_addr = (unsafe { &userret } as *const u8).expose_addr();
    let trampoline_userret = TRAMPOLINE + userret_addr - trampoline_addr;
    let satp = MAKE_SATP!((p.pagetable_ptr() as *const PageTable).expose_addr());
    unsafe {
        let func = *(trampoline_userret as *const fn(satp: usize) -> !);
        func(satp);
    }
}

/// Interrupts and exceptions taken while already in supervisor mode land
/// here via `kernelvec`, on whatever the current kernel stack is. The only
/// suspension this path ever performs is a timer-driven `yield`, and only
/// when the hart's current thread was actually `RUNNING` (a trap while
/// idling in the scheduler loop itself must not try to yield a thread that
/// doesn't exist).
#[no_mangle]
pub extern "C" fn kerneltrap() {
    let sepc = r_sepc();
    let sstatus = r_sstatus();
    let scause = r_scause();

    if sstatus & SSTATUS_SPP == 0 {
        panic!("kerneltrap: not from supervisor mode");
    }
    if intr_get() {
        panic!("kerneltrap: interrupts enabled");
    }

    let which_dev = devintr();
    if which_dev == 0 {
        crate::printf!("scause {:#x}\nsepc={:#x} stval={:#x}\n", scause, r_sepc(), r_stval());
        panic!("kerneltrap");
    }

    if which_dev == 2 {
        if let Some((pslot, tidx)) = proc::sched_support::current() {
            if proc::sched_support::thread_state(pslot, tidx) == proc::ThreadState::Running
                && crate::sched::on_timer_tick()
            {
                proc::yield_();
            }
        }
    }

    // `yield_`'s `sched()` may have taken further traps on its way back
    // here; restore the registers `kernelvec.S`'s final `sret` needs.
    w_sepc(sepc);
    w_sstatus(sstatus);
}

/// Entry point for a freshly created non-zero thread's first dispatch
/// (`kthread_create`'s `context.ra`). Thread 0 lands in `forkret` instead,
/// since it additionally forwards through `usertrapret` on the process's
/// very first return to user mode; any later thread's trapframe was
/// already seeded from the caller's live one, so it can go straight to
/// the common return path.
pub extern "C" fn thread_trampoline() -> ! {
    mythread().lock.release();
    usertrapret();
    trap_to_user();
}

#[allow(dead_code)]
const fn assert_nthread_fits_trampoline() {
    // Sanity check mirrored from `memlayout::TRAPFRAME!`: the per-thread
    // trapframe region must actually fit below the kernel-stack region.
    assert!(NTHREAD > 0);
}
