//! The scheduler core: one infinite per-hart dispatch loop, plus four
//! pluggable policies selected at build time via [`param::SCHED_POLICY`].
//!
//! Three of the four policies (round-robin, SRT, CFSD) scan the table
//! every dispatch and need no state of their own beyond what `proc.rs`
//! already tracks per entity (`ThreadState`, `tau_q16`, `priority`,
//! `perf`). Only FCFS carries extra state: the ready queue in
//! `queue.rs`, fed by [`on_runnable`] from every place `proc.rs` flips a
//! thread to RUNNABLE.
//!
//! The timer-driven half of preemption lives in [`on_timer_tick`], called
//! from the trap path on every device timer interrupt: it decides,
//! per-policy, whether the hart's currently RUNNING thread has exhausted
//! its quantum and must be forced to yield. FCFS's "unbounded quantum"
//! is exactly a policy that never says yes here.

use crate::param::{self, SchedPolicy, NCPU, NTHREAD, QUANTUM};
use crate::proc::sched_support as ps;
use crate::proc::{cpuid, mycpu, Context, ProcState, ThreadState};
use crate::queue;

extern "C" {
    /// Save the caller's callee-saved registers into `old`, load `new`'s,
    /// and return into whatever `new.ra` points at. Defined in
    /// `asm/switch.S`.
    fn swtch(old: *mut Context, new: *mut Context);
}

/// Q16.16 fixed-point type for the SRT burst estimator. Avoids the
/// bit-reinterpreted-float tricks older variants of this kernel used to
/// dodge a missing FPU.
pub type Q16_16 = i64;
const Q16_ONE: Q16_16 = 1 << 16;
/// Smoothing factor for `tau' = alpha*actual + (1-alpha)*tau`.
const ALPHA: Q16_16 = Q16_ONE / 2;

/// CFSD's fixed decay table `{0.2, 0.75, 1, 1.25, 5}`, scaled by 100 to
/// stay in integer arithmetic.
const CFSD_DECAY_X100: [u64; 5] = [20, 75, 100, 125, 500];

fn encode(pslot: usize, tidx: usize) -> usize {
    pslot * NTHREAD + tidx
}

fn decode(v: usize) -> (usize, usize) {
    (v / NTHREAD, v % NTHREAD)
}

pub fn init() {
    queue::init();
}

/// Called whenever `proc.rs` transitions a thread to RUNNABLE (userinit,
/// fork, wakeup, kill). Policies that scan the table need no action;
/// FCFS enqueues so the scheduler loop can find it in arrival order.
pub fn on_runnable(pslot: usize, tidx: usize) {
    if param::SCHED_POLICY == SchedPolicy::Fcfs {
        queue::enqueue(encode(pslot, tidx));
    }
}

/// Convenience entry point for callers that want to yield without
/// reaching into `proc.rs` directly (`proc::exit`'s wait-for-siblings
/// loop).
pub fn yield_now() {
    crate::proc::yield_();
}

/// Block on `chan`, releasing `lk` for the duration, via the canonical
/// sleep/wake protocol. A thin re-export of `proc::sleep` so callers
/// that reach the scheduler's sleep primitive through `sched::` (rather
/// than by calling into `proc.rs` a second time) read the same either
/// way.
pub fn sleep_on_with(chan: usize, lk: &crate::spinlock::Spinlock) {
    crate::proc::sleep(chan, lk);
}

/// The per-thread half of a context switch: swap into the per-hart
/// scheduler context and, on the far side of some future `dispatch`,
/// swap back. Caller must hold exactly the current thread's own lock,
/// with interrupts disabled and exactly one level of `push_off` nesting,
/// and must not be in the RUNNING state (the caller sets
/// SLEEPING/RUNNABLE/ZOMBIE before calling this).
pub fn sched() {
    let (pslot, tidx) = ps::current().expect("sched: no thread dispatched on this hart");
    assert_eq!(mycpu().noff, 1, "sched: locks held != 1");
    assert!(!crate::riscv::intr_get(), "sched: interruptible");
    assert_ne!(ps::thread_state(pslot, tidx), ThreadState::Running, "sched: still running");

    let intena = mycpu().intena;
    unsafe {
        swtch(ps::context_ptr(pslot, tidx), ps::scheduler_context_ptr());
    }
    mycpu().intena = intena;
}

/// Never returns: used by `exit`/`kthread_exit` once a thread has gone
/// ZOMBIE and will never be made RUNNABLE again.
pub fn park_current_forever() -> ! {
    let (pslot, tidx) = ps::current().expect("park_current_forever: no current thread");
    ps::acquire_thread_lock(pslot, tidx);
    loop {
        sched();
    }
}

// --- per-hart dispatch loop ---------------------------------------------

/// -1 means unbounded (FCFS); otherwise ticks remaining in the current
/// dispatch's quantum, decremented by `on_timer_tick`.
static mut QUANTUM_LEFT: [i64; NCPU] = [-1; NCPU];

fn set_quantum(ticks: Option<usize>) {
    unsafe {
        QUANTUM_LEFT[cpuid()] = ticks.map(|t| t as i64).unwrap_or(-1);
    }
}

/// Walk the table once and bump the performance counter matching each
/// live entity's current state. Called once per timer tick, from
/// whichever hart takes the interrupt.
fn tick() {
    for pslot in ps::for_each_proc_slot() {
        if ps::proc_state(pslot) == ProcState::Unused {
            continue;
        }
        let perf = ps::perf_mut(pslot);
        perf.ctime += 1;
        for tidx in ps::threads_in(pslot) {
            match ps::thread_state(pslot, tidx) {
                ThreadState::Running => ps::perf_mut(pslot).rutime += 1,
                ThreadState::Runnable => ps::perf_mut(pslot).retime += 1,
                ThreadState::Sleeping => ps::perf_mut(pslot).stime += 1,
                ThreadState::Zombie => ps::perf_mut(pslot).ttime += 1,
                ThreadState::Unused => {}
            }
        }
    }
}

/// Called from the trap path on every device timer interrupt. Always
/// updates the performance counters; returns whether the hart's
/// currently dispatched thread has exhausted its quantum and must be
/// forced to yield. Under FCFS this never returns `true` — its quantum
/// is unbounded, so a dispatched thread only gives up the hart by
/// sleeping or exiting.
pub fn on_timer_tick() -> bool {
    tick();
    unsafe {
        let c = cpuid();
        if QUANTUM_LEFT[c] < 0 {
            return false;
        }
        QUANTUM_LEFT[c] -= 1;
        QUANTUM_LEFT[c] <= 0
    }
}

/// Acquire the target thread's lock, re-check it is still RUNNABLE (the
/// scan that chose it was unlocked), dispatch it for at most `quantum`
/// ticks, and return the number of ticks of actual CPU time it burned
/// this dispatch (for SRT's estimator).
fn dispatch(pslot: usize, tidx: usize, quantum: Option<usize>) -> u64 {
    ps::acquire_thread_lock(pslot, tidx);
    if ps::thread_state(pslot, tidx) != ThreadState::Runnable {
        ps::release_thread_lock(pslot, tidx);
        return 0;
    }

    ps::set_running(pslot, tidx);
    ps::set_current(pslot, tidx);
    set_quantum(quantum);

    let rutime_before = ps::perf_mut(pslot).rutime;
    unsafe {
        swtch(ps::scheduler_context_ptr(), ps::context_ptr(pslot, tidx));
    }
    ps::clear_current();

    let actual = ps::perf_mut(pslot).rutime.saturating_sub(rutime_before);
    ps::release_thread_lock(pslot, tidx);
    actual
}

fn run_round_robin() {
    for pslot in ps::for_each_proc_slot() {
        if ps::proc_state(pslot) == ProcState::Unused {
            continue;
        }
        for tidx in ps::threads_in(pslot) {
            if ps::thread_state(pslot, tidx) == ThreadState::Runnable {
                dispatch(pslot, tidx, Some(QUANTUM));
            }
        }
    }
}

fn run_fcfs() {
    let Some(encoded) = queue::dequeue() else { return };
    let (pslot, tidx) = decode(encoded);
    if ps::proc_state(pslot) == ProcState::Unused {
        return;
    }
    if ps::thread_state(pslot, tidx) != ThreadState::Runnable {
        // Stale entry: the slot was recycled or the thread moved on
        // through some other wake path before its turn came up.
        return;
    }
    dispatch(pslot, tidx, None);
    // Re-enqueue only if it's runnable again through preemption (a
    // signal-forced yield, say) rather than because it chose to sleep
    // or exit.
    if ps::thread_state(pslot, tidx) == ThreadState::Runnable {
        queue::enqueue(encoded);
    }
}

fn update_tau(pslot: usize, actual_ticks: u64) {
    let actual_q: Q16_16 = (actual_ticks as i64) << 16;
    let old = ps::tau(pslot);
    let new_tau = (ALPHA * actual_q + (Q16_ONE - ALPHA) * old) >> 16;
    ps::set_tau(pslot, new_tau);
}

fn run_srt() {
    let mut best: Option<(usize, usize, Q16_16)> = None;
    for pslot in ps::for_each_proc_slot() {
        if ps::proc_state(pslot) == ProcState::Unused {
            continue;
        }
        for tidx in ps::threads_in(pslot) {
            if ps::thread_state(pslot, tidx) != ThreadState::Runnable {
                continue;
            }
            let tau = ps::tau(pslot);
            if best.map_or(true, |(_, _, best_tau)| tau < best_tau) {
                best = Some((pslot, tidx, tau));
            }
        }
    }
    let Some((pslot, tidx, _)) = best else { return };
    let actual = dispatch(pslot, tidx, Some(QUANTUM));
    update_tau(pslot, actual);
}

fn cfsd_ratio(pslot: usize) -> u64 {
    let decay = CFSD_DECAY_X100[(ps::priority(pslot) as usize).min(CFSD_DECAY_X100.len() - 1)];
    let perf = ps::perf_mut(pslot);
    let denom = perf.rutime + perf.stime;
    if denom == 0 {
        0
    } else {
        perf.rutime * decay / denom
    }
}

fn run_cfsd() {
    let mut best: Option<(usize, usize, u64)> = None;
    for pslot in ps::for_each_proc_slot() {
        if ps::proc_state(pslot) == ProcState::Unused {
            continue;
        }
        for tidx in ps::threads_in(pslot) {
            if ps::thread_state(pslot, tidx) != ThreadState::Runnable {
                continue;
            }
            let ratio = cfsd_ratio(pslot);
            if best.map_or(true, |(_, _, best_ratio)| ratio < best_ratio) {
                best = Some((pslot, tidx, ratio));
            }
        }
    }
    let Some((pslot, tidx, _)) = best else { return };
    // `rutime`/`stime` accrue every timer tick via `tick()`; the ratio
    // is derived live from them, so there's no separate estimator state
    // to write back after the quantum ends.
    dispatch(pslot, tidx, Some(QUANTUM));
}

/// Per-hart entry point, called once from `main::kmain` per hart and
/// never returning: enable interrupts, pick one runnable entity per the
/// build's selected policy, context-switch to it, and loop.
pub fn scheduler() -> ! {
    loop {
        crate::riscv::intr_on();
        match param::SCHED_POLICY {
            SchedPolicy::RoundRobin => run_round_robin(),
            SchedPolicy::Fcfs => run_fcfs(),
            SchedPolicy::Srt => run_srt(),
            SchedPolicy::Cfsd => run_cfsd(),
        }
    }
}
