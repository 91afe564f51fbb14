//! The process/thread table: allocation, fork/exec/exit/wait, the
//! kthread lifecycle, and the sleep/wake/yield primitives that everything
//! else in this crate suspends through.
//!
//! Two nested locks guard an entity: a process's own lock covers its
//! process-wide fields (state, pid, signal state, paging metadata), and
//! each of its threads carries its own lock for thread-local fields
//! (state, trapframe, context, sleep channel). The process lock is
//! always taken before any of its thread locks; the wait-lock, when
//! needed at all (reparenting, exit, wait), is taken before any process
//! lock.

use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::kalloc::KMEM;
use crate::memlayout::TRAMPOLINE;
use crate::paging::PagingState;
use crate::param::{NCPU, NOFILE, NPROC, NTHREAD};
use crate::queue;
use crate::riscv::{intr_get, intr_on, r_tp, PageTable, PGSIZE, PTE_R, PTE_W, PTE_X};
use crate::sched;
use crate::signal::{self, SignalState};
use crate::spinlock::{pop_off, push_off, Spinlock};
use crate::vm::{copyin, copyout, kvmmap, mappages, trampoline, uvmcreate, uvmfirst, uvmfree, uvmunmap};

/// Saved callee-saved registers for a kernel context switch.
#[derive(Copy, Clone, Default)]
pub struct Context {
    pub ra: u64,
    pub sp: u64,
    pub s0: u64,
    pub s1: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
}

/// Per-process data for the trampoline's trap entry/exit. One physical
/// page holds `NTHREAD` of these, one per thread slot, mapped at a fixed
/// address just below the trampoline page.
#[derive(Copy, Clone, Default)]
#[repr(C)]
pub struct Trapframe {
    pub kernel_satp: u64,
    pub kernel_sp: u64,
    pub kernel_trap: u64,
    pub epc: u64,
    pub kernel_hartid: u64,
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

impl Trapframe {
    pub const fn zeroed() -> Self {
        Trapframe {
            kernel_satp: 0, kernel_sp: 0, kernel_trap: 0, epc: 0, kernel_hartid: 0,
            ra: 0, sp: 0, gp: 0, tp: 0, t0: 0, t1: 0, t2: 0, s0: 0, s1: 0,
            a0: 0, a1: 0, a2: 0, a3: 0, a4: 0, a5: 0, a6: 0, a7: 0,
            s2: 0, s3: 0, s4: 0, s5: 0, s6: 0, s7: 0, s8: 0, s9: 0, s10: 0, s11: 0,
            t3: 0, t4: 0, t5: 0, t6: 0,
        }
    }
}

/// Per-hart record: the thread it is currently dispatching (by slot
/// indices), its scheduler context, and the interrupt-disable nesting
/// state that `push_off`/`pop_off` maintain.
pub struct Cpu {
    current: Option<(usize, usize)>, // (proc slot, thread slot)
    scheduler_context: Context,
    pub noff: i32,
    pub intena: bool,
}

impl Cpu {
    const fn new() -> Self {
        Cpu {
            current: None,
            scheduler_context: Context {
                ra: 0, sp: 0, s0: 0, s1: 0, s2: 0, s3: 0, s4: 0, s5: 0,
                s6: 0, s7: 0, s8: 0, s9: 0, s10: 0, s11: 0,
            },
            noff: 0,
            intena: false,
        }
    }
}

static mut CPUS: [Cpu; NCPU] = [const { Cpu::new() }; NCPU];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Used,
    Schedulable,
    Zombie,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Performance counters, walked and updated once per tick by
/// `sched::tick`.
#[derive(Clone, Copy, Default)]
pub struct PerfCounters {
    pub ctime: u64,
    pub ttime: u64,
    pub stime: u64,
    pub retime: u64,
    pub rutime: u64,
}

pub struct Thread {
    pub lock: Spinlock,
    state: ThreadState,
    /// Monotonic within the owning process; doubles as the generation
    /// check a joiner uses to detect recycling (the Design Notes'
    /// slot+generation handle, here folded into the tid itself).
    tid: i32,
    chan: Option<usize>,
    killed: bool,
    xstate: i32,
    waiters: u32,
    kstack: usize,
    trapframe: usize, // kernel-side address of this thread's Trapframe page, 0 if none
    context: Context,
    name: [u8; 16],
}

impl Thread {
    const fn new() -> Self {
        Thread {
            lock: Spinlock::init_lock("thread"),
            state: ThreadState::Unused,
            tid: 0,
            chan: None,
            killed: false,
            xstate: 0,
            waiters: 0,
            kstack: 0,
            trapframe: 0,
            context: Context {
                ra: 0, sp: 0, s0: 0, s1: 0, s2: 0, s3: 0, s4: 0, s5: 0,
                s6: 0, s7: 0, s8: 0, s9: 0, s10: 0, s11: 0,
            },
            name: [0; 16],
        }
    }

    pub fn trapframe(&self) -> &mut Trapframe {
        unsafe { &mut *(self.trapframe as *mut Trapframe) }
    }

    pub fn kstack(&self) -> usize {
        self.kstack
    }

    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Reset every field but `lock` to its `Unused` defaults. Used when
    /// the owning process still has other live threads (so the process
    /// itself isn't being torn down) and only this slot is being
    /// recycled: unlike `freeproc`'s wholesale `*t = Thread::new()`, this
    /// leaves the lock the caller is still holding intact so it can be
    /// released normally afterwards.
    fn recycle(&mut self) {
        self.state = ThreadState::Unused;
        self.tid = 0;
        self.chan = None;
        self.killed = false;
        self.xstate = 0;
        self.waiters = 0;
        self.kstack = 0;
        self.trapframe = 0;
        self.context = Context::default();
        self.name = [0; 16];
    }
}

pub struct Proc {
    pub lock: Spinlock,
    state: ProcState,
    pid: u32,
    parent: Option<usize>, // slot index, protected by WAIT_LOCK
    sz: usize,
    pagetable: Option<*mut PageTable>,
    ofile: [bool; NOFILE], // placeholder open-file table (file layer out of scope)
    cwd: bool,
    name: [u8; 16],
    killed: bool,
    xstate: i32,
    exempt: bool, // init and the shell bypass paging
    threads: [Thread; NTHREAD],
    alive: u32,
    signal: SignalState,
    paging: PagingState,
    perf: PerfCounters,
    priority: u8,     // CFSD: 0..4
    tau_q16: i64,     // SRT: Q16.16 smoothed burst estimate
    trace_mask: u32,  // bit i set => log syscall number i for this process
}

impl Proc {
    const fn new() -> Self {
        Proc {
            lock: Spinlock::init_lock("proc"),
            state: ProcState::Unused,
            pid: 0,
            parent: None,
            sz: 0,
            pagetable: None,
            ofile: [false; NOFILE],
            cwd: false,
            name: [0; 16],
            killed: false,
            xstate: 0,
            exempt: false,
            threads: [const { Thread::new() }; NTHREAD],
            alive: 0,
            signal: SignalState::new(),
            paging: PagingState::new(),
            perf: PerfCounters { ctime: 0, ttime: 0, stime: 0, retime: 0, rutime: 0 },
            priority: 2,
            tau_q16: 0,
            trace_mask: 0,
        }
    }

    pub fn is_schedulable(&self) -> bool {
        self.threads.iter().any(|t| t.state == ThreadState::Runnable || t.state == ThreadState::Running)
    }

    pub fn perf(&self) -> PerfCounters {
        self.perf
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, p: u8) {
        self.priority = p.min(4);
    }

    pub fn tau(&self) -> i64 {
        self.tau_q16
    }

    pub fn set_tau(&mut self, tau: i64) {
        self.tau_q16 = tau;
    }

    pub fn paging_mut(&mut self) -> &mut PagingState {
        &mut self.paging
    }

    pub fn signal_mut(&mut self) -> &mut SignalState {
        &mut self.signal
    }

    pub fn trace_mask(&self) -> u32 {
        self.trace_mask
    }

    pub fn set_trace_mask(&mut self, mask: u32) {
        self.trace_mask = mask;
    }

    pub fn sz(&self) -> usize {
        self.sz
    }

    pub fn set_sz(&mut self, sz: usize) {
        self.sz = sz;
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_exempt(&self) -> bool {
        self.exempt
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    pub fn pagetable(&mut self) -> &mut PageTable {
        unsafe { &mut *self.pagetable.expect("pagetable: process has no address space") }
    }

    pub fn pagetable_ptr(&self) -> *mut PageTable {
        self.pagetable.expect("pagetable_ptr: process has no address space")
    }

    /// Swap in a freshly built page table (exec's "commit to the new
    /// image" step), returning the old one so the caller can free it
    /// once it has stopped using it (e.g. after copying argv onto the
    /// new stack).
    pub fn replace_pagetable(&mut self, new: *mut PageTable) -> *mut PageTable {
        self.pagetable.replace(new).expect("replace_pagetable: process has no address space")
    }
}

/// Set a process's debug name (exec, after committing to a new image).
pub(crate) fn set_name(p: &mut Proc, name: [u8; 16]) {
    p.name = name;
}

/// Allocate a fresh user page table for `p` (trampoline + the calling
/// thread's trapframe mapped at their fixed addresses). Exposed for
/// `exec`, which builds the new image's address space before committing
/// to it; the trapframe page itself is the calling thread's existing
/// one (exec never creates a new thread, it replaces the image under
/// the one thread that survived `collapse`).
pub(crate) fn alloc_user_pagetable(p: &Proc) -> Option<*mut PageTable> {
    let pslot = slot_of(p);
    let (_, tidx) = mythread_slot();
    let trapframe_page = p.threads[tidx].trapframe;
    proc_pagetable(pslot, tidx, trapframe_page)
}

/// Tear down a page table built by `alloc_user_pagetable`, or a
/// process's own on exec-replace: `pslot`/`tidx` identify the thread
/// whose trapframe is mapped in it, so that mapping can be dropped
/// without freeing the physical page (it is either still in use by the
/// live address space, on the success path, or about to be, on the
/// `goto_bad` path). `sz` bounds the user mappings below `TRAMPOLINE` to
/// unmap and free.
pub(crate) fn free_user_pagetable(pagetable: &mut PageTable, sz: usize, pslot: usize, tidx: usize) {
    uvmunmap(pagetable, crate::TRAPFRAME!(pslot, tidx), 1, false);
    proc_freepagetable(pagetable, sz)
}

static mut PROCS: [Proc; NPROC] = [const { Proc::new() }; NPROC];
static mut INIT_PROC_SLOT: Option<usize> = None;

static NEXT_PID: AtomicU32 = AtomicU32::new(1);

/// Must be acquired before any process lock; serialises exit/reparent
/// and every read of `Proc::parent`.
pub static WAIT_LOCK: Spinlock = Spinlock::init_lock("wait_lock");

fn procs() -> &'static mut [Proc; NPROC] {
    unsafe { &mut *core::ptr::addr_of_mut!(PROCS) }
}

/// Must be called with interrupts disabled, to avoid a race with this
/// thread being migrated to a different hart mid-read.
pub fn cpuid() -> usize {
    r_tp() as usize
}

pub fn mycpu() -> &'static mut Cpu {
    unsafe { &mut (*core::ptr::addr_of_mut!(CPUS))[cpuid()] }
}

/// The running thread's owning process, or panics if called off a
/// dispatch context (every in-kernel call site runs on behalf of some
/// thread).
pub fn myproc() -> &'static mut Proc {
    push_off();
    let (p, _) = mycpu().current.expect("myproc: no thread dispatched on this hart");
    pop_off();
    &mut procs()[p]
}

fn mythread_slot() -> (usize, usize) {
    push_off();
    let cur = mycpu().current.expect("mythread: no thread dispatched on this hart");
    pop_off();
    cur
}

pub fn mythread() -> &'static mut Thread {
    let (p, t) = mythread_slot();
    &mut procs()[p].threads[t]
}

fn allocpid() -> u32 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// Pack a debug name into the fixed-size field, truncating anything
/// over 15 bytes and leaving the rest nul-padded.
fn pack_name(src: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = src.as_bytes();
    let n = bytes.len().min(out.len());
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

pub fn procinit() {
    // Tables are already UNUSED/zeroed from their const initialisers.
}

/// A user program that calls exec("/init"), assembled ahead of time.
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02,
    0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02,
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00,
    0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00,
    0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69, 0x6e, 0x69,
    0x74, 0x00, 0x00, 0x24, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Set up the first user process. Exempt: init bypasses paging entirely.
pub fn userinit() {
    let slot = allocproc().expect("userinit: process table exhausted");
    unsafe { INIT_PROC_SLOT = Some(slot); }
    let p = &mut procs()[slot];
    p.exempt = true;
    p.paging.reset(true);

    let pagetable = unsafe { &mut *p.pagetable.unwrap() };
    uvmfirst(pagetable, &INITCODE as *const u8, mem::size_of_val(&INITCODE));
    p.sz = PGSIZE;

    let t = &mut p.threads[0];
    let tf = t.trapframe();
    tf.epc = 0;
    tf.sp = PGSIZE as u64;

    p.name = pack_name("initcode");
    t.name = pack_name("initcode");
    t.state = ThreadState::Runnable;
    p.state = ProcState::Schedulable;

    sched::on_runnable(slot, 0);
    p.lock.release();
}

/// A fork child's first scheduling lands here via the switch primitive.
/// `sched::dispatch` acquired this thread's own lock before the `swtch`
/// that landed us here; nothing will release it on our behalf, since
/// there is no enclosing `sched()` call frame to unwind into.
pub extern "C" fn forkret() {
    mythread().lock.release();
    crate::trap::usertrapret();
}

/// Scan the table for an UNUSED process slot and bring up its thread 0.
/// Returns the slot with its process lock held; rewinds and returns
/// `None` on any partial failure.
fn allocproc() -> Option<usize> {
    let mut found = None;
    for i in 0..NPROC {
        let p = &mut procs()[i];
        p.lock.acquire();
        if p.state == ProcState::Unused {
            found = Some(i);
            break;
        }
        p.lock.release();
    }
    let slot = found?;
    let p = &mut procs()[slot];
    p.pid = allocpid();
    p.state = ProcState::Used;
    p.alive = 1;
    p.signal.reset();
    p.paging.reset(false);
    p.perf = PerfCounters::default();
    p.priority = 2;
    p.tau_q16 = 0;

    let trapframe_page = unsafe { KMEM.kalloc() };
    if trapframe_page.is_null() {
        p.state = ProcState::Unused;
        p.lock.release();
        return None;
    }

    let pagetable = proc_pagetable(slot, 0, trapframe_page as usize);
    if pagetable.is_none() {
        unsafe { KMEM.kfree(trapframe_page) };
        p.state = ProcState::Unused;
        p.lock.release();
        return None;
    }
    p.pagetable = pagetable;

    let t0 = &mut p.threads[0];
    t0.state = ThreadState::Used;
    t0.tid = 1;
    t0.trapframe = trapframe_page as usize;
    t0.kstack = crate::KSTACK!(slot);
    t0.context = Context::default();
    t0.context.ra = forkret as usize as u64;
    t0.context.sp = (t0.kstack + PGSIZE) as u64;

    Some(slot)
}

/// Free every resource hanging off a process slot. Process lock must be
/// held; the slot's threads must already be UNUSED.
fn freeproc(p: &mut Proc) {
    let slot = slot_of(p);
    if let Some(pt) = p.pagetable.take() {
        let pagetable = unsafe { &mut *pt };
        // Every thread slot still carrying a trapframe has its own
        // physical page and its own mapping to tear down; `exit`'s
        // sibling-kill loop never reaps them (nobody joins a process
        // that's exiting), so this is the only place that does.
        for (i, t) in p.threads.iter().enumerate() {
            if t.trapframe != 0 {
                uvmunmap(pagetable, crate::TRAPFRAME!(slot, i), 1, false);
                unsafe { KMEM.kfree(t.trapframe as *mut u8) };
            }
            if i != 0 && t.kstack != 0 {
                unsafe { KMEM.kfree(t.kstack as *mut u8) };
            }
        }
        proc_freepagetable(pagetable, p.sz);
    }
    for t in p.threads.iter_mut() {
        *t = Thread::new();
    }
    p.sz = 0;
    p.pid = 0;
    p.parent = None;
    p.name = [0; 16];
    p.killed = false;
    p.xstate = 0;
    p.exempt = false;
    p.alive = 0;
    p.signal.reset();
    p.paging.truncate();
    p.priority = 2;
    p.tau_q16 = 0;
    p.trace_mask = 0;
    p.state = ProcState::Unused;
}

fn proc_pagetable(pslot: usize, tidx: usize, trapframe_page: usize) -> Option<*mut PageTable> {
    let pagetable = uvmcreate()?;
    let trampoline_addr = (unsafe { &trampoline } as *const u8).expose_addr();
    if mappages(pagetable, TRAMPOLINE, trampoline_addr, PGSIZE, PTE_R | PTE_X) != 0 {
        uvmfree(pagetable, 0);
        return None;
    }
    if mappages(pagetable, crate::TRAPFRAME!(pslot, tidx), trapframe_page, PGSIZE, PTE_R | PTE_W) != 0 {
        uvmunmap(pagetable, TRAMPOLINE, 1, false);
        uvmfree(pagetable, 0);
        return None;
    }
    Some(pagetable)
}

fn proc_freepagetable(pagetable: &mut PageTable, sz: usize) {
    uvmunmap(pagetable, TRAMPOLINE, 1, false);
    // A non-exempt process can have swapped-out holes anywhere below
    // `sz`; the plain uvmfree's uvmunmap requires every page resident.
    crate::vm::uvmfree_paged(pagetable, sz);
}

/// Allocate a child, duplicate the parent's address space and signal
/// configuration, and flip it schedulable. Thread 0 only: extra threads
/// of a threaded parent are not cloned (matches the source: fork clones
/// the calling thread's trapframe into the child's thread 0).
pub fn fork() -> i32 {
    let parent = myproc();
    let Some(child_slot) = allocproc() else { return -1 };
    let child = &mut procs()[child_slot];

    // User memory + paging metadata (including swap-file contents).
    if crate::vm::uvmcopy_hook(parent, child).is_err() {
        freeproc(child);
        child.lock.release();
        return -1;
    }
    child.sz = parent.sz;

    *child.threads[0].trapframe() = *mythread().trapframe();
    child.threads[0].trapframe().a0 = 0;

    child.ofile = parent.ofile;
    child.cwd = parent.cwd;
    child.name = parent.name;
    child.signal.inherit_from(&parent.signal);
    child.priority = parent.priority;
    child.tau_q16 = parent.tau_q16;
    child.trace_mask = parent.trace_mask;
    child.exempt = false;

    let pid = child.pid;
    WAIT_LOCK.acquire();
    child.parent = Some(slot_of(parent));
    WAIT_LOCK.release();

    child.threads[0].state = ThreadState::Runnable;
    child.state = ProcState::Schedulable;
    sched::on_runnable(child_slot, 0);
    child.lock.release();

    pid as i32
}

fn slot_of(p: &Proc) -> usize {
    let base = procs().as_ptr() as usize;
    (p as *const Proc as usize - base) / mem::size_of::<Proc>()
}

/// Reparent every child of `slot` to init. Caller must hold `WAIT_LOCK`.
fn reparent(slot: usize) {
    let init_slot = unsafe { INIT_PROC_SLOT }.expect("reparent: no init process");
    for i in 0..NPROC {
        if i == slot {
            continue;
        }
        let p = &mut procs()[i];
        if p.parent == Some(slot) {
            p.parent = Some(init_slot);
            wakeup(init_slot);
        }
    }
}

/// First-call semantics: stash the exit status, kill every sibling
/// thread, and once this is the last live thread, run the core exit
/// path (reparent, wake parent, go ZOMBIE).
pub fn exit(status: i32) -> ! {
    let slot = slot_of(myproc());
    {
        let p = &mut procs()[slot];
        p.lock.acquire();
        p.killed = true;
        p.xstate = status;
        p.lock.release();
    }

    let (_, my_tidx) = mythread_slot();
    loop {
        let p = &mut procs()[slot];
        let mut others_alive = false;
        for (i, t) in p.threads.iter_mut().enumerate() {
            if i == my_tidx {
                continue;
            }
            t.lock.acquire();
            if t.state != ThreadState::Unused && t.state != ThreadState::Zombie {
                t.killed = true;
                if t.state == ThreadState::Sleeping {
                    t.state = ThreadState::Runnable;
                    sched::on_runnable(slot, i);
                }
                others_alive = true;
            }
            t.lock.release();
        }
        if !others_alive {
            break;
        }
        sched::yield_now();
    }

    exit_core(slot, status);
}

/// `kthread_exit`'s path when it is the last living thread, and `exit`'s
/// terminal step: detach from the process table, reparent children, wake
/// the parent, and park as ZOMBIE.
fn exit_core(slot: usize, status: i32) -> ! {
    WAIT_LOCK.acquire();
    reparent(slot);
    let p = &mut procs()[slot];
    let parent = p.parent;
    WAIT_LOCK.release();

    if let Some(parent_slot) = parent {
        wakeup(parent_slot);
    }

    let p = &mut procs()[slot];
    p.lock.acquire();
    p.xstate = status;
    p.state = ProcState::Zombie;
    for t in p.threads.iter_mut() {
        if t.state != ThreadState::Unused {
            t.state = ThreadState::Zombie;
        }
    }
    p.lock.release();

    sched::park_current_forever();
}

/// Scan for a ZOMBIE child, copy out its status, and free its slot.
/// Sleeps on the caller's own slot address (under `WAIT_LOCK`) and
/// re-scans on wake if no zombie child is found yet.
pub fn wait(status_out: &mut i32) -> i32 {
    wait_inner(status_out, None)
}

/// Same as `wait`, but also copies out the reaped child's performance
/// counters before its slot is freed and zeroed.
pub fn wait_with_perf(status_out: &mut i32, perf_out: &mut PerfCounters) -> i32 {
    wait_inner(status_out, Some(perf_out))
}

fn wait_inner(status_out: &mut i32, perf_out: Option<&mut PerfCounters>) -> i32 {
    let my_slot = slot_of(myproc());
    let mut perf_out = perf_out;
    loop {
        WAIT_LOCK.acquire();
        let mut have_child = false;
        for i in 0..NPROC {
            let p = &mut procs()[i];
            if p.parent != Some(my_slot) {
                continue;
            }
            have_child = true;
            p.lock.acquire();
            if p.state == ProcState::Zombie {
                *status_out = p.xstate;
                if let Some(out) = perf_out.as_deref_mut() {
                    *out = p.perf;
                }
                let pid = p.pid;
                freeproc(p);
                p.lock.release();
                WAIT_LOCK.release();
                return pid as i32;
            }
            p.lock.release();
        }
        if !have_child || procs()[my_slot].killed {
            WAIT_LOCK.release();
            return -1;
        }
        sched::sleep_on_with(my_slot, &WAIT_LOCK);
        WAIT_LOCK.release();
    }
}

/// Force a process into the killed state outside the signal pipeline —
/// used by the trap path for faults that must terminate the process
/// unconditionally (unrecognised trap cause, unserviceable page fault).
/// Caller must hold `p.lock`.
pub fn set_killed_locked(p: &mut Proc) {
    p.killed = true;
}

/// Kernel-side address of thread `tidx`'s stack within process slot
/// `pslot`, for the trap path's `kernel_sp` handoff. Valid once the
/// thread has been allocated (`allocproc`/`kthread_create`), 0 before.
pub fn kstack_of(pslot: usize, tidx: usize) -> usize {
    procs()[pslot].threads[tidx].kstack()
}

/// `kill(pid, signum)`: OR the pending bit into the target's signal
/// state under its process lock.
pub fn kill(pid: u32, signum: i32) -> i32 {
    for i in 0..NPROC {
        let p = &mut procs()[i];
        p.lock.acquire();
        if p.pid == pid && p.state != ProcState::Unused {
            let ok = signal::raise(&mut p.signal, signum).is_ok();
            if ok {
                for (ti, t) in p.threads.iter_mut().enumerate() {
                    if t.state == ThreadState::Sleeping {
                        t.state = ThreadState::Runnable;
                        sched::on_runnable(i, ti);
                    }
                }
            }
            p.lock.release();
            return if ok { 0 } else { -1 };
        }
        p.lock.release();
    }
    -1
}

// ---------------------------------------------------------------------
// Threads API (4.D.3)
// ---------------------------------------------------------------------

fn next_tid(p: &mut Proc) -> i32 {
    let max = p.threads.iter().map(|t| t.tid).max().unwrap_or(0);
    max + 1
}

pub fn kthread_create(start_fn: usize, user_stack_bottom: usize, stack_size: usize) -> i32 {
    let p = myproc();
    if p.killed {
        return -1;
    }
    let pslot = slot_of(p);

    let found = p.threads.iter().position(|t| t.state == ThreadState::Unused);
    let Some(ti) = found else { return -1 };

    let tid = next_tid(p);
    let kstack = unsafe { KMEM.kalloc() };
    if kstack.is_null() {
        return -1;
    }
    let trapframe_page = unsafe { KMEM.kalloc() };
    if trapframe_page.is_null() {
        unsafe { KMEM.kfree(kstack) };
        return -1;
    }
    if mappages(p.pagetable(), crate::TRAPFRAME!(pslot, ti), trapframe_page as usize, PGSIZE, PTE_R | PTE_W) != 0 {
        unsafe {
            KMEM.kfree(kstack);
            KMEM.kfree(trapframe_page);
        }
        return -1;
    }

    let caller_tf = *mythread().trapframe();
    let t = &mut p.threads[ti];
    t.state = ThreadState::Used;
    t.tid = tid;
    t.killed = false;
    t.xstate = 0;
    t.waiters = 0;
    t.kstack = kstack as usize;
    t.trapframe = trapframe_page as usize;
    *t.trapframe() = caller_tf;
    t.trapframe().epc = start_fn as u64;
    t.trapframe().sp = (user_stack_bottom + stack_size - 16) as u64;
    t.context = Context::default();
    t.context.ra = crate::trap::thread_trampoline as usize as u64;
    t.context.sp = (t.kstack + PGSIZE) as u64;
    t.state = ThreadState::Runnable;
    p.alive += 1;

    sched::on_runnable(pslot, ti);
    tid
}

pub fn kthread_id() -> i32 {
    mythread().tid
}

pub fn kthread_exit(status: i32) -> ! {
    let pslot = slot_of(myproc());
    let (_, tidx) = mythread_slot();
    let p = &mut procs()[pslot];

    p.lock.acquire();
    p.alive -= 1;
    let last = p.alive == 0;
    p.lock.release();

    if last {
        exit_core(pslot, status);
    }

    let t = &mut p.threads[tidx];
    t.lock.acquire();
    t.xstate = status;
    t.state = ThreadState::Zombie;
    t.lock.release();
    wakeup(thread_chan(pslot, tidx));

    sched::park_current_forever();
}

fn thread_chan(pslot: usize, tidx: usize) -> usize {
    (&procs()[pslot].threads[tidx]) as *const Thread as usize
}

/// `kthread_join(tid, status_out)`. `force` bypasses the caller's own
/// `killed` check (used by `collapse`).
pub fn kthread_join(tid: i32, status_out: &mut i32, force: bool) -> i32 {
    let pslot = slot_of(myproc());
    if tid == kthread_id() {
        return -1;
    }
    let Some(target) = procs()[pslot].threads.iter().position(|t| t.tid == tid && t.state != ThreadState::Unused) else {
        return -1;
    };

    {
        let t = &mut procs()[pslot].threads[target];
        t.lock.acquire();
        if t.state == ThreadState::Unused || t.tid != tid {
            t.lock.release();
            return -1;
        }
        t.waiters += 1;
        t.lock.release();
    }

    loop {
        let t = &mut procs()[pslot].threads[target];
        t.lock.acquire();
        if t.state == ThreadState::Unused || t.tid != tid {
            t.lock.release();
            return -1;
        }
        if !force && mythread().killed {
            t.waiters -= 1;
            t.lock.release();
            return -2;
        }
        if t.state == ThreadState::Zombie {
            *status_out = t.xstate;
            t.waiters -= 1;
            let last_joiner = t.waiters == 0;
            if last_joiner {
                let trapframe = t.trapframe;
                unsafe { KMEM.kfree(t.kstack as *mut u8) };
                t.recycle();
                let pt = unsafe { &mut *procs()[pslot].pagetable_ptr() };
                uvmunmap(pt, crate::TRAPFRAME!(pslot, target), 1, false);
                if trapframe != 0 {
                    unsafe { KMEM.kfree(trapframe as *mut u8) };
                }
            }
            t.lock.release();
            return 0;
        }
        sched::sleep_on_with(thread_chan(pslot, target), &t.lock);
        t.lock.release();
    }
}

/// Used by exec and exit: a distinguished thread kills and joins every
/// sibling, freeing their kernel stacks, then clears the killed flags it
/// forced so the process can continue (exec) or finish tearing down
/// (exit's caller handles that separately).
pub fn collapse() {
    let pslot = slot_of(myproc());
    let (_, my_tidx) = mythread_slot();
    let sibling_tids: [i32; NTHREAD] = {
        let p = &mut procs()[pslot];
        let mut ids = [0; NTHREAD];
        for (i, t) in p.threads.iter().enumerate() {
            ids[i] = if i != my_tidx && t.state != ThreadState::Unused { t.tid } else { 0 };
        }
        ids
    };

    for (i, tid) in sibling_tids.iter().enumerate() {
        if *tid == 0 || i == my_tidx {
            continue;
        }
        let t = &mut procs()[pslot].threads[i];
        t.lock.acquire();
        t.killed = true;
        if t.state == ThreadState::Sleeping {
            t.state = ThreadState::Runnable;
            sched::on_runnable(pslot, i);
        }
        t.lock.release();
        let mut status = 0;
        kthread_join(*tid, &mut status, true);
    }

    let t = mythread();
    t.killed = false;
    procs()[pslot].killed = false;
}

// ---------------------------------------------------------------------
// Sleep / wake / yield (4.F)
// ---------------------------------------------------------------------

/// Block the calling thread on `chan`. Acquires its own lock, releases
/// `lk`, records the channel, goes SLEEPING, and calls `sched`; on
/// return it clears the channel, releases its own lock, and reacquires
/// `lk` — matching the protocol `wakeup` relies on to never miss a
/// wake-up (the sleeper's lock is held at the moment the caller's
/// condition-lock is released).
pub fn sleep(chan: usize, lk: &Spinlock) {
    let t = mythread();
    t.lock.acquire();
    lk.release();

    t.chan = Some(chan);
    t.state = ThreadState::Sleeping;
    sched::sched();

    t.chan = None;
    t.lock.release();
    lk.acquire();
}

/// Wake every SLEEPING thread across every process whose channel
/// matches. Takes each thread's own lock before inspecting it, which is
/// what guarantees a concurrent `sleep` cannot be missed.
///
/// Called from `clockintr` on every timer tick, including while the
/// calling hart is idle in `scheduler()` with no thread dispatched —
/// `sched_support::current()` is `None` there, so the self-skip below
/// compares against an `Option` rather than dereferencing `mythread()`.
pub fn wakeup(chan: usize) {
    let me = sched_support::current();
    for i in 0..NPROC {
        let p = &mut procs()[i];
        if p.state == ProcState::Unused {
            continue;
        }
        for (ti, t) in p.threads.iter_mut().enumerate() {
            if me == Some((i, ti)) {
                continue;
            }
            t.lock.acquire();
            if t.state == ThreadState::Sleeping && t.chan == Some(chan) {
                t.state = ThreadState::Runnable;
                sched::on_runnable(i, ti);
            }
            t.lock.release();
        }
    }
}

/// Voluntary preemption point: mark RUNNABLE and hand control back to
/// the scheduler.
pub fn yield_() {
    let t = mythread();
    t.lock.acquire();
    if t.state == ThreadState::Running {
        t.state = ThreadState::Runnable;
        let pslot = slot_of(myproc());
        let tidx = mythread_slot().1;
        sched::on_runnable(pslot, tidx);
    }
    sched::sched();
    t.lock.release();
}

/// Exposed to `sched` so it can drive dispatch without reaching into
/// this module's private fields directly.
pub(crate) mod sched_support {
    use super::*;

    pub fn thread_state(pslot: usize, tidx: usize) -> ThreadState {
        procs()[pslot].threads[tidx].state
    }

    pub fn set_running(pslot: usize, tidx: usize) {
        procs()[pslot].threads[tidx].state = ThreadState::Running;
    }

    pub fn acquire_thread_lock(pslot: usize, tidx: usize) {
        procs()[pslot].threads[tidx].lock.acquire();
    }

    pub fn release_thread_lock(pslot: usize, tidx: usize) {
        procs()[pslot].threads[tidx].lock.release();
    }

    pub fn context_ptr(pslot: usize, tidx: usize) -> *mut Context {
        &mut procs()[pslot].threads[tidx].context as *mut Context
    }

    pub fn scheduler_context_ptr() -> *mut Context {
        &mut mycpu().scheduler_context as *mut Context
    }

    pub fn set_current(pslot: usize, tidx: usize) {
        mycpu().current = Some((pslot, tidx));
    }

    pub fn clear_current() {
        mycpu().current = None;
    }

    pub fn current() -> Option<(usize, usize)> {
        mycpu().current
    }

    pub fn is_killed(pslot: usize, tidx: usize) -> bool {
        procs()[pslot].killed || procs()[pslot].threads[tidx].killed
    }

    pub fn for_each_proc_slot() -> core::ops::Range<usize> {
        0..NPROC
    }

    pub fn proc_state(pslot: usize) -> ProcState {
        procs()[pslot].state
    }

    pub fn threads_in(pslot: usize) -> core::ops::Range<usize> {
        0..NTHREAD
    }

    pub fn priority(pslot: usize) -> u8 {
        procs()[pslot].priority
    }

    pub fn tau(pslot: usize) -> i64 {
        procs()[pslot].tau_q16
    }

    pub fn set_tau(pslot: usize, tau: i64) {
        procs()[pslot].tau_q16 = tau;
    }

    pub fn perf_mut(pslot: usize) -> &'static mut PerfCounters {
        &mut procs()[pslot].perf
    }
}

pub fn proc_mapstacks(kpgtbl: &mut PageTable) {
    for idx in 0..NPROC {
        let pa = unsafe { KMEM.kalloc() };
        if pa.is_null() {
            panic!("proc_mapstacks: kalloc");
        }
        let va = crate::KSTACK!(idx);
        kvmmap(kpgtbl, va, pa as usize, PGSIZE, PTE_R | PTE_W);
    }
}

pub fn intr_enabled_on_entry() -> bool {
    intr_get()
}

pub fn enable_interrupts() {
    intr_on();
}

// ---------------------------------------------------------------------
// Copy helpers for device/filesystem code that may be handed either a
// user or a kernel address (console.rs, fs/fs.rs). Routes through the
// page-table-aware copy when the address is a user one; otherwise it's
// a plain same-address-space memcpy.
// ---------------------------------------------------------------------

/// Copy `len` bytes from `src` to `dst`. If `is_user_dst`, `dst` is
/// treated as a virtual address in the current process's address space
/// and copied via its page table; otherwise it's a kernel pointer.
pub fn either_copyout(is_user_dst: bool, dst: *mut u8, src: *const u8, len: usize) -> i32 {
    if is_user_dst {
        copyout(myproc().pagetable(), dst as usize, src, len)
    } else {
        unsafe { core::ptr::copy_nonoverlapping(src, dst, len) };
        0
    }
}

/// Copy `len` bytes from `src` to `dst`. If `is_user_src`, `src` is
/// treated as a virtual address in the current process's address space
/// and copied via its page table; otherwise it's a kernel pointer.
pub fn either_copyin(dst: *mut u8, is_user_src: bool, src: *const u8, len: usize) -> i32 {
    if is_user_src {
        copyin(myproc().pagetable(), dst, src as usize, len)
    } else {
        unsafe { core::ptr::copy_nonoverlapping(src, dst, len) };
        0
    }
}

/// Print a one-line-per-thread process table dump to the console
/// (`consoleintr`'s Ctrl-P handler). Debug-only; takes no locks, so it
/// may print a state straddling a concurrent transition.
pub fn procdump() {
    crate::printf!("\n");
    for i in 0..NPROC {
        let p = &procs()[i];
        if p.state == ProcState::Unused {
            continue;
        }
        let name_len = p.name.iter().position(|&b| b == 0).unwrap_or(p.name.len());
        let name = core::str::from_utf8(&p.name[..name_len]).unwrap_or("?");
        for t in p.threads.iter() {
            if t.state == ThreadState::Unused {
                continue;
            }
            let state = match t.state {
                ThreadState::Unused => "unused",
                ThreadState::Used => "used",
                ThreadState::Sleeping => "sleep",
                ThreadState::Runnable => "runble",
                ThreadState::Running => "run",
                ThreadState::Zombie => "zombie",
            };
            crate::printf!("{} {} {}\n", p.pid, state, name);
        }
    }
}
