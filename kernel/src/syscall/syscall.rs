//! Argument marshalling and dispatch for the syscall surface listed in
//! `mod.rs`. Every syscall reads its arguments out of the calling
//! thread's own trapframe (`a0..a5`) and writes its return value into
//! `a0`; the syscall number itself travels in `a7`.

use crate::proc::{myproc, mythread};
use crate::vm::{copyin, copyinstr, copyout};

use super::sysfile;
use super::sysproc;
use super::{
    NSYSCALL, SYS_bsem_alloc, SYS_bsem_down, SYS_bsem_free, SYS_bsem_up, SYS_chdir, SYS_close,
    SYS_dup, SYS_exec, SYS_exit, SYS_fork, SYS_fstat, SYS_getpid, SYS_kill, SYS_kthread_create,
    SYS_kthread_exit, SYS_kthread_id, SYS_kthread_join, SYS_link, SYS_mkdir, SYS_mknod, SYS_open,
    SYS_pgfault_reset, SYS_pipe, SYS_read, SYS_sbrk, SYS_set_priority, SYS_sigaction,
    SYS_sigprocmask, SYS_sigret, SYS_sleep, SYS_trace, SYS_unlink, SYS_uptime, SYS_wait,
    SYS_wait_stat, SYS_write,
};

/// Read the raw value of argument register `n` (`a0..a5`) out of the
/// calling thread's trapframe.
fn argraw(n: u8) -> u64 {
    let tf = mythread().trapframe();
    match n {
        0 => tf.a0,
        1 => tf.a1,
        2 => tf.a2,
        3 => tf.a3,
        4 => tf.a4,
        5 => tf.a5,
        _ => panic!("argraw: n out of range"),
    }
}

pub(super) fn argint(n: u8) -> i32 {
    argraw(n) as i32
}

/// Retrieve argument `n` as a user virtual address. Not validated here;
/// `copyin`/`copyout`/`copyinstr` reject a bad mapping when the address
/// is actually dereferenced.
pub(super) fn argaddr(n: u8) -> usize {
    argraw(n) as usize
}

/// Fetch the nul-terminated string at user virtual address `addr` into
/// `buf`, copying at most `max` bytes. Returns the string's length
/// (excluding the NUL), or `-1` on a bad address or an unterminated
/// string.
pub(super) fn fetchstr(addr: usize, buf: *mut u8, max: usize) -> i32 {
    let pagetable = myproc().pagetable();
    let n = copyinstr(pagetable, buf, addr, max);
    if n < 0 {
        return -1;
    }
    n - 1 // copyinstr's return includes the NUL; callers want the length without it
}

pub(super) fn argstr(n: u8, buf: *mut u8, max: usize) -> i32 {
    let addr = argaddr(n);
    fetchstr(addr, buf, max)
}

/// Fetch the word-sized value at user virtual address `addr` into `ip`.
/// Returns `0` on success, `-1` if `addr` falls outside the process's
/// address space or the copy itself fails.
pub(super) fn fetchaddr(addr: usize, ip: &mut usize) -> i32 {
    if addr >= myproc().sz() {
        return -1;
    }
    let pagetable = myproc().pagetable();
    let mut raw = [0u8; core::mem::size_of::<usize>()];
    if copyin(pagetable, raw.as_mut_ptr(), addr, raw.len()) != 0 {
        return -1;
    }
    *ip = usize::from_ne_bytes(raw);
    0
}

/// Copy `len` bytes from kernel memory at `src` out to user virtual
/// address `dst` in the calling process's address space.
pub(super) fn put_user(dst: usize, src: *const u8, len: usize) -> i32 {
    let pagetable = myproc().pagetable();
    copyout(pagetable, dst, src, len)
}

type Handler = fn() -> u64;

static SYSCALLS: [Option<Handler>; NSYSCALL] = {
    let mut table: [Option<Handler>; NSYSCALL] = [None; NSYSCALL];
    table[SYS_fork as usize] = Some(sysproc::sys_fork);
    table[SYS_exit as usize] = Some(sysproc::sys_exit);
    table[SYS_wait as usize] = Some(sysproc::sys_wait);
    table[SYS_pipe as usize] = Some(sysfile::sys_pipe);
    table[SYS_read as usize] = Some(sysfile::sys_read);
    table[SYS_kill as usize] = Some(sysproc::sys_kill);
    table[SYS_exec as usize] = Some(sysfile::sys_exec);
    table[SYS_fstat as usize] = Some(sysfile::sys_fstat);
    table[SYS_chdir as usize] = Some(sysfile::sys_chdir);
    table[SYS_dup as usize] = Some(sysfile::sys_dup);
    table[SYS_getpid as usize] = Some(sysproc::sys_getpid);
    table[SYS_sbrk as usize] = Some(sysproc::sys_sbrk);
    table[SYS_sleep as usize] = Some(sysproc::sys_sleep);
    table[SYS_uptime as usize] = Some(sysproc::sys_uptime);
    table[SYS_open as usize] = Some(sysfile::sys_open);
    table[SYS_write as usize] = Some(sysfile::sys_write);
    table[SYS_mknod as usize] = Some(sysfile::sys_mknod);
    table[SYS_unlink as usize] = Some(sysfile::sys_unlink);
    table[SYS_link as usize] = Some(sysfile::sys_link);
    table[SYS_mkdir as usize] = Some(sysfile::sys_mkdir);
    table[SYS_close as usize] = Some(sysfile::sys_close);
    table[SYS_kthread_create as usize] = Some(sysproc::sys_kthread_create);
    table[SYS_kthread_id as usize] = Some(sysproc::sys_kthread_id);
    table[SYS_kthread_exit as usize] = Some(sysproc::sys_kthread_exit);
    table[SYS_kthread_join as usize] = Some(sysproc::sys_kthread_join);
    table[SYS_sigaction as usize] = Some(sysproc::sys_sigaction);
    table[SYS_sigprocmask as usize] = Some(sysproc::sys_sigprocmask);
    table[SYS_sigret as usize] = Some(sysproc::sys_sigret);
    table[SYS_trace as usize] = Some(sysproc::sys_trace);
    table[SYS_set_priority as usize] = Some(sysproc::sys_set_priority);
    table[SYS_wait_stat as usize] = Some(sysproc::sys_wait_stat);
    table[SYS_pgfault_reset as usize] = Some(sysproc::sys_pgfault_reset);
    table[SYS_bsem_alloc as usize] = Some(sysproc::sys_bsem_alloc);
    table[SYS_bsem_free as usize] = Some(sysproc::sys_bsem_free);
    table[SYS_bsem_down as usize] = Some(sysproc::sys_bsem_down);
    table[SYS_bsem_up as usize] = Some(sysproc::sys_bsem_up);
    table
};

/// Called from `trap::usertrap` on an environment-call-from-U-mode
/// exception, with the PC already advanced past `ecall`. Looks up `a7`
/// in the dispatch table and writes the handler's result into `a0`.
pub fn syscall() {
    let num = mythread().trapframe().a7 as usize;
    let result = if num < NSYSCALL {
        match SYSCALLS[num] {
            Some(handler) => handler(),
            None => {
                crate::printf!("unknown sys call {}\n", num);
                u64::MAX
            }
        }
    } else {
        crate::printf!("syscall number {} out of range\n", num);
        u64::MAX
    };
    mythread().trapframe().a0 = result;
}
