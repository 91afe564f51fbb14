mod sysfile;
mod sysproc;
mod syscall;

pub use syscall::syscall;

// System call numbers. Numbers 1..21 are the original xv6 set; 22..32
// are this kernel's additions (threads, signals, tracing, scheduling
// introspection, paging introspection). The handler-stub assembly
// written onto the user stack at signal-delivery time bakes in
// `SYS_sigret`'s numeric value directly, so it must never move.
pub const SYS_fork: u8 = 1;
pub const SYS_exit: u8 = 2;
pub const SYS_wait: u8 = 3;
pub const SYS_pipe: u8 = 4;
pub const SYS_read: u8 = 5;
pub const SYS_kill: u8 = 6;
pub const SYS_exec: u8 = 7;
pub const SYS_fstat: u8 = 8;
pub const SYS_chdir: u8 = 9;
pub const SYS_dup: u8 =  10;
pub const SYS_getpid: u8 = 11;
pub const SYS_sbrk: u8 = 12;
pub const SYS_sleep: u8 = 13;
pub const SYS_uptime: u8 = 14;
pub const SYS_open: u8 = 15;
pub const SYS_write: u8 = 16;
pub const SYS_mknod: u8 = 17;
pub const SYS_unlink: u8 = 18;
pub const SYS_link: u8 = 19;
pub const SYS_mkdir: u8 = 20;
pub const SYS_close: u8 = 21;
pub const SYS_kthread_create: u8 = 22;
pub const SYS_kthread_id: u8 = 23;
pub const SYS_kthread_exit: u8 = 24;
pub const SYS_kthread_join: u8 = 25;
pub const SYS_sigaction: u8 = 26;
pub const SYS_sigprocmask: u8 = 27;
pub const SYS_sigret: u8 = 28;
pub const SYS_trace: u8 = 29;
pub const SYS_set_priority: u8 = 30;
pub const SYS_wait_stat: u8 = 31;
pub const SYS_pgfault_reset: u8 = 32;
pub const SYS_bsem_alloc: u8 = 33;
pub const SYS_bsem_free: u8 = 34;
pub const SYS_bsem_down: u8 = 35;
pub const SYS_bsem_up: u8 = 36;

pub const NSYSCALL: usize = 37;

#[macro_export]
macro_rules! NELEM {
    ( $x:expr ) => {
        $x.len()
    };
}
