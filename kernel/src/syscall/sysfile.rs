//! Process-image loading (`exec`) plus placeholders for the rest of the
//! classic file-descriptor surface. The block/inode/file layers are
//! used opaquely by this kernel (see `exec`'s `namei`/`readi` calls);
//! building a real per-fd API on top of them is out of scope here, so
//! `open`/`read`/`write`/... are left as `ENOSYS`-style stubs rather
//! than half-wired against a file table this kernel doesn't maintain.

use core::mem;
use crate::exec::exec;
use crate::kalloc::KMEM;
use crate::param::{MAXARG, MAXPATH};
use crate::riscv::PGSIZE;
use crate::syscall::syscall::{argaddr, argstr, fetchaddr, fetchstr};

pub(crate) fn sys_exec() -> u64 {
    let mut uarg: usize = 0;
    let uargv = argaddr(1);

    let mut path: [u8; MAXPATH] = [0u8; MAXPATH];
    if argstr(0, &mut path as *mut u8, MAXPATH) < 0 {
        return u64::MAX;
    }

    let mut argv: [Option<*mut u8>; MAXARG] = [None; MAXARG];
    let mut i = 0;
    let mut bad = false;
    loop {
        if i >= argv.len() {
            bad = true;
            break;
        }

        if fetchaddr(uargv + mem::size_of::<usize>() * i, &mut uarg) < 0 {
            bad = true;
            break;
        }

        if uarg == 0 {
            argv[i] = None;
            break;
        }

        let ptr: *mut u8 = unsafe { KMEM.kalloc() };
        if ptr.is_null() {
            bad = true;
            break;
        }
        argv[i] = Some(ptr);

        if fetchstr(uarg, argv[i].unwrap(), PGSIZE) < 0 {
            bad = true;
            break;
        }

        i += 1;
    }

    let ret = if !bad { exec(&path, &argv) } else { -1 };

    for slot in argv.iter() {
        match slot {
            Some(p) => unsafe { KMEM.kfree(*p) },
            None => break,
        }
    }

    ret as u64
}

/// Not implemented: the open-file-table layer this would allocate a
/// descriptor against is out of scope (see module docs).
pub(crate) fn sys_open() -> u64 {
    u64::MAX
}

pub(crate) fn sys_mknod() -> u64 {
    u64::MAX
}

pub(crate) fn sys_read() -> u64 {
    u64::MAX
}

pub(crate) fn sys_write() -> u64 {
    u64::MAX
}

pub(crate) fn sys_close() -> u64 {
    u64::MAX
}

pub(crate) fn sys_dup() -> u64 {
    u64::MAX
}

pub(crate) fn sys_pipe() -> u64 {
    u64::MAX
}

pub(crate) fn sys_fstat() -> u64 {
    u64::MAX
}

pub(crate) fn sys_chdir() -> u64 {
    u64::MAX
}

pub(crate) fn sys_link() -> u64 {
    u64::MAX
}

pub(crate) fn sys_unlink() -> u64 {
    u64::MAX
}

pub(crate) fn sys_mkdir() -> u64 {
    u64::MAX
}
