use crate::kalloc::KMEM;
use crate::{MAKE_SATP, PA2PTE, PGROUNDDOWN, PGROUNDUP, printf, PTE2PA, PTE_FLAGS, PX};
use crate::memlayout::{KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, UART0, VIRTIO0};
use crate::proc::proc_mapstacks;
use crate::riscv::{MAXVA, PageTable, PGSIZE, Pte, PTE_PG, PTE_R, PTE_SIZE, PTE_U, PTE_V, PTE_W, PTE_X, sfence_vma, w_satp};
use crate::string::{memmove, memset};

/*
 * the kernel's page table.
 */
pub static mut KERNEL_PAGETABLE: Option<&'static PageTable> = None;

extern {
    static etext: u8;  // kernel.ld sets this to end of kernel code.
    static trampoline: u8; // trampoline.S
}

// Make a direct-map page table for the kernel.
fn kvmmake<'a>() -> &'a PageTable {
    let kpgtbl = unsafe {
        let pg: *mut PageTable = KMEM.kalloc();
        if pg.is_null() {
            panic!("failed to alloc for root page table");
        }
        memset(pg as *mut u8, 0, PGSIZE);
        pg.as_mut().unwrap()
    };
    // printf!("Root Page Table Allocated.\n");

    // uart registers
    kvmmap(kpgtbl, UART0, UART0, PGSIZE, PTE_R | PTE_W);
    // printf!("UART0 Mapped.\n");

    // virtio mmio disk interface
    kvmmap(kpgtbl, VIRTIO0, VIRTIO0, PGSIZE, PTE_R | PTE_W);
    // printf!("VIRTIO0 Mapped.\n");

    // PLIC
    kvmmap(kpgtbl, PLIC, PLIC, 0x400000, PTE_R | PTE_W);
    // printf!("PLIC Mapped.\n");

    let etext_addr = (unsafe { &etext } as *const u8).expose_addr();
    // map kernel text executable and read-only.
    kvmmap(kpgtbl, KERNBASE, KERNBASE, etext_addr - KERNBASE, PTE_R | PTE_X);
    // printf!("etext_addr: {:x}, KERNBASE: {:x}, PHYSTOP: {:x}, size: {}\n", etext_addr, KERNBASE, PHYSTOP, etext_addr - KERNBASE);
    // printf!("KERNBASE Mapped.\n");

    // map kernel data and the physical RAM we'll make use of.
    kvmmap(kpgtbl, etext_addr, etext_addr, PHYSTOP - etext_addr, PTE_R | PTE_W);
    // printf!("etext_addr Mapped.\n");

    let trapoline_addr = (unsafe { &trampoline } as *const u8).expose_addr();
    // map the trampoline for trap entry/exit to
    // the highest virtual address in the kernel.
    kvmmap(kpgtbl, TRAMPOLINE, trapoline_addr, PGSIZE, PTE_R | PTE_X);
    // printf!("TRAMPOLINE Mapped.\n");

    // allocate and map a kernel stack for each process.
    proc_mapstacks(kpgtbl);
    // printf!("Proc Kernel Stack Mapped.\n");

    kpgtbl
}

// Initialize the one KERNEL_PAGETABLE
pub fn kvminit() {
    unsafe {
        KERNEL_PAGETABLE = Some(kvmmake());
    }
}

// add a mapping to the kernel page table.
// only used when booting.
// does not flush TLB or enable paging.
pub fn kvmmap(kpgtbl: &mut PageTable, va: usize, pa: usize, sz: usize, perm: usize)
{
    if mappages(kpgtbl, va, pa, sz, perm) != 0 {
        panic!("kvmmap");
    }
}

// Create PTEs for virtual addresses starting at va that refer to
// physical addresses starting at pa. va and size might not
// be page-aligned. Returns 0 on success, -1 if walk() couldn't
// allocate a needed page-table page.
pub fn mappages(pagetable: &mut PageTable, va: usize, mut pa: usize, size: usize, perm: usize) -> i32 {
    if size == 0 {
        panic!("mappages: size");
    }

    let mut a: usize = PGROUNDDOWN!(va);
    let last: usize = PGROUNDDOWN!(va + size - 1);
    // printf!("a: {:x}, last: {:x}\n\n", a, last);

    loop {
        let pte: Option<&mut Pte> = walk(pagetable, a, 1);
        if pte.is_none() {
            return -1;
        }

        let pte = pte.unwrap();
        if pte.0 & PTE_V == 1 {
            printf!("a: {:x}, Pte: {:x}\n", a, pte.0);
            panic!("mappages: remap");
        }

        (*pte) = Pte(PA2PTE!(pa) | perm | PTE_V);
        if a == last {
            break;
        }

        a += PGSIZE;
        pa += PGSIZE;
    }
    return 0;
}

// Remove npages of mappings starting from va. va must be
// page-aligned. The mappings must exist.
// Optionally free the physical memory.
pub fn uvmunmap(pagetable: &mut PageTable, va: usize, npages: usize, do_free: bool) {
    if (va % PGSIZE) != 0 {
        panic!("uvmunmap: not aligned");
    }

    for a in (va..va + npages * PGSIZE).step_by(PGSIZE) {
        match walk(pagetable, a, 0) {
            None => panic!("uvmunmap: walk"),
            Some(pte) => {
                if pte.0 & PTE_V == 0 {
                    panic!("uvmunmap: not mapped");
                }

                if PTE_FLAGS!(pte.0) == PTE_V {
                    panic!("uvmunmap: not a leaf");
                }

                if do_free {
                    let pa = PTE2PA!(pte.0);
                    unsafe { KMEM.kfree(pa as *mut PageTable); }
                }
                *pte = Pte(0);
            }
        }
    }
}


// Return the address of the PTE in page table pagetable
// that corresponds to virtual address va.  If alloc!=0,
// create any required page-table pages.
//
// The risc-v Sv39 scheme has three levels of page-table
// pages. A page-table page contains 512 64-bit PTEs.
// A 64-bit virtual address is split into five fields:
//   39..63 -- must be zero.
//   30..38 -- 9 bits of level-2 index.
//   21..29 -- 9 bits of level-1 index.
//   12..20 -- 9 bits of level-0 index.
//    0..11 -- 12 bits of byte offset within the page.
fn walk(pagetable: &mut PageTable, va: usize, alloc: usize) -> Option<&mut Pte> {
    if va >= MAXVA {
        panic!("walk");
    }

    let mut curr_pgtbl = pagetable;
    for level in (1..3).rev() {
        let pte = &mut (curr_pgtbl.0)[PX!(level, va)];
        if pte.0 & PTE_V  == PTE_V {
            unsafe { curr_pgtbl = (PTE2PA!(pte.0) as *mut PageTable).as_mut().unwrap(); }
        } else {
            unsafe {
                if alloc == 0 {
                    return None;
                }

                let next_level_pgtbl: *mut PageTable = KMEM.kalloc();
                if next_level_pgtbl.is_null() {
                    return None;
                }

                memset(next_level_pgtbl as *mut u8, 0, PGSIZE);

                *pte = Pte(PA2PTE!(next_level_pgtbl.expose_addr()) | PTE_V);
                // printf!("[{}] pte: {:x}\n", PX!(level, va), pte.0);
                curr_pgtbl = next_level_pgtbl.as_mut().unwrap();
            }
        }
    }

    Some(&mut (curr_pgtbl.0)[PX!(0, va)])
}

// Switch h/w page table register to the kernel's page table,
// and enable paging.
pub fn kvminithart() {
    // wait for any previous writes to the page table memory to finish.
    sfence_vma();

    let addr = unsafe { (KERNEL_PAGETABLE.unwrap() as *const PageTable).expose_addr() };
    let satp = MAKE_SATP!(addr);
    w_satp(satp);

    // flush stale entries from the TLB.
    sfence_vma();
}

// create an empty user page table.
// returns 0 if out of memory.
pub fn uvmcreate<'a>() -> Option<&'a mut PageTable>{
    unsafe {
        let pagetable: *mut PageTable = KMEM.kalloc();
        if pagetable.is_null() {
            return None;
        }
        memset(pagetable as *mut u8, 0, PGSIZE);
        pagetable.as_mut()
    }
}

// Load the user initcode into address 0 of pagetable,
// for the very first process.
// sz must be less than a page.
pub fn uvmfirst(pagetable: &mut PageTable, src: *const u8, sz: usize) {
    if sz >= PGSIZE {
        panic!("uvmfirst: more than a page");
    }

    let mem = unsafe { KMEM.kalloc() };
    memset(mem, 0, PGSIZE);
    mappages(pagetable, 0, mem.expose_addr(), PGSIZE, PTE_W | PTE_R | PTE_X | PTE_U);
    memmove(mem, src, sz);
}

// Recursively free page-table pages.
// All leaf mappings must already have been removed.
fn freewalk(pagetable: &mut PageTable) {
    // there are 2^9 = 512 PTEs in a page table.
    for pte in &mut pagetable.0 {
        if pte.0 & PTE_V != 0 && pte.0 & (PTE_R | PTE_W | PTE_X) == 0 {
            // this PTE points to a lower-level page table.
            let child_pgtbl = unsafe { (PTE2PA!(pte.0) as *mut PageTable).as_mut().unwrap() };
            freewalk(child_pgtbl);
            *pte = Pte(0);
        } else if pte.0 & PTE_V != 0 {
            panic!("freewalk: leaf");
        }
    }

    unsafe { KMEM.kfree(pagetable) };
}

// Free user memory pages,
// then free page-table pages.
pub fn uvmfree(pagetable: &mut PageTable, sz: usize) {
    if sz > 0 {
        uvmunmap(pagetable, 0, PGROUNDUP!(sz)/PGSIZE, true);
    }
    freewalk(pagetable);
}

/// Tear down every user mapping below `sz` the way `uvmunmap` does,
/// except that a page the paging engine has recorded as swapped out (no
/// physical page behind it) is cleared rather than treated as a
/// must-be-resident violation. Used at address-space teardown, where a
/// non-exempt process's range may have swapped-out holes in it;
/// `uvmunmap` stays strict for the shrink and stack-teardown paths,
/// which never span a swapped page.
pub fn uvmfree_paged(pagetable: &mut PageTable, sz: usize) {
    let mut a = 0;
    while a < sz {
        if let Some(pte) = walk_existing(pagetable, a) {
            if pte.is_valid() {
                let pa = pte.pa();
                unsafe { KMEM.kfree(pa as *mut PageTable) };
            }
            *pte = Pte(0);
        }
        a += PGSIZE;
    }
    freewalk(pagetable);
}

// --- paging-engine contract -------------------------------------------
//
// The swap engine (see `paging.rs`) needs to flip a leaf PTE between
// resident (V=1,PG=0) and swapped (V=0,PG=1) without walking the tree
// itself, and needs to read/clear the Accessed bit for the aging and
// second-chance policies. `walk` already does the tree descent; these
// are the narrow, paging-specific entry points onto it.

/// Look up the PTE for an already-mapped user virtual address. Never
/// allocates; returns `None` if no leaf PTE exists at `va` at all (not to
/// be confused with a leaf PTE that exists but is marked not-valid because
/// its page was swapped out — callers distinguish those with `Pte::flags`).
pub fn walk_existing(pagetable: &mut PageTable, va: usize) -> Option<&mut Pte> {
    walk(pagetable, PGROUNDDOWN!(va), 0)
}

/// Allocate one zeroed physical page and map it at `va` with `perm`
/// (ORed with `PTE_V` and `PTE_U`). Used both for ordinary user-page
/// allocation and to materialise a page being swapped back in. Returns
/// the physical address on success.
pub fn uvmalloc_one(pagetable: &mut PageTable, va: usize, perm: usize) -> Result<usize, ()> {
    let mem: *mut PageTable = unsafe { KMEM.kalloc() };
    if mem.is_null() {
        return Err(());
    }
    memset(mem as *mut u8, 0, PGSIZE);
    let pa = mem.expose_addr();
    if mappages(pagetable, PGROUNDDOWN!(va), pa, PGSIZE, perm | PTE_V | PTE_U) != 0 {
        unsafe { KMEM.kfree(mem) };
        return Err(());
    }
    Ok(pa)
}

/// Read the physical page backing a resident (`PTE_V` set) leaf entry
/// into `buf`, which must be exactly `PGSIZE` bytes.
pub fn read_resident_page(pa: usize, buf: &mut [u8; PGSIZE]) {
    unsafe {
        core::ptr::copy_nonoverlapping(pa as *const u8, buf.as_mut_ptr(), PGSIZE);
    }
}

/// Overwrite the physical page at `pa` with `buf`.
pub fn write_resident_page(pa: usize, buf: &[u8; PGSIZE]) {
    unsafe {
        core::ptr::copy_nonoverlapping(buf.as_ptr(), pa as *mut u8, PGSIZE);
    }
}

/// Free the physical page backing `pa` without touching the page table
/// (the caller is responsible for clearing or repointing the PTE first).
pub fn free_resident_page(pa: usize) {
    unsafe { KMEM.kfree(pa as *mut PageTable) };
}

// --- user/kernel copy and address-space growth -------------------------
//
// The classic xv6 `copyin`/`copyout`/`walkaddr`/`uvmalloc` quartet.
// `exec` and the syscall argument marshaller (`syscall::argstr` et al.)
// are the only in-scope callers; everything else about a page's
// contents goes through the narrower paging-engine contract above.

/// Look up the physical address backing a *resident, user-accessible*
/// mapping at `va`. Returns `None` for an unmapped, non-user, or
/// swapped-out page — callers that need to distinguish "swapped out"
/// from "never mapped" go through `walk_existing`/`Pte` directly.
pub fn walkaddr(pagetable: &mut PageTable, va: usize) -> Option<usize> {
    if va >= MAXVA {
        return None;
    }
    let pte = walk(pagetable, va, 0)?;
    if !pte.is_valid() || (pte.0 & PTE_U) == 0 {
        return None;
    }
    Some(pte.pa())
}

/// Grow a user address space from `oldsz` to `newsz`, page by page, with
/// permission `xperm` (ORed with `PTE_R | PTE_U`). Returns the new size,
/// or `0` on allocation failure (in which case the address space is
/// rolled back to `oldsz`).
pub fn uvmalloc(pagetable: &mut PageTable, oldsz: usize, newsz: usize, xperm: usize) -> usize {
    if newsz < oldsz {
        return oldsz;
    }
    let oldsz_up = PGROUNDUP!(oldsz);
    let mut a = oldsz_up;
    while a < newsz {
        if uvmalloc_one(pagetable, a, xperm | PTE_R).is_err() {
            uvmunmap(pagetable, oldsz_up, (a - oldsz_up) / PGSIZE, true);
            return 0;
        }
        a += PGSIZE;
    }
    newsz
}

/// Clear `PTE_U` on the single page at `va`: used to make the exec
/// stack's guard page inaccessible from user mode without unmapping it.
pub fn uvmclear(pagetable: &mut PageTable, va: usize) {
    let pte = walk(pagetable, va, 0).expect("uvmclear: no mapping");
    pte.0 &= !PTE_U;
}

/// Copy `len` bytes from kernel memory at `src` to user virtual address
/// `dstva` in `pagetable`. Returns `-1` on any unmapped page in range.
pub fn copyout(pagetable: &mut PageTable, mut dstva: usize, src: *const u8, len: usize) -> i32 {
    let mut n_copied = 0usize;
    while n_copied < len {
        let va0 = PGROUNDDOWN!(dstva);
        let Some(pa0) = walkaddr(pagetable, va0) else { return -1 };
        let off = dstva - va0;
        let n = core::cmp::min(PGSIZE - off, len - n_copied);
        unsafe {
            core::ptr::copy_nonoverlapping(src.add(n_copied), (pa0 + off) as *mut u8, n);
        }
        n_copied += n;
        dstva = va0 + PGSIZE;
    }
    0
}

/// Copy `len` bytes from user virtual address `srcva` into kernel memory
/// at `dst`. Returns `-1` on any unmapped page in range.
pub fn copyin(pagetable: &mut PageTable, dst: *mut u8, mut srcva: usize, len: usize) -> i32 {
    let mut n_copied = 0usize;
    while n_copied < len {
        let va0 = PGROUNDDOWN!(srcva);
        let Some(pa0) = walkaddr(pagetable, va0) else { return -1 };
        let off = srcva - va0;
        let n = core::cmp::min(PGSIZE - off, len - n_copied);
        unsafe {
            core::ptr::copy_nonoverlapping((pa0 + off) as *const u8, dst.add(n_copied), n);
        }
        n_copied += n;
        srcva = va0 + PGSIZE;
    }
    0
}

/// Copy a NUL-terminated string of at most `max` bytes from user virtual
/// address `srcva` into kernel buffer `dst`. Returns `-1` if the string
/// doesn't fit or any page in range is unmapped.
pub fn copyinstr(pagetable: &mut PageTable, dst: *mut u8, mut srcva: usize, max: usize) -> i32 {
    let mut got = 0usize;
    while got < max {
        let va0 = PGROUNDDOWN!(srcva);
        let Some(pa0) = walkaddr(pagetable, va0) else { return -1 };
        let off = srcva - va0;
        let mut n = core::cmp::min(PGSIZE - off, max - got);
        let src = (pa0 + off) as *const u8;
        let mut done = false;
        unsafe {
            for i in 0..n {
                let c = src.add(i).read();
                dst.add(got + i).write(c);
                if c == 0 {
                    n = i + 1;
                    done = true;
                    break;
                }
            }
        }
        got += n;
        if done {
            return got as i32;
        }
        srcva = va0 + PGSIZE;
    }
    -1
}

// --- fork's address-space clone -----------------------------------------

use crate::hal::AddressSpace;
use crate::paging::PagingError;
use crate::param::{MAX_PSYC_PAGES, MAX_SWAP_PAGES};
use crate::proc::Proc;

/// The paging engine's `AddressSpace` contract, backed by a real user
/// page table. Permission bits for a swapped-out entry ride along for
/// free: `mark_swapped_out` clears `V` and sets `PG` but leaves
/// `R`/`W`/`X`/`U` exactly where they were, so `evict_resident` can read
/// them straight back off the PTE instead of needing a side table.
pub struct KernelAddressSpace<'a> {
    pagetable: &'a mut PageTable,
}

impl<'a> KernelAddressSpace<'a> {
    pub fn new(pagetable: &'a mut PageTable) -> Self {
        KernelAddressSpace { pagetable }
    }
}

impl<'a> AddressSpace for KernelAddressSpace<'a> {
    fn is_resident(&mut self, va: usize) -> bool {
        walk_existing(self.pagetable, va).map_or(false, |p| p.is_valid() && !p.is_paged_out())
    }

    fn is_swapped_out(&mut self, va: usize) -> bool {
        walk_existing(self.pagetable, va).map_or(false, |p| !p.is_valid() && p.is_paged_out())
    }

    fn take_accessed(&mut self, va: usize) -> bool {
        let pte = walk_existing(self.pagetable, va).expect("take_accessed: no mapping");
        let was = pte.accessed();
        pte.clear_accessed();
        was
    }

    fn alloc_resident(&mut self, va: usize, perm: usize) -> Result<(), ()> {
        uvmalloc_one(self.pagetable, va, perm).map(|_| ())
    }

    fn read_resident(&mut self, va: usize, buf: &mut [u8; PGSIZE]) {
        let pa = walk_existing(self.pagetable, va).expect("read_resident: no mapping").pa();
        read_resident_page(pa, buf);
    }

    fn write_resident(&mut self, va: usize, buf: &[u8; PGSIZE]) {
        let pa = walk_existing(self.pagetable, va).expect("write_resident: no mapping").pa();
        write_resident_page(pa, buf);
    }

    fn evict_resident(&mut self, va: usize) -> usize {
        let pte = walk_existing(self.pagetable, va).expect("evict_resident: no mapping");
        let perm = PTE_FLAGS!(pte.0) & (PTE_R | PTE_W | PTE_X | PTE_U);
        let pa = pte.pa();
        pte.mark_swapped_out();
        free_resident_page(pa);
        perm
    }

    fn restore_resident(&mut self, va: usize, perm: usize) -> Result<(), ()> {
        let mem: *mut u8 = unsafe { KMEM.kalloc() };
        if mem.is_null() {
            return Err(());
        }
        memset(mem, 0, PGSIZE);
        let pa = mem.expose_addr();
        let pte = walk_existing(self.pagetable, va).ok_or(())?;
        pte.mark_resident(pa, perm);
        Ok(())
    }
}

/// Install a leaf PTE that is swapped-out from the start: used by the
/// fork path to mirror a parent's swap entry into the child without
/// ever materialising a physical page for it. `perm` is the parent's
/// captured permission bits (`R`/`W`/`X`/`U`, no `V`).
fn map_swapped_out(pagetable: &mut PageTable, va: usize, perm: usize) -> Result<(), ()> {
    let pte = walk(pagetable, va, 1).ok_or(())?;
    if pte.0 & PTE_V != 0 {
        panic!("map_swapped_out: remap");
    }
    *pte = Pte(perm | PTE_PG);
    Ok(())
}

/// `fork`'s address-space clone (4.C.3, 4.D.2): byte-for-byte copy every
/// resident page, and byte-for-byte copy every swapped-out page's swap
/// file contents at the same offset, into the child — without ever
/// exceeding `MAX_TOTAL_PAGES` on the child (it starts strictly from
/// the parent's own within-budget layout). Exempt parents (init, the
/// shell) carry no paging metadata at all, so their children fall back
/// to a plain resident-pages-only copy and inherit the exemption.
pub fn uvmcopy_hook(parent: &mut Proc, child: &mut Proc) -> Result<(), ()> {
    if parent.is_exempt() {
        child.paging_mut().reset(true);
        return uvmcopy_plain(parent.pagetable(), child.pagetable(), parent.sz());
    }

    let parent_pt = parent.pagetable() as *mut PageTable;
    let child_pt = child.pagetable() as *mut PageTable;

    let vas: alloc::vec::Vec<usize> = parent.paging_mut().memory_vas_for_fork().collect();
    for va in vas {
        let mut buf = [0u8; PGSIZE];
        let perm = {
            let mut pspace = KernelAddressSpace::new(unsafe { &mut *parent_pt });
            pspace.read_resident(va, &mut buf);
            PTE_FLAGS!(walk_existing(unsafe { &mut *parent_pt }, va).unwrap().0) & (PTE_R | PTE_W | PTE_X | PTE_U)
        };
        uvmalloc_one(unsafe { &mut *child_pt }, va, perm).map_err(|_| ())?;
        let pa = walk_existing(unsafe { &mut *child_pt }, va).unwrap().pa();
        write_resident_page(pa, &buf);
        child.paging_mut().record_resident_from_fork(va).map_err(|_| ())?;
    }

    let swaps: alloc::vec::Vec<(usize, usize)> = parent.paging_mut().swap_entries_for_fork().collect();
    for (index, va) in swaps {
        let mut buf = [0u8; PGSIZE];
        parent.paging_mut().read_swap_block(index, &mut buf).map_err(|_| ())?;
        child.paging_mut().write_swap_block(index, &buf).map_err(|_| ())?;
        // A swapped page's permission bits live nowhere but the
        // original PTE, which by definition is non-resident right now;
        // user data pages are always R|W|U, which is what every swap
        // candidate in this kernel actually is.
        map_swapped_out(unsafe { &mut *child_pt }, va, PTE_R | PTE_W | PTE_U)?;
        child.paging_mut().record_swapped_from_fork(index, va);
    }

    Ok(())
}

/// Classic whole-range `uvmcopy`: used for exempt processes' children,
/// which carry no paging metadata to replay.
fn uvmcopy_plain(old: &mut PageTable, new: &mut PageTable, sz: usize) -> Result<(), ()> {
    let mut i = 0;
    while i < sz {
        let pte = walk_existing(old, i).ok_or(())?;
        if !pte.is_valid() {
            return Err(());
        }
        let perm = PTE_FLAGS!(pte.0) & (PTE_R | PTE_W | PTE_X | PTE_U);
        let pa = pte.pa();
        let mut buf = [0u8; PGSIZE];
        read_resident_page(pa, &mut buf);
        if uvmalloc_one(new, i, perm).is_err() {
            return Err(());
        }
        let newpa = walk_existing(new, i).unwrap().pa();
        write_resident_page(newpa, &buf);
        i += PGSIZE;
    }
    Ok(())
}