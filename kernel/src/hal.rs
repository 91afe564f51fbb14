//! Narrow contracts onto the collaborators this kernel core treats as
//! external: the physical-page allocator, the page-table walker, and the
//! per-process swap file. Each is a real, if small, surface rather than a
//! mock — `vm::KernelAddressSpace` and `InMemorySwapFile` below back every
//! non-test build — but keeping them behind a trait lets the paging engine
//! be exercised with plain host unit tests, matching how the scheduler and
//! process table are tested elsewhere in this crate.

use crate::riscv::PGSIZE;

/// One address space's view onto its own page table, from the paging
/// engine's perspective: flip a leaf entry between resident and
/// swapped-out, and move bytes to and from whatever physical page backs
/// a resident entry.
pub trait AddressSpace {
    /// True if `va`'s rounded-down page has a *resident* leaf mapping
    /// (`V=1, PG=0`).
    fn is_resident(&mut self, va: usize) -> bool;
    /// True if `va`'s rounded-down page has a *swapped-out* leaf mapping
    /// (`V=0, PG=1`).
    fn is_swapped_out(&mut self, va: usize) -> bool;
    /// Read and clear the hardware Accessed bit for `va`'s leaf entry.
    /// Panics (in debug builds) if there is no resident mapping at `va`.
    fn take_accessed(&mut self, va: usize) -> bool;
    /// Allocate a fresh physical page and map it resident at `va` with
    /// `perm`. Fails on physical-memory exhaustion.
    fn alloc_resident(&mut self, va: usize, perm: usize) -> Result<(), ()>;
    /// Read the resident page at `va` into `buf`.
    fn read_resident(&mut self, va: usize, buf: &mut [u8; PGSIZE]);
    /// Overwrite the resident page at `va` with `buf`.
    fn write_resident(&mut self, va: usize, buf: &[u8; PGSIZE]);
    /// Remember the permission bits of the resident page at `va`, clear
    /// its mapping to swapped-out, and free the backing physical page.
    fn evict_resident(&mut self, va: usize) -> usize;
    /// Flip a swapped-out mapping at `va` back to resident, reusing the
    /// permission bits captured by a prior `evict_resident`.
    fn restore_resident(&mut self, va: usize, perm: usize) -> Result<(), ()>;
}

/// A process's swap file: a flat, page-indexed byte store. Out of scope
/// per the core's charter is *how* these bytes reach a disk; in this
/// crate every address space is backed by `InMemorySwapFile`, which
/// satisfies the same "seekable byte file" contract a real inode-backed
/// file would.
pub trait SwapFile {
    fn read_page(&self, index: usize, buf: &mut [u8; PGSIZE]) -> Result<(), ()>;
    fn write_page(&mut self, index: usize, buf: &[u8; PGSIZE]) -> Result<(), ()>;
    fn truncate(&mut self);
}

/// Fixed-capacity, in-memory backing for a process's swap file. `N` is
/// the number of swap-file slots the owning address space is allowed
/// (`MAX_SWAP_PAGES`).
pub struct InMemorySwapFile<const N: usize> {
    pages: [[u8; PGSIZE]; N],
    present: [bool; N],
}

impl<const N: usize> InMemorySwapFile<N> {
    pub const fn new() -> Self {
        InMemorySwapFile {
            pages: [[0u8; PGSIZE]; N],
            present: [false; N],
        }
    }
}

impl<const N: usize> SwapFile for InMemorySwapFile<N> {
    fn read_page(&self, index: usize, buf: &mut [u8; PGSIZE]) -> Result<(), ()> {
        if index >= N || !self.present[index] {
            return Err(());
        }
        buf.copy_from_slice(&self.pages[index]);
        Ok(())
    }

    fn write_page(&mut self, index: usize, buf: &[u8; PGSIZE]) -> Result<(), ()> {
        if index >= N {
            return Err(());
        }
        self.pages[index].copy_from_slice(buf);
        self.present[index] = true;
        Ok(())
    }

    fn truncate(&mut self) {
        self.present = [false; N];
    }
}
