//! Per-address-space paging metadata and the swap engine.
//!
//! Two parallel fixed-capacity vectors track a process's user pages:
//! `memory` (resident pages, length `MAX_PSYC_PAGES`) and `swap` (pages
//! currently written out to the process's swap file, length
//! `MAX_SWAP_PAGES`). Exactly one of the two vectors may claim a given
//! virtual address at a time, mirroring the page-table invariant that a
//! mapped VA is either `V=1,PG=0` or `V=0,PG=1`, never both and never
//! neither.
//!
//! One build-time policy governs eviction: [`PAGING_POLICY`]. `NONE`
//! disables swapping outright — any attempt to evict panics, matching the
//! source's behaviour under that configuration.

use crate::hal::{AddressSpace, InMemorySwapFile, SwapFile};
use crate::param::{PagingPolicy, MAX_PSYC_PAGES, MAX_SWAP_PAGES, PAGING_POLICY};
use crate::riscv::PGSIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagingError {
    /// No free memory entry and no free swap entry either: the process
    /// has hit its `MAX_TOTAL_PAGES` ceiling.
    OutOfPages,
    /// The swap file rejected a read or write.
    Io,
    /// `handle_page_fault` was invoked on a PTE that wasn't actually
    /// paged out; not our fault to handle.
    NotOurFault,
}

#[derive(Clone, Copy, Debug, Default)]
struct MemoryEntry {
    present: bool,
    va: usize,
    /// Meaningful only under NFUA/LAPA; updated once per tick by `on_tick`.
    age: u32,
}

#[derive(Clone, Copy, Debug, Default)]
struct SwapEntry {
    present: bool,
    va: usize,
}

/// Per-address-space paging bookkeeping plus the process's swap file.
pub struct PagingState {
    memory: [MemoryEntry; MAX_PSYC_PAGES],
    swap: [SwapEntry; MAX_SWAP_PAGES],
    pages_in_memory: usize,
    pages_in_disk: usize,
    /// Anchor for the SCFIFO circular scan; meaningless under other
    /// policies.
    scfifo_index: usize,
    pgfault_count: u32,
    /// init and the shell bypass paging entirely: every page they touch
    /// is mapped directly with no bookkeeping and never swapped.
    exempt: bool,
    swap_file: InMemorySwapFile<MAX_SWAP_PAGES>,
}

impl PagingState {
    pub const fn new() -> Self {
        PagingState {
            memory: [MemoryEntry {
                present: false,
                va: 0,
                age: 0,
            }; MAX_PSYC_PAGES],
            swap: [SwapEntry {
                present: false,
                va: 0,
            }; MAX_SWAP_PAGES],
            pages_in_memory: 0,
            pages_in_disk: 0,
            scfifo_index: 0,
            pgfault_count: 0,
            exempt: false,
            swap_file: InMemorySwapFile::new(),
        }
    }

    pub fn reset(&mut self, exempt: bool) {
        *self = PagingState::new();
        self.exempt = exempt;
    }

    pub fn pages_in_memory(&self) -> usize {
        self.pages_in_memory
    }
    pub fn pages_in_disk(&self) -> usize {
        self.pages_in_disk
    }
    pub fn pgfault_count(&self) -> u32 {
        self.pgfault_count
    }
    pub fn is_exempt(&self) -> bool {
        self.exempt
    }

    /// Every `(swap-index, va)` the fork path needs to replicate into
    /// the child's own swap file at matching offsets (4.C.3).
    pub(crate) fn swap_entries_for_fork(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.swap.iter().enumerate().filter_map(|(i, e)| e.present.then_some((i, e.va)))
    }

    /// Every resident virtual address the fork path needs to replicate
    /// (by performing the equivalent of `insert_va_to_memory`) into the
    /// child.
    pub(crate) fn memory_vas_for_fork(&self) -> impl Iterator<Item = usize> + '_ {
        self.memory.iter().filter_map(|e| e.present.then_some(e.va))
    }

    /// The fork path copies parent bytes into the child's page itself
    /// (it already has an `AddressSpace` handle open on the child); this
    /// just records the bookkeeping `insert_va_to_memory` would have
    /// done, without the policy-driven eviction (the child starts empty,
    /// so there is always room up to `MAX_PSYC_PAGES`).
    pub(crate) fn record_resident_from_fork(&mut self, va: usize) -> Result<(), PagingError> {
        let slot = self.find_free_memory().ok_or(PagingError::OutOfPages)?;
        self.memory[slot] = MemoryEntry { present: true, va, age: 0 };
        self.pages_in_memory += 1;
        Ok(())
    }

    /// Mirror of `record_resident_from_fork` for a swap entry: the byte
    /// copy into the child's swap file happens at the same index the
    /// parent used (the child's swap file starts empty, so that index is
    /// always free).
    pub(crate) fn record_swapped_from_fork(&mut self, index: usize, va: usize) {
        self.swap[index] = SwapEntry { present: true, va };
        self.pages_in_disk += 1;
    }

    /// Copy one page's raw bytes out of this address space's swap file,
    /// for the fork path to write into the child's swap file at the same
    /// offset.
    pub(crate) fn read_swap_block(&self, index: usize, buf: &mut [u8; PGSIZE]) -> Result<(), PagingError> {
        self.swap_file.read_page(index, buf).map_err(|_| PagingError::Io)
    }

    /// Write a page of raw bytes directly into this (child) address
    /// space's swap file at `index`, bypassing the normal alloc/evict
    /// path since the index is known to be free.
    pub(crate) fn write_swap_block(&mut self, index: usize, buf: &[u8; PGSIZE]) -> Result<(), PagingError> {
        self.swap_file.write_page(index, buf).map_err(|_| PagingError::Io)
    }

    /// `exec`'s discard-old-metadata step: drop every memory/swap entry
    /// and truncate the backing swap file.
    pub fn truncate(&mut self) {
        let exempt = self.exempt;
        *self = PagingState::new();
        self.exempt = exempt;
        self.swap_file.truncate();
    }

    /// `pgfault_reset()` syscall: returns the count since the last call
    /// and zeroes it.
    pub fn take_pgfault_count(&mut self) -> u32 {
        let c = self.pgfault_count;
        self.pgfault_count = 0;
        c
    }

    fn find_free_memory(&self) -> Option<usize> {
        self.memory.iter().position(|e| !e.present)
    }
    fn find_free_swap(&self) -> Option<usize> {
        self.swap.iter().position(|e| !e.present)
    }
    fn find_memory_by_va(&self, va: usize) -> Option<usize> {
        self.memory.iter().position(|e| e.present && e.va == va)
    }
    fn find_swap_by_va(&self, va: usize) -> Option<usize> {
        self.swap.iter().position(|e| e.present && e.va == va)
    }

    /// Reserve a memory entry for `va`, evicting via the active policy
    /// if the resident set is already full. Exempt address spaces
    /// short-circuit: the caller still maps the page, we just don't
    /// track it.
    pub fn insert_va_to_memory(
        &mut self,
        as_: &mut impl AddressSpace,
        va: usize,
    ) -> Result<(), PagingError> {
        if self.exempt {
            return Ok(());
        }
        let slot = if let Some(i) = self.find_free_memory() {
            i
        } else {
            self.evict_one(as_)?;
            self.find_free_memory().ok_or(PagingError::OutOfPages)?
        };
        self.memory[slot] = MemoryEntry {
            present: true,
            va,
            age: 0,
        };
        self.pages_in_memory += 1;
        Ok(())
    }

    /// Clear whichever entry currently holds `va` (memory or swap). For
    /// SCFIFO, removing a memory entry compacts the vector around the
    /// anchor so the circular scan order survives the hole.
    pub fn remove_va(&mut self, va: usize) {
        if let Some(i) = self.find_memory_by_va(va) {
            self.memory[i] = MemoryEntry::default();
            self.pages_in_memory -= 1;
            if PAGING_POLICY == PagingPolicy::Scfifo {
                self.compact_memory_around_anchor(i);
            }
            return;
        }
        if let Some(i) = self.find_swap_by_va(va) {
            self.swap[i] = SwapEntry::default();
            self.pages_in_disk -= 1;
        }
    }

    /// SCFIFO removal of a non-anchor entry must slide later entries
    /// down so the anchor index keeps pointing at the same logical
    /// successor in the circular order.
    fn compact_memory_around_anchor(&mut self, removed: usize) {
        let n = self.memory.len();
        if removed == self.scfifo_index {
            return;
        }
        let mut i = removed;
        loop {
            let next = (i + 1) % n;
            if next == self.scfifo_index {
                break;
            }
            self.memory[i] = self.memory[next];
            i = next;
        }
        if self.scfifo_index > 0 {
            self.scfifo_index -= 1;
        }
    }

    /// Evict one resident page (selected by the active policy) to a
    /// free swap slot, making room in `memory`.
    fn evict_one(&mut self, as_: &mut impl AddressSpace) -> Result<(), PagingError> {
        if PAGING_POLICY == PagingPolicy::None {
            panic!("paging: eviction requested under PagingPolicy::None");
        }
        if PAGING_POLICY == PagingPolicy::Scfifo {
            return self.evict_one_scfifo(as_);
        }
        let victim = self.pick_victim().ok_or(PagingError::OutOfPages)?;
        let sfe = self.find_free_swap().ok_or(PagingError::OutOfPages)?;
        self.swap_page_out(as_, victim, sfe)
    }

    /// Write the physical page behind `memory[mpe]` out to swap slot
    /// `sfe`, flip its PTE to swapped-out, and free the memory entry.
    fn swap_page_out(
        &mut self,
        as_: &mut impl AddressSpace,
        mpe: usize,
        sfe: usize,
    ) -> Result<(), PagingError> {
        let va = self.memory[mpe].va;
        if !self.memory[mpe].present {
            panic!("swap_page_out: memory entry not present");
        }
        if !as_.is_resident(va) {
            panic!("swap_page_out: PTE not resident for tracked memory entry");
        }
        let mut buf = [0u8; PGSIZE];
        as_.read_resident(va, &mut buf);
        self.swap_file.write_page(sfe, &buf).map_err(|_| PagingError::Io)?;
        as_.evict_resident(va);
        self.swap[sfe] = SwapEntry { present: true, va };
        self.memory[mpe] = MemoryEntry::default();
        self.pages_in_memory -= 1;
        self.pages_in_disk += 1;
        if PAGING_POLICY == PagingPolicy::Scfifo && mpe == self.scfifo_index {
            self.scfifo_index = (self.scfifo_index + 1) % self.memory.len().max(1);
        }
        Ok(())
    }

    /// Read swap slot `sfe` back in, optionally evicting `victim_mpe`
    /// first to free the memory entry it will occupy. Read-before-write
    /// is mandatory: `sfe`'s on-disk bytes are read into a local buffer
    /// *before* the victim's page is written into that same slot, so a
    /// shared slot never loses data it still needs.
    fn swap_page_in(
        &mut self,
        as_: &mut impl AddressSpace,
        sfe: usize,
        victim_mpe: Option<usize>,
    ) -> Result<(), PagingError> {
        let fault_va = self.swap[sfe].va;
        let mut incoming = [0u8; PGSIZE];
        self.swap_file.read_page(sfe, &mut incoming).map_err(|_| PagingError::Io)?;

        let mpe = match victim_mpe {
            Some(mpe) => {
                let victim_va = self.memory[mpe].va;
                let mut victim_buf = [0u8; PGSIZE];
                as_.read_resident(victim_va, &mut victim_buf);
                self.swap_file
                    .write_page(sfe, &victim_buf)
                    .map_err(|_| PagingError::Io)?;
                as_.evict_resident(victim_va);
                self.swap[sfe] = SwapEntry {
                    present: true,
                    va: victim_va,
                };
                self.memory[mpe] = MemoryEntry::default();
                mpe
            }
            None => {
                self.swap[sfe] = SwapEntry::default();
                self.pages_in_disk -= 1;
                self.find_free_memory().ok_or(PagingError::OutOfPages)?
            }
        };

        as_.restore_resident(fault_va, 0).map_err(|_| PagingError::Io)?;
        as_.write_resident(fault_va, &incoming);
        self.memory[mpe] = MemoryEntry {
            present: true,
            va: fault_va,
            age: 0,
        };
        if victim_mpe.is_none() {
            self.pages_in_memory += 1;
        }
        Ok(())
    }

    /// Consulted by the trap handler on a non-present user page fault.
    /// `va` need not be page-aligned.
    pub fn handle_page_fault(
        &mut self,
        as_: &mut impl AddressSpace,
        va: usize,
    ) -> Result<(), PagingError> {
        let va = crate::PGROUNDDOWN!(va);
        if as_.is_resident(va) {
            // V=1: this fault wasn't ours to handle (e.g. a permission
            // fault on a present page).
            return Err(PagingError::NotOurFault);
        }
        if !as_.is_swapped_out(va) {
            return Err(PagingError::NotOurFault);
        }
        let sfe = self.find_swap_by_va(va).ok_or(PagingError::NotOurFault)?;
        let target_mpe = if self.pages_in_memory >= MAX_PSYC_PAGES {
            Some(self.pick_victim_any(as_).ok_or(PagingError::OutOfPages)?)
        } else {
            None
        };
        self.swap_page_in(as_, sfe, target_mpe)?;
        self.pgfault_count += 1;
        Ok(())
    }

    /// Per-tick aging/accessed-bit bookkeeping for NFUA and LAPA. A no-op
    /// under SCFIFO (which samples the Accessed bit lazily during the
    /// scan) and NONE.
    pub fn on_tick(&mut self, as_: &mut impl AddressSpace) {
        match PAGING_POLICY {
            PagingPolicy::Nfua | PagingPolicy::Lapa => {
                for e in self.memory.iter_mut() {
                    if !e.present {
                        continue;
                    }
                    let accessed = as_.take_accessed(e.va);
                    e.age >>= 1;
                    if accessed {
                        e.age |= 1 << 31;
                    }
                }
            }
            PagingPolicy::Scfifo | PagingPolicy::None => {}
        }
    }

    fn pick_victim(&mut self) -> Option<usize> {
        match PAGING_POLICY {
            PagingPolicy::Nfua => self.pick_victim_nfua(),
            PagingPolicy::Lapa => self.pick_victim_lapa(),
            PagingPolicy::Scfifo => None, // resolved by caller via `pick_victim_scfifo`
            PagingPolicy::None => panic!("paging: pick_victim under PagingPolicy::None"),
        }
    }

    /// Policy-dispatching victim pick for call sites (like
    /// `handle_page_fault`) that have an `AddressSpace` on hand and so
    /// can support SCFIFO's Accessed-bit scan too.
    fn pick_victim_any(&mut self, as_: &mut impl AddressSpace) -> Option<usize> {
        if PAGING_POLICY == PagingPolicy::Scfifo {
            self.pick_victim_scfifo(as_)
        } else {
            self.pick_victim()
        }
    }

    fn pick_victim_nfua(&self) -> Option<usize> {
        // Lowest numeric age wins; ties favour the later entry.
        let mut best: Option<(usize, u32)> = None;
        for (i, e) in self.memory.iter().enumerate() {
            if !e.present {
                continue;
            }
            match best {
                None => best = Some((i, e.age)),
                Some((_, age)) if e.age <= age => best = Some((i, e.age)),
                _ => {}
            }
        }
        best.map(|(i, _)| i)
    }

    fn pick_victim_lapa(&self) -> Option<usize> {
        // Fewest set bits in `age` wins; ties broken the NFUA way (lowest
        // numeric age, later entry wins a further tie).
        let mut best: Option<(usize, u32, u32)> = None; // (index, popcount, age)
        for (i, e) in self.memory.iter().enumerate() {
            if !e.present {
                continue;
            }
            let pc = e.age.count_ones();
            match best {
                None => best = Some((i, pc, e.age)),
                Some((_, bpc, bage)) => {
                    if pc < bpc || (pc == bpc && e.age <= bage) {
                        best = Some((i, pc, e.age));
                    }
                }
            }
        }
        best.map(|(i, _, _)| i)
    }
}

impl PagingState {
    /// SCFIFO's victim selection needs PTE access to read and clear the
    /// Accessed bit during the scan, so unlike NFUA/LAPA it cannot be a
    /// pure function of `self`. Called from `evict_one` instead of
    /// `pick_victim` when the active policy is SCFIFO.
    fn pick_victim_scfifo(&mut self, as_: &mut impl AddressSpace) -> Option<usize> {
        let n = self.memory.len();
        if self.pages_in_memory == 0 {
            return None;
        }
        for _ in 0..n {
            let i = self.scfifo_index;
            self.scfifo_index = (self.scfifo_index + 1) % n;
            if !self.memory[i].present {
                continue;
            }
            if as_.take_accessed(self.memory[i].va) {
                continue;
            }
            return Some(i);
        }
        // One full revolution guarantees an eviction: every resident
        // entry had its Accessed bit cleared above, so a second pass
        // must find one.
        for _ in 0..n {
            let i = self.scfifo_index;
            self.scfifo_index = (self.scfifo_index + 1) % n;
            if self.memory[i].present {
                return Some(i);
            }
        }
        None
    }
}

// `evict_one` dispatches to the SCFIFO path separately because it needs
// `&mut impl AddressSpace` for the scan itself, not just for the final
// write-out.
impl PagingState {
    fn evict_one_scfifo(&mut self, as_: &mut impl AddressSpace) -> Result<(), PagingError> {
        let victim = self.pick_victim_scfifo(as_).ok_or(PagingError::OutOfPages)?;
        let sfe = self.find_free_swap().ok_or(PagingError::OutOfPages)?;
        self.swap_page_out(as_, victim, sfe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riscv::PGSIZE;
    use std::collections::HashMap;

    /// A host-side stand-in for a process's page table: just enough state
    /// (resident/swapped/accessed/bytes) to drive the eviction and
    /// fault-handling logic through its paces without real hardware.
    struct FakeSpace {
        resident: HashMap<usize, ([u8; PGSIZE], bool, usize)>, // va -> (bytes, accessed, perm)
        swapped_perm: HashMap<usize, usize>,
    }

    impl FakeSpace {
        fn new() -> Self {
            FakeSpace {
                resident: HashMap::new(),
                swapped_perm: HashMap::new(),
            }
        }
        fn map(&mut self, va: usize, byte0: u8) {
            let mut buf = [0u8; PGSIZE];
            buf[0] = byte0;
            self.resident.insert(va, (buf, false, 0));
        }
    }

    impl AddressSpace for FakeSpace {
        fn is_resident(&mut self, va: usize) -> bool {
            self.resident.contains_key(&va)
        }
        fn is_swapped_out(&mut self, va: usize) -> bool {
            self.swapped_perm.contains_key(&va)
        }
        fn take_accessed(&mut self, va: usize) -> bool {
            let e = self.resident.get_mut(&va).expect("take_accessed: not resident");
            let was = e.1;
            e.1 = false;
            was
        }
        fn alloc_resident(&mut self, va: usize, perm: usize) -> Result<(), ()> {
            self.resident.insert(va, ([0u8; PGSIZE], false, perm));
            Ok(())
        }
        fn read_resident(&mut self, va: usize, buf: &mut [u8; PGSIZE]) {
            *buf = self.resident.get(&va).expect("read: not resident").0;
        }
        fn write_resident(&mut self, va: usize, buf: &[u8; PGSIZE]) {
            self.resident.get_mut(&va).expect("write: not resident").0 = *buf;
        }
        fn evict_resident(&mut self, va: usize) -> usize {
            let (_, _, perm) = self.resident.remove(&va).expect("evict: not resident");
            self.swapped_perm.insert(va, perm);
            perm
        }
        fn restore_resident(&mut self, va: usize, _perm: usize) -> Result<(), ()> {
            let perm = self.swapped_perm.remove(&va).unwrap_or(0);
            self.resident.insert(va, ([0u8; PGSIZE], false, perm));
            Ok(())
        }
    }

    #[test]
    fn insert_and_fault_roundtrip_preserves_bytes() {
        let mut space = FakeSpace::new();
        let mut pg = PagingState::new();
        space.map(0x1000, 7);
        pg.insert_va_to_memory(&mut space, 0x1000).unwrap();
        assert_eq!(pg.pages_in_memory(), 1);

        // force it out to swap by hand, the way a real evict_one would
        pg.swap[0] = SwapEntry::default();
        let mpe = pg.find_memory_by_va(0x1000).unwrap();
        pg.swap_page_out(&mut space, mpe, 0).unwrap();
        assert!(space.is_swapped_out(0x1000));
        assert_eq!(pg.pages_in_disk(), 1);

        pg.handle_page_fault(&mut space, 0x1000).unwrap();
        assert!(space.is_resident(0x1000));
        assert_eq!(pg.pgfault_count(), 1);
        let mut buf = [0u8; PGSIZE];
        space.read_resident(0x1000, &mut buf);
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn nfua_picks_lowest_age_ties_to_later_entry() {
        let mut pg = PagingState::new();
        pg.memory[0] = MemoryEntry { present: true, va: 0x1000, age: 5 };
        pg.memory[1] = MemoryEntry { present: true, va: 0x2000, age: 5 };
        pg.memory[2] = MemoryEntry { present: true, va: 0x3000, age: 9 };
        assert_eq!(pg.pick_victim_nfua(), Some(1));
    }

    #[test]
    fn lapa_picks_fewest_set_bits() {
        let mut pg = PagingState::new();
        pg.memory[0] = MemoryEntry { present: true, va: 0x1000, age: 0b111 };
        pg.memory[1] = MemoryEntry { present: true, va: 0x2000, age: 0b1 };
        pg.memory[2] = MemoryEntry { present: true, va: 0x3000, age: 0b11 };
        assert_eq!(pg.pick_victim_lapa(), Some(1));
    }

    #[test]
    fn scfifo_gives_accessed_pages_a_second_chance() {
        let mut space = FakeSpace::new();
        let mut pg = PagingState::new();
        for (i, va) in [0x1000usize, 0x2000, 0x3000].iter().enumerate() {
            space.map(*va, 0);
            pg.memory[i] = MemoryEntry { present: true, va: *va, age: 0 };
        }
        pg.pages_in_memory = 3;
        space.resident.get_mut(&0x1000).unwrap().1 = true; // accessed
        let victim = pg.pick_victim_scfifo(&mut space);
        // 0x1000 gets a second chance (accessed bit cleared, skipped);
        // 0x2000 is evicted first.
        assert_eq!(victim, Some(1));
        assert!(!space.resident.get(&0x1000).unwrap().1);
    }

    #[test]
    fn full_revolution_guarantees_eviction_under_scfifo() {
        let mut space = FakeSpace::new();
        let mut pg = PagingState::new();
        for (i, va) in [0x1000usize, 0x2000].iter().enumerate() {
            space.map(*va, 0);
            space.resident.get_mut(va).unwrap().1 = true;
            pg.memory[i] = MemoryEntry { present: true, va: *va, age: 0 };
        }
        pg.pages_in_memory = 2;
        assert!(pg.pick_victim_scfifo(&mut space).is_some());
    }

    #[test]
    fn exempt_address_space_bypasses_bookkeeping() {
        let mut space = FakeSpace::new();
        let mut pg = PagingState::new();
        pg.reset(true);
        space.map(0x9000, 1);
        pg.insert_va_to_memory(&mut space, 0x9000).unwrap();
        assert_eq!(pg.pages_in_memory(), 0);
    }
}
