//! Extended Page Table construction and mutation.
//!
//! ## Background
//!
//! EPT is the second translation stage of Intel VT-x: every guest-physical
//! address produced by the guest's own page tables is walked through a
//! four-level structure (PML4 → PDPT → PD → PT) owned by the hypervisor
//! before it reaches memory. This hypervisor builds an *identity* mapping —
//! guest-physical X maps to host-physical X — out of eager 2 MiB leaves,
//! and only breaks a 2 MiB leaf into 512 4 KiB leaves when a per-page
//! remapping forces it to.
//!
//! Splits draw their page tables from a fixed-capacity per-core arena
//! ([`crate::context::SplitArena`]) so that no allocation ever happens in
//! VMX root mode; the arena is monotonic and only drains at teardown.
//!
//! Directory entries store host-physical frame numbers. To walk the
//! structure host-virtually, each frame is inverted through
//! [`HostMemory::phys_to_virt`]; the structures are allocated from
//! non-pageable executable pool precisely so this inversion is always
//! valid.
//!
//! See Intel SDM Vol. 3C, 28.3 "The Extended Page Table Mechanism".

use crate::addressing::{Gpa, Hpa, Hva, PAGE_SHIFT, PAGE_SIZE, TABLE_ENTRIES};
use crate::context::SplitArena;
use crate::mtrr::{MemoryType, MtrrSnapshot, FIXED_RANGE_PAGES};
use crate::platform::{Cpu, HostMemory};
use crate::HvError;

/// CPUID leaf reporting the physical-address width.
const CPUID_ADDRESS_BITS: u32 = 0x8000_0008;

/// Never map more than 4 PML4 entries (2 TiB of physical space).
pub const MAX_PML4_COUNT: usize = 4;

/// EPT page-walk length programmed into the EPT pointer.
const EPT_PAGE_WALK_LEN: u64 = 4;

/// Frame-number field of a 4 KiB entry (bits 12..52).
const FRAME_4K_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// Frame-number field of a 2 MiB leaf (bits 21..52).
const FRAME_2M_MASK: u64 = 0x000F_FFFF_FFE0_0000;

bitflags::bitflags! {
    /// Access and format bits shared by all EPT entry variants.
    ///
    /// Tables 28-1 through 28-6 of the Intel SDM; the read/write/fetch
    /// triple means the same thing at every level, the large-page bit is
    /// meaningful at the PD level only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptFlags: u64 {
        /// Reads allowed through this entry.
        const READ = 1 << 0;
        /// Writes allowed through this entry.
        const WRITE = 1 << 1;
        /// Instruction fetches allowed through this entry.
        const FETCH = 1 << 2;
        /// This PD entry maps a 2 MiB page instead of referencing a PT.
        const LARGE_PAGE = 1 << 7;
        /// Hardware-recorded access, when EPTP bit 6 enables it.
        const ACCESSED = 1 << 8;
        /// Hardware-recorded write, leaves only.
        const DIRTY = 1 << 9;

        /// The full read+write+fetch permission triple.
        const FULL = Self::READ.bits() | Self::WRITE.bits() | Self::FETCH.bits();
    }
}

/// A 64-bit EPT entry.
///
/// One word, three meanings, discriminated by level and the large-page
/// bit: a directory entry referencing the next table, a 2 MiB leaf, or a
/// 4 KiB leaf. Accessors that only make sense for one variant assert it.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EptEntry(u64);

impl EptEntry {
    /// The absent entry.
    pub const ZERO: EptEntry = EptEntry(0);

    /// A directory entry referencing the next-level table, granting the
    /// full permission triple as all directories here do.
    pub fn directory(table: Hpa) -> Self {
        EptEntry(EptFlags::FULL.bits() | (table.frame_4k() << PAGE_SHIFT))
    }

    /// A 2 MiB identity leaf.
    pub fn leaf_2m(frame_2m: u64, mem_type: MemoryType) -> Self {
        EptEntry(
            EptFlags::FULL.bits()
                | EptFlags::LARGE_PAGE.bits()
                | (mem_type.bits() << 3)
                | (frame_2m << 21),
        )
    }

    /// A 4 KiB leaf with an explicit permission pair.
    pub fn leaf_4k(frame_4k: u64, mem_type: MemoryType, rw: bool, fetch: bool) -> Self {
        let mut entry = EptEntry((mem_type.bits() << 3) | (frame_4k << PAGE_SHIFT));
        entry.remap(frame_4k, rw, fetch);
        entry
    }

    /// Permission and format bits.
    #[inline]
    pub fn flags(self) -> EptFlags {
        EptFlags::from_bits_truncate(self.0)
    }

    /// Whether any access is permitted through this entry. Directory
    /// entries and identity leaves are always built with the full triple,
    /// so a dead-zero word means "absent".
    #[inline]
    pub fn is_present(self) -> bool {
        self.flags().intersects(EptFlags::FULL)
    }

    /// Whether this PD entry maps 2 MiB directly.
    #[inline]
    pub fn is_large_page(self) -> bool {
        self.flags().contains(EptFlags::LARGE_PAGE)
    }

    /// Physical address of the table a directory entry references.
    #[inline]
    pub fn table_address(self) -> Hpa {
        debug_assert!(!self.is_large_page());
        Hpa::new(self.0 & FRAME_4K_MASK)
    }

    /// 2 MiB frame number of a large-page leaf.
    #[inline]
    pub fn frame_2m(self) -> u64 {
        debug_assert!(self.is_large_page());
        (self.0 & FRAME_2M_MASK) >> 21
    }

    /// 4 KiB frame number of a small leaf or directory entry.
    #[inline]
    pub fn frame_4k(self) -> u64 {
        (self.0 & FRAME_4K_MASK) >> PAGE_SHIFT
    }

    /// Leaf memory-type bits (3 bits, leaves only).
    #[inline]
    pub fn memory_type(self) -> u64 {
        (self.0 >> 3) & 0x7
    }

    /// Overwrite the memory type, leaving everything else alone.
    #[inline]
    pub fn set_memory_type(&mut self, mem_type: MemoryType) {
        self.0 = (self.0 & !(0x7 << 3)) | (mem_type.bits() << 3);
    }

    /// Point a 4 KiB leaf at a new frame with a new permission pair,
    /// preserving the memory type established when the page was split.
    #[inline]
    pub fn remap(&mut self, frame_4k: u64, rw: bool, fetch: bool) {
        let perms = (rw as u64) * (EptFlags::READ.bits() | EptFlags::WRITE.bits())
            | (fetch as u64) * EptFlags::FETCH.bits();
        self.0 = (self.0 & !(FRAME_4K_MASK | EptFlags::FULL.bits()))
            | (frame_4k << PAGE_SHIFT)
            | perms;
    }

    /// Raw entry word.
    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EptEntry(0x{:x})", self.0)
    }
}

/// The EPT pointer loaded into the VMCS: write-back paging-structure
/// memory type, a 4-level walk, and the PML4 frame.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EptPointer(u64);

impl EptPointer {
    /// Encode an EPT pointer for a PML4 located at `pml4`.
    pub fn new(pml4: Hpa) -> Self {
        EptPointer(
            MemoryType::WriteBack.bits()
                | ((EPT_PAGE_WALK_LEN - 1) << 3)
                | (pml4.frame_4k() << PAGE_SHIFT),
        )
    }

    /// Decode raw EPT pointer bits.
    pub const fn from_bits(bits: u64) -> Self {
        EptPointer(bits)
    }

    /// Physical address of the PML4.
    pub fn pml4_address(self) -> Hpa {
        Hpa::from_frame_4k((self.0 & FRAME_4K_MASK) >> PAGE_SHIFT)
    }

    /// Raw bits for the VMCS field.
    pub const fn bits(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for EptPointer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "EptPointer(0x{:x})", self.0)
    }
}

/// Number of PML4 entries to populate: one per 512 GiB of physical
/// address space the processor reports, capped at [`MAX_PML4_COUNT`].
pub fn pml4_count<C: Cpu>(cpu: &C) -> usize {
    let phys_bits = cpu.cpuid(CPUID_ADDRESS_BITS, 0).eax & 0xff;
    let shift = phys_bits.saturating_sub(39);
    if shift >= 2 {
        MAX_PML4_COUNT
    } else {
        1 << shift
    }
}

/// The leaf an EPT walk terminated at.
#[derive(Debug, Clone, Copy)]
pub struct EptLeaf {
    pub entry: EptEntry,
    /// Whether the leaf maps 2 MiB (no split has happened here yet).
    pub large: bool,
}

/// One core's four-level EPT structure.
///
/// The struct itself is only a root pointer; the tables live in pool
/// memory and are reached through physical-frame inversion, which is why
/// every method takes the memory collaborator. Freeing is explicit
/// ([`ExtendedPageTable::destroy`]) and happens by traversal, mirroring
/// how the tables were built.
pub struct ExtendedPageTable {
    pml4: Hva,
    pml4_count: usize,
}

/// Reinterpret a table's host-virtual address as its 512 entries.
///
/// # Safety
/// `va` must point at a live page-sized table allocation.
unsafe fn table_mut<'a>(va: Hva) -> &'a mut [EptEntry; TABLE_ENTRIES] {
    &mut *(va.into_u64() as *mut [EptEntry; TABLE_ENTRIES])
}

fn allocate_table<M: HostMemory>(mem: &M, bytes: usize) -> Result<Hva, HvError> {
    mem.allocate(bytes).ok_or(HvError::AllocationFailed)
}

impl ExtendedPageTable {
    /// Build the default identity mapping.
    ///
    /// Allocates the PML4 and, per populated PML4 entry, one PDPT page
    /// plus one contiguous array of 512 page directories whose entries
    /// are 2 MiB identity leaves. Leaf memory types start uncacheable and
    /// are then overlaid with the MTRR configuration: variable ranges
    /// per 2 MiB leaf, and the fixed ranges over the first MiB (which
    /// costs one slot of `arena`).
    ///
    /// On any failure everything allocated so far is freed and the error
    /// is returned; nothing is retained.
    pub fn build<P: HostMemory + Cpu>(
        p: &P,
        mtrrs: &MtrrSnapshot,
        arena: &mut SplitArena,
    ) -> Result<Self, HvError> {
        let count = pml4_count(p);
        let pml4_va = allocate_table(p, PAGE_SIZE)?;

        for index in 0..count {
            if let Err(e) = Self::populate_pml4_entry(p, pml4_va, index) {
                Self::destroy_entries(p, pml4_va, index);
                p.free(pml4_va);
                return Err(e);
            }
        }

        let this = ExtendedPageTable { pml4: pml4_va, pml4_count: count };

        if mtrrs.active() {
            if let Err(e) = this.apply_variable_mtrrs(p, mtrrs) {
                this.destroy(p);
                return Err(e);
            }
            if mtrrs.fixed_overlay() {
                if let Err(e) = this.apply_fixed_mtrrs(p, mtrrs, arena) {
                    this.destroy(p);
                    return Err(e);
                }
            }
        }

        Ok(this)
    }

    /// Reconstruct the handle from EPT pointer bits, the inverse of
    /// [`ExtendedPageTable::eptp`]. This is how the root-mode handler and
    /// the teardown path recover the structure a core owns.
    pub fn from_eptp<P: HostMemory + Cpu>(p: &P, eptp: EptPointer) -> Self {
        ExtendedPageTable {
            pml4: p.phys_to_virt(eptp.pml4_address()),
            pml4_count: pml4_count(p),
        }
    }

    /// EPT pointer bits for the VMCS.
    pub fn eptp<M: HostMemory>(&self, mem: &M) -> EptPointer {
        EptPointer::new(mem.virt_to_phys(self.pml4))
    }

    fn populate_pml4_entry<M: HostMemory>(
        mem: &M,
        pml4_va: Hva,
        index: usize,
    ) -> Result<(), HvError> {
        let pdpt_va = allocate_table(mem, PAGE_SIZE)?;
        // All 512 page directories of this entry in one contiguous
        // allocation; teardown frees it through PDPT[0].
        let pd_array_va = match allocate_table(mem, TABLE_ENTRIES * PAGE_SIZE) {
            Ok(va) => va,
            Err(e) => {
                mem.free(pdpt_va);
                return Err(e);
            }
        };

        let pml4 = unsafe { table_mut(pml4_va) };
        pml4[index] = EptEntry::directory(mem.virt_to_phys(pdpt_va));

        let pdpt = unsafe { table_mut(pdpt_va) };
        for pdpt_index in 0..TABLE_ENTRIES {
            let pd_va = pd_array_va + (pdpt_index * PAGE_SIZE) as u64;
            pdpt[pdpt_index] = EptEntry::directory(mem.virt_to_phys(pd_va));

            let pd = unsafe { table_mut(pd_va) };
            for pd_index in 0..TABLE_ENTRIES {
                let gpa = Gpa::from_indices(index, pdpt_index, pd_index);
                // Memory type stays UC until the MTRR passes run.
                pd[pd_index] = EptEntry::leaf_2m(gpa.frame_2m(), MemoryType::Uncacheable);
            }
        }
        Ok(())
    }

    fn apply_variable_mtrrs<M: HostMemory>(
        &self,
        mem: &M,
        mtrrs: &MtrrSnapshot,
    ) -> Result<(), HvError> {
        let pml4 = unsafe { table_mut(self.pml4) };
        for pml4e in pml4.iter().take(self.pml4_count) {
            let pdpt = unsafe { table_mut(mem.phys_to_virt(pml4e.table_address())) };
            for pdpte in pdpt.iter() {
                let pd = unsafe { table_mut(mem.phys_to_virt(pdpte.table_address())) };
                for pde in pd.iter_mut() {
                    let leaf_address = pde.frame_2m() << 21;
                    pde.set_memory_type(mtrrs.resolve(leaf_address)?);
                }
            }
        }
        Ok(())
    }

    fn apply_fixed_mtrrs<M: HostMemory>(
        &self,
        mem: &M,
        mtrrs: &MtrrSnapshot,
        arena: &mut SplitArena,
    ) -> Result<(), HvError> {
        // The fixed ranges cover the first MiB, inside the very first
        // 2 MiB leaf: split it and rewrite the first 256 leaf types.
        let pml4 = unsafe { table_mut(self.pml4) };
        let pdpt = unsafe { table_mut(mem.phys_to_virt(pml4[0].table_address())) };
        let pd = unsafe { table_mut(mem.phys_to_virt(pdpt[0].table_address())) };
        split_large_page(mem, arena, &mut pd[0])?;

        let pt = unsafe { table_mut(mem.phys_to_virt(pd[0].table_address())) };
        let types = mtrrs.fixed_page_types();
        for (pte, mem_type) in pt.iter_mut().zip(types.iter()).take(FIXED_RANGE_PAGES) {
            pte.set_memory_type(*mem_type);
        }
        Ok(())
    }

    /// Walk to the leaf covering `guest`, without changing anything.
    pub fn walk<M: HostMemory>(&self, mem: &M, guest: Gpa) -> Option<EptLeaf> {
        let pml4 = unsafe { table_mut(self.pml4) };
        let pml4e = pml4[guest.pml4_index()];
        if !pml4e.is_present() {
            return None;
        }
        let pdpt = unsafe { table_mut(mem.phys_to_virt(pml4e.table_address())) };
        let pdpte = pdpt[guest.pdpt_index()];
        if !pdpte.is_present() {
            return None;
        }
        let pd = unsafe { table_mut(mem.phys_to_virt(pdpte.table_address())) };
        let pde = pd[guest.pd_index()];
        if pde.is_large_page() {
            return Some(EptLeaf { entry: pde, large: true });
        }
        if !pde.is_present() {
            return None;
        }
        let pt = unsafe { table_mut(mem.phys_to_virt(pde.table_address())) };
        // A dormant 4 KiB leaf carries no permissions at all, but it is
        // still the leaf; report it as-is.
        Some(EptLeaf { entry: pt[guest.pt_index()], large: false })
    }

    /// Redirect the 4 KiB leaf of `guest` at `target` with the given
    /// permission pair, splitting the covering 2 MiB page first if it is
    /// still whole. The leaf's memory type is whatever the split
    /// established and is left untouched.
    ///
    /// Fails with [`HvError::SplitCapacity`] if a split is needed and the
    /// arena is exhausted; nothing changes in that case.
    pub fn change_mapping<M: HostMemory>(
        &mut self,
        mem: &M,
        arena: &mut SplitArena,
        guest: Gpa,
        target: Hpa,
        rw: bool,
        fetch: bool,
    ) -> Result<(), HvError> {
        let pml4 = unsafe { table_mut(self.pml4) };
        let pml4e = pml4[guest.pml4_index()];
        assert!(
            pml4e.is_present(),
            "ept: remapping {guest} outside the identity-mapped range"
        );
        let pdpt = unsafe { table_mut(mem.phys_to_virt(pml4e.table_address())) };
        let pd = unsafe {
            table_mut(mem.phys_to_virt(pdpt[guest.pdpt_index()].table_address()))
        };
        let pde = &mut pd[guest.pd_index()];

        if pde.is_large_page() {
            split_large_page(mem, arena, pde)?;
        }

        let pt = unsafe { table_mut(mem.phys_to_virt(pde.table_address())) };
        pt[guest.pt_index()].remap(target.frame_4k(), rw, fetch);
        Ok(())
    }

    /// Free the whole structure by traversal, in reverse build order.
    pub fn destroy<M: HostMemory>(self, mem: &M) {
        Self::destroy_entries(mem, self.pml4, self.pml4_count);
        mem.free(self.pml4);
    }

    fn destroy_entries<M: HostMemory>(mem: &M, pml4_va: Hva, populated: usize) {
        let pml4 = unsafe { table_mut(pml4_va) };
        for pml4e in pml4.iter().take(populated) {
            let pdpt_va = mem.phys_to_virt(pml4e.table_address());
            let pdpt = unsafe { table_mut(pdpt_va) };
            // The 512 page directories are one allocation, addressed by
            // the first PDPT entry.
            let pd_array_va = mem.phys_to_virt(pdpt[0].table_address());
            mem.free(pd_array_va);
            mem.free(pdpt_va);
        }
    }
}

/// Replace a 2 MiB leaf with a directory entry over a fresh page table
/// whose 512 entries reproduce the same mapping at 4 KiB granularity:
/// full permissions, the parent's memory type, consecutive frames.
fn split_large_page<M: HostMemory>(
    mem: &M,
    arena: &mut SplitArena,
    pde: &mut EptEntry,
) -> Result<(), HvError> {
    let slot = arena.take().ok_or(HvError::SplitCapacity)?;

    let mem_type =
        MemoryType::from_bits(pde.memory_type()).unwrap_or(MemoryType::Uncacheable);
    let parent_frame = pde.frame_2m();

    for (index, pte) in slot.iter_mut().enumerate() {
        *pte = EptEntry::leaf_4k(
            TABLE_ENTRIES as u64 * parent_frame + index as u64,
            mem_type,
            true,
            true,
        );
    }

    let slot_pa = mem.virt_to_phys(Hva::new(slot.as_ptr() as u64));
    *pde = EptEntry::directory(slot_pa);
    log::debug!(
        "ept: split 2 MiB leaf at frame {parent_frame:#x} into pt at {slot_pa}"
    );
    Ok(())
}
