//! Per-core hypervisor state.
//!
//! Every logical core owns one [`LogicalCore`] record: its VMXON and VMCS
//! regions, MSR bitmap, root-mode stack, split arena, and mapping table.
//! The records are disjoint; nothing is shared across cores except the
//! system CR3 captured once at enable time. A spin lock guards each
//! record; in practice it is uncontended because a core's record is only
//! touched from that core.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::addressing::{Hpa, Hva, PAGE_SIZE, TABLE_ENTRIES};
use crate::ept::EptEntry;
use crate::HvError;

/// Size of the VMXON and VMCS regions.
pub const VMX_REGION_SIZE: usize = PAGE_SIZE;
/// Size of the MSR bitmap.
pub const MSR_BITMAP_SIZE: usize = PAGE_SIZE;
/// Size of the per-core root-mode stack.
pub const ROOT_MODE_STACK_SIZE: usize = 32768;
/// Number of 2 MiB→4 KiB splits a core can perform before teardown.
pub const SPLIT_CAPACITY: usize = 32;
/// Number of simultaneous changed mappings a core can hold.
pub const MAPPING_CAPACITY: usize = 32;

/// A page-sized, page-aligned region handed to VMX hardware.
#[repr(C, align(4096))]
pub struct VmxRegion(pub [u8; VMX_REGION_SIZE]);

/// The MSR bitmap. Left all-zero: no MSR access causes a VM exit.
#[repr(C, align(4096))]
pub struct MsrBitmap(pub [u8; MSR_BITMAP_SIZE]);

/// The stack the root-mode handler runs on.
#[repr(C, align(4096))]
pub struct RootModeStack(pub [u8; ROOT_MODE_STACK_SIZE]);

/// One pre-allocated page table, carved out of a 2 MiB leaf on demand.
#[repr(C, align(4096))]
struct SplitSlot([EptEntry; TABLE_ENTRIES]);

/// The fixed-capacity buffer splits are served from.
///
/// Slots are handed out monotonically and never reclaimed before
/// teardown; the counter only grows. Exhaustion is an error the caller
/// reports, not a reason to allocate — root mode never allocates.
#[repr(C)]
pub struct SplitArena {
    slots: [SplitSlot; SPLIT_CAPACITY],
    used: u64,
}

impl SplitArena {
    /// Claim the next free slot as a zeroed page table.
    pub fn take(&mut self) -> Option<&mut [EptEntry; TABLE_ENTRIES]> {
        if self.used as usize >= SPLIT_CAPACITY {
            return None;
        }
        let slot = &mut self.slots[self.used as usize];
        self.used += 1;
        Some(&mut slot.0)
    }

    /// Number of slots handed out so far.
    pub fn used(&self) -> usize {
        self.used as usize
    }
}

/// One installed split mapping: the guest frame and the two host frames
/// that answer for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MappingRecord {
    pub guest: Hpa,
    pub rw_target: Hpa,
    pub fetch_target: Hpa,
    pub valid: bool,
}

/// The per-core table of changed mappings.
#[repr(C)]
pub struct MappingTable {
    records: [MappingRecord; MAPPING_CAPACITY],
}

impl MappingTable {
    /// The valid record keyed by `guest`, if any. Keys are unique by
    /// construction, so the first hit is the only one.
    pub fn find(&self, guest: Hpa) -> Option<&MappingRecord> {
        self.records.iter().find(|r| r.valid && r.guest == guest)
    }

    /// Mutable variant of [`MappingTable::find`].
    pub fn find_mut(&mut self, guest: Hpa) -> Option<&mut MappingRecord> {
        self.records.iter_mut().find(|r| r.valid && r.guest == guest)
    }

    /// Whether installing `(guest, rw, fetch)` would alias an existing
    /// record: the new guest frame may not appear anywhere in a valid
    /// record, and the new targets may not be anyone's guest key.
    pub fn aliases(&self, guest: Hpa, rw: Hpa, fetch: Hpa) -> bool {
        self.records.iter().any(|r| {
            r.valid
                && (r.guest == guest
                    || r.fetch_target == guest
                    || r.rw_target == guest
                    || r.guest == rw
                    || r.guest == fetch)
        })
    }

    /// First invalid slot, in table order.
    pub fn first_free(&mut self) -> Option<&mut MappingRecord> {
        self.records.iter_mut().find(|r| !r.valid)
    }

    /// Whether every slot is in use.
    pub fn is_full(&self) -> bool {
        self.records.iter().all(|r| r.valid)
    }

    /// All valid records.
    pub fn iter_valid(&self) -> impl Iterator<Item = &MappingRecord> {
        self.records.iter().filter(|r| r.valid)
    }

    /// Number of valid records.
    pub fn valid_count(&self) -> usize {
        self.iter_valid().count()
    }
}

/// Everything one logical core owns, 4 KiB-aligned where the hardware
/// demands it.
#[repr(C)]
pub struct LogicalCore {
    pub vmxon_region: VmxRegion,
    pub vmcs_region: VmxRegion,
    pub msr_bitmap: MsrBitmap,
    pub root_stack: RootModeStack,
    pub split_arena: SplitArena,
    pub mappings: MappingTable,
    /// EPT pointer bits; zero until enable builds the structure.
    pub eptp: u64,
    /// Set once this core has entered VMX non-root operation.
    pub virtualized: bool,
}

impl LogicalCore {
    /// Allocate one zeroed record on the heap.
    ///
    /// The record is ~180 KiB, so it is constructed directly in place;
    /// the all-zero image is a valid initial state for every field.
    pub fn new_boxed() -> Result<Box<LogicalCore>, HvError> {
        let layout = Layout::new::<LogicalCore>();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(HvError::AllocationFailed);
        }
        Ok(unsafe { Box::from_raw(ptr.cast::<LogicalCore>()) })
    }

    /// Host-virtual address of the VMXON region.
    pub fn vmxon_region_va(&self) -> Hva {
        Hva::new(self.vmxon_region.0.as_ptr() as u64)
    }

    /// Host-virtual address of the VMCS region.
    pub fn vmcs_region_va(&self) -> Hva {
        Hva::new(self.vmcs_region.0.as_ptr() as u64)
    }

    /// Host-virtual address of the MSR bitmap.
    pub fn msr_bitmap_va(&self) -> Hva {
        Hva::new(self.msr_bitmap.0.as_ptr() as u64)
    }

    /// Top of the root-mode stack; the VMCS host RSP sits 16 bytes below
    /// to satisfy the ABI alignment expected on entry.
    pub fn root_stack_top(&self) -> Hva {
        Hva::new(self.root_stack.0.as_ptr() as u64 + ROOT_MODE_STACK_SIZE as u64)
    }
}

/// The system-wide state handle: one record per logical core plus the
/// control-register baseline captured at enable.
///
/// Created once, passed explicitly to everything that needs it; there are
/// no process-wide globals.
pub struct Context {
    system_cr3: AtomicU64,
    cores: Vec<Mutex<Box<LogicalCore>>>,
}

impl Context {
    /// Allocate per-core state for `core_count` logical cores.
    pub fn new(core_count: usize) -> Result<Context, HvError> {
        let mut cores = Vec::new();
        cores.try_reserve_exact(core_count).map_err(|_| HvError::AllocationFailed)?;
        for _ in 0..core_count {
            cores.push(Mutex::new(LogicalCore::new_boxed()?));
        }
        Ok(Context { system_cr3: AtomicU64::new(0), cores })
    }

    /// Number of logical cores.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// State of core `id`.
    pub fn core(&self, id: usize) -> &Mutex<Box<LogicalCore>> {
        &self.cores[id]
    }

    /// Record the CR3 every core's VMCS host area will use.
    pub fn set_system_cr3(&self, cr3: u64) {
        self.system_cr3.store(cr3, Ordering::SeqCst);
    }

    /// The CR3 captured at enable time.
    pub fn system_cr3(&self) -> u64 {
        self.system_cr3.load(Ordering::SeqCst)
    }
}
