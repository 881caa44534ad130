#![allow(dead_code)]
//! A software-simulated host for the hypervisor core.
//!
//! Implements the `platform` traits over a fake machine: an MSR file, a
//! per-core VMCS field store, a synthetic physical address space mapped
//! page-by-page onto real heap memory, a serial inter-processor
//! broadcast, and a `vmcall` that traps straight into the real root-mode
//! dispatcher — which is exactly what the hardware instruction does, so
//! the entire install / violate / flip / remove state machine runs
//! unmodified. Guest memory accesses are simulated by walking the real
//! EPT structures and synthesizing EPT-violation exits whenever the leaf
//! denies the access.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mzhv::addressing::{Gpa, Hpa, Hva, LARGE_PAGE_SIZE, PAGE_SIZE};
use mzhv::context::Context;
use mzhv::ept::{EptFlags, EptPointer, ExtendedPageTable};
use mzhv::msr;
use mzhv::platform::{
    CpuidLeaf, CrossCore, Cpu, DescriptorTables, HostMemory, SegmentRegister, SegmentSnapshot,
    TableRegister, Vmx,
};
use mzhv::vm_control;
use mzhv::vmcs::{self, Field};
use mzhv::vmexit::{
    self, GuestRegisters, EXIT_REASON_CPUID, EXIT_REASON_EPT_VIOLATION, EXIT_REASON_VMCALL,
};
use mzhv::HvError;

/// First synthetic physical page handed out; keeps test frames clear of
/// the fixed-MTRR MiB and the first 2 MiB leaf.
const PHYS_BASE: u64 = 0x40_0000;

/// The access kinds a guest can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Fetch,
}

#[derive(Default)]
struct PhysSpace {
    next: u64,
    v2p: HashMap<u64, u64>,
    p2v: HashMap<u64, u64>,
}

impl PhysSpace {
    fn assign(&mut self, va_page: u64) -> u64 {
        if let Some(&pa) = self.v2p.get(&va_page) {
            return pa;
        }
        let pa = PHYS_BASE + self.next;
        self.next += PAGE_SIZE as u64;
        self.v2p.insert(va_page, pa);
        self.p2v.insert(pa, va_page);
        pa
    }
}

/// Per-core control-register file.
#[derive(Default, Clone)]
struct CrFile {
    cr0: u64,
    cr3: u64,
    cr4: u64,
}

pub struct Sim {
    core_count: usize,
    current_core: Mutex<usize>,
    msrs: Mutex<HashMap<u32, u64>>,
    vendor: Mutex<[u8; 12]>,
    phys_bits: u32,
    phys: Mutex<PhysSpace>,
    allocations: Mutex<HashMap<u64, Layout>>,
    guest_pages: Mutex<Vec<(u64, Layout)>>,
    crs: Mutex<Vec<CrFile>>,
    vmcs_fields: Mutex<Vec<HashMap<u32, u64>>>,
    ctx: Mutex<Option<Arc<Context>>>,
    pub vmxon_count: AtomicUsize,
    pub vmxoff_count: AtomicUsize,
    pub launch_count: AtomicUsize,
    pub invept_count: AtomicUsize,
    pub gdtr_restores: AtomicUsize,
}

impl Sim {
    pub fn new(core_count: usize) -> Sim {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut msrs = HashMap::new();
        // A VT-x machine with true controls and everything allowed.
        msrs.insert(
            vm_control::IA32_VMX_BASIC,
            0x42u64 | vm_control::VMX_BASIC_TRUE_CONTROLS,
        );
        msrs.insert(vm_control::IA32_FEATURE_CONTROL, 0);
        msrs.insert(vm_control::IA32_VMX_CR0_FIXED0, 0);
        msrs.insert(vm_control::IA32_VMX_CR0_FIXED1, u64::MAX);
        msrs.insert(vm_control::IA32_VMX_CR4_FIXED0, 0);
        msrs.insert(vm_control::IA32_VMX_CR4_FIXED1, u64::MAX);
        for index in [
            vm_control::IA32_VMX_TRUE_PINBASED_CTLS,
            vm_control::IA32_VMX_TRUE_PROCBASED_CTLS,
            vm_control::IA32_VMX_TRUE_EXIT_CTLS,
            vm_control::IA32_VMX_TRUE_ENTRY_CTLS,
            vm_control::IA32_VMX_PROCBASED_CTLS2,
        ] {
            msrs.insert(index, 0xFFFF_FFFFu64 << 32);
        }
        // Eight variable MTRRs (all invalid), fixed ranges supported but
        // not enabled, default type write-back.
        msrs.insert(msr::IA32_MTRRCAP, 8 | (1 << 8));
        msrs.insert(msr::IA32_MTRR_DEF_TYPE, (1 << 11) | 6);

        Sim {
            core_count,
            current_core: Mutex::new(0),
            msrs: Mutex::new(msrs),
            vendor: Mutex::new(*b"GenuineIntel"),
            phys_bits: 39,
            phys: Mutex::new(PhysSpace::default()),
            allocations: Mutex::new(HashMap::new()),
            guest_pages: Mutex::new(Vec::new()),
            crs: Mutex::new(vec![CrFile { cr3: 0x1aa000, ..Default::default() }; core_count]),
            vmcs_fields: Mutex::new(vec![HashMap::new(); core_count]),
            ctx: Mutex::new(None),
            vmxon_count: AtomicUsize::new(0),
            vmxoff_count: AtomicUsize::new(0),
            launch_count: AtomicUsize::new(0),
            invept_count: AtomicUsize::new(0),
            gdtr_restores: AtomicUsize::new(0),
        }
    }

    /// Hand the simulator the context so `vmcall` can reach per-core
    /// state, the way hardware reaches it through the current VMCS.
    pub fn attach(&self, ctx: Arc<Context>) {
        *self.ctx.lock().unwrap() = Some(ctx);
    }

    pub fn set_msr(&self, index: u32, value: u64) {
        self.msrs.lock().unwrap().insert(index, value);
    }

    pub fn set_vendor(&self, vendor: [u8; 12]) {
        *self.vendor.lock().unwrap() = vendor;
    }

    /// Configure variable MTRR `index` as `base..base+length` with the
    /// given architectural type.
    pub fn set_variable_mtrr(&self, index: u32, base: u64, length: u64, mem_type: u64) {
        assert!(length.is_power_of_two());
        self.set_msr(
            msr::IA32_MTRR_PHYSBASE0 + msr::IA32_MTRR_PAIR_STRIDE * index,
            base | mem_type,
        );
        // A real mask covers every address bit above the range size.
        let mask = !(length - 1) & 0x0000_007F_FFFF_F000;
        self.set_msr(
            msr::IA32_MTRR_PHYSMASK0 + msr::IA32_MTRR_PAIR_STRIDE * index,
            mask | (1 << 11),
        );
    }

    /// Number of pool allocations currently outstanding.
    pub fn outstanding_allocations(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }

    fn context(&self) -> Arc<Context> {
        self.ctx.lock().unwrap().clone().expect("Sim::attach not called")
    }

    fn set_current_core(&self, id: usize) -> usize {
        std::mem::replace(&mut *self.current_core.lock().unwrap(), id)
    }

    fn vmcs_set(&self, core: usize, field: Field, value: u64) {
        self.vmcs_fields.lock().unwrap()[core].insert(field as u32, value);
    }

    /// Allocate a guest-visible page filled with `fill`.
    pub fn alloc_guest_page(&self, fill: u8) -> GuestPage {
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        unsafe { core::ptr::write_bytes(ptr, fill, PAGE_SIZE) };
        self.guest_pages.lock().unwrap().push((ptr as u64, layout));
        GuestPage { ptr }
    }

    /// Allocate a guest-visible page pinned at a chosen synthetic
    /// physical address. Lets tests place guest frames in specific
    /// 2 MiB regions.
    pub fn alloc_guest_page_at(&self, phys: u64, fill: u8) -> GuestPage {
        assert_eq!(phys & (PAGE_SIZE as u64 - 1), 0);
        let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        unsafe { core::ptr::write_bytes(ptr, fill, PAGE_SIZE) };
        {
            let mut space = self.phys.lock().unwrap();
            assert!(
                !space.p2v.contains_key(&phys),
                "physical page {phys:#x} already assigned"
            );
            space.v2p.insert(ptr as u64, phys);
            space.p2v.insert(phys, ptr as u64);
        }
        self.guest_pages.lock().unwrap().push((ptr as u64, layout));
        GuestPage { ptr }
    }

    /// Run one guest access on `core_id`, walking the core's EPT and
    /// faulting into the real dispatcher until the leaf permits it.
    /// Returns the host-physical address the access resolved to.
    fn translate(&self, core_id: usize, gpa: Gpa, access: Access) -> Hpa {
        let ctx = self.context();
        for _ in 0..3 {
            let eptp = EptPointer::from_bits(ctx.core(core_id).lock().eptp);
            assert_ne!(eptp.bits(), 0, "core {core_id} has no EPT");

            let leaf = ExtendedPageTable::from_eptp(self, eptp)
                .walk(self, gpa)
                .expect("guest access outside the mapped range");
            let wanted = match access {
                Access::Read => EptFlags::READ,
                Access::Write => EptFlags::WRITE,
                Access::Fetch => EptFlags::FETCH,
            };
            if leaf.entry.flags().contains(wanted) {
                let hpa = if leaf.large {
                    (leaf.entry.frame_2m() << 21) | (gpa.into_u64() & (LARGE_PAGE_SIZE as u64 - 1))
                } else {
                    (leaf.entry.frame_4k() << 12) | gpa.offset()
                };
                return Hpa::new(hpa);
            }

            // Denied: raise the EPT violation the hardware would raise.
            let previous = self.set_current_core(core_id);
            self.vmcs_set(core_id, Field::VmexitReason, EXIT_REASON_EPT_VIOLATION as u64);
            self.vmcs_set(
                core_id,
                Field::VmexitQualification,
                match access {
                    Access::Read => 1 << 0,
                    Access::Write => 1 << 1,
                    Access::Fetch => 1 << 2,
                },
            );
            self.vmcs_set(core_id, Field::GuestPhysicalAddr, gpa.into_u64());
            let mut regs = GuestRegisters::default();
            {
                let mut core = ctx.core(core_id).lock();
                vmexit::handle(self, &mut core, &mut regs);
            }
            self.set_current_core(previous);
        }
        panic!("guest access at {gpa} did not converge after two flips");
    }

    pub fn guest_read(&self, core_id: usize, gpa: Gpa) -> u8 {
        let hpa = self.translate(core_id, gpa, Access::Read);
        unsafe { *(self.phys_to_virt(hpa).into_u64() as *const u8) }
    }

    pub fn guest_write(&self, core_id: usize, gpa: Gpa, value: u8) {
        let hpa = self.translate(core_id, gpa, Access::Write);
        unsafe { *(self.phys_to_virt(hpa).into_u64() as *mut u8) = value };
    }

    /// The byte the instruction stream would fetch at `gpa`.
    pub fn guest_fetch(&self, core_id: usize, gpa: Gpa) -> u8 {
        let hpa = self.translate(core_id, gpa, Access::Fetch);
        unsafe { *(self.phys_to_virt(hpa).into_u64() as *const u8) }
    }

    /// Execute a guest `cpuid` on `core_id` through the dispatcher.
    pub fn guest_cpuid(&self, core_id: usize, leaf: u32, subleaf: u32) -> CpuidLeaf {
        let ctx = self.context();
        let previous = self.set_current_core(core_id);
        self.vmcs_set(core_id, Field::VmexitReason, EXIT_REASON_CPUID as u64);
        self.vmcs_set(core_id, Field::VmexitInstructionLength, 2);
        let mut regs = GuestRegisters {
            rax: leaf as u64,
            rcx: subleaf as u64,
            ..Default::default()
        };
        {
            let mut core = ctx.core(core_id).lock();
            vmexit::handle(self, &mut core, &mut regs);
        }
        self.set_current_core(previous);
        CpuidLeaf {
            eax: regs.rax as u32,
            ebx: regs.rbx as u32,
            ecx: regs.rcx as u32,
            edx: regs.rdx as u32,
        }
    }
}

impl Drop for Sim {
    fn drop(&mut self) {
        for (ptr, layout) in self.guest_pages.lock().unwrap().drain(..) {
            unsafe { dealloc(ptr as *mut u8, layout) };
        }
    }
}

/// A page of simulated guest memory.
pub struct GuestPage {
    ptr: *mut u8,
}

impl GuestPage {
    pub fn va(&self) -> Hva {
        Hva::new(self.ptr as u64)
    }

    pub fn read(&self, offset: usize) -> u8 {
        assert!(offset < PAGE_SIZE);
        unsafe { *self.ptr.add(offset) }
    }

    pub fn write(&self, offset: usize, value: u8) {
        assert!(offset < PAGE_SIZE);
        unsafe { *self.ptr.add(offset) = value };
    }

    pub fn fill(&self, value: u8) {
        unsafe { core::ptr::write_bytes(self.ptr, value, PAGE_SIZE) };
    }
}

impl HostMemory for Sim {
    fn allocate(&self, bytes: usize) -> Option<Hva> {
        let bytes = bytes.max(PAGE_SIZE);
        let layout = Layout::from_size_align(bytes, PAGE_SIZE).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        self.allocations.lock().unwrap().insert(ptr as u64, layout);
        Some(Hva::new(ptr as u64))
    }

    fn free(&self, va: Hva) {
        let layout = self
            .allocations
            .lock()
            .unwrap()
            .remove(&va.into_u64())
            .expect("freeing an address that was not allocated");
        unsafe { dealloc(va.into_u64() as *mut u8, layout) };
    }

    fn virt_to_phys(&self, va: Hva) -> Hpa {
        let page = va.into_u64() & !(PAGE_SIZE as u64 - 1);
        let offset = va.into_u64() & (PAGE_SIZE as u64 - 1);
        Hpa::new(self.phys.lock().unwrap().assign(page) | offset)
    }

    fn phys_to_virt(&self, pa: Hpa) -> Hva {
        let page = pa.into_u64() & !(PAGE_SIZE as u64 - 1);
        let offset = pa.into_u64() & (PAGE_SIZE as u64 - 1);
        match self.phys.lock().unwrap().p2v.get(&page) {
            Some(&va) => Hva::new(va | offset),
            // The hardware analogue of this lookup failing is fatal.
            None => panic!("phys_to_virt: no mapping for {pa}"),
        }
    }
}

impl Cpu for Sim {
    fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuidLeaf {
        match leaf {
            0 => {
                let vendor = *self.vendor.lock().unwrap();
                CpuidLeaf {
                    eax: 0x16,
                    ebx: u32::from_le_bytes(vendor[0..4].try_into().unwrap()),
                    edx: u32::from_le_bytes(vendor[4..8].try_into().unwrap()),
                    ecx: u32::from_le_bytes(vendor[8..12].try_into().unwrap()),
                }
            }
            // VMX in ECX, MTRR in EDX.
            1 => CpuidLeaf { eax: 0x000a_0655, ecx: 1 << 5, edx: 1 << 12, ..Default::default() },
            0x8000_0008 => CpuidLeaf { eax: self.phys_bits, ..Default::default() },
            _ => CpuidLeaf::default(),
        }
    }

    fn read_msr(&self, index: u32) -> u64 {
        self.msrs.lock().unwrap().get(&index).copied().unwrap_or(0)
    }

    fn write_msr(&self, index: u32, value: u64) {
        self.msrs.lock().unwrap().insert(index, value);
    }

    fn read_cr0(&self) -> u64 {
        self.crs.lock().unwrap()[self.core_id()].cr0
    }

    fn write_cr0(&self, value: u64) {
        let id = self.core_id();
        self.crs.lock().unwrap()[id].cr0 = value;
    }

    fn read_cr3(&self) -> u64 {
        self.crs.lock().unwrap()[self.core_id()].cr3
    }

    fn write_cr3(&self, value: u64) {
        let id = self.core_id();
        self.crs.lock().unwrap()[id].cr3 = value;
    }

    fn read_cr4(&self) -> u64 {
        self.crs.lock().unwrap()[self.core_id()].cr4
    }

    fn write_cr4(&self, value: u64) {
        let id = self.core_id();
        self.crs.lock().unwrap()[id].cr4 = value;
    }

    fn read_dr7(&self) -> u64 {
        0x400
    }

    fn read_rflags(&self) -> u64 {
        0x202
    }

    fn core_id(&self) -> usize {
        *self.current_core.lock().unwrap()
    }

    fn core_count(&self) -> usize {
        self.core_count
    }
}

impl DescriptorTables for Sim {
    fn segment(&self, reg: SegmentRegister) -> SegmentSnapshot {
        match reg {
            SegmentRegister::Cs => SegmentSnapshot {
                selector: 0x10,
                base: 0,
                limit: 0xffff_ffff,
                access_rights: 0xa09b,
            },
            SegmentRegister::Tr => SegmentSnapshot {
                selector: 0x40,
                base: 0x7000,
                limit: 0x67,
                access_rights: 0x8b,
            },
            SegmentRegister::Ldtr => SegmentSnapshot {
                selector: 0,
                base: 0,
                limit: 0,
                access_rights: 1 << 16,
            },
            _ => SegmentSnapshot {
                selector: 0x18,
                base: 0,
                limit: 0xffff_ffff,
                access_rights: 0xc093,
            },
        }
    }

    fn gdtr(&self) -> TableRegister {
        TableRegister { base: 0x9000, limit: 0x7f }
    }

    fn idtr(&self) -> TableRegister {
        TableRegister { base: 0xa000, limit: 0xfff }
    }

    fn load_gdtr(&self, _table: TableRegister) {
        self.gdtr_restores.fetch_add(1, Ordering::SeqCst);
    }

    fn load_idtr(&self, _table: TableRegister) {}
}

impl Vmx for Sim {
    fn vmxon(&self, _region: Hpa) -> Result<(), HvError> {
        self.vmxon_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn vmxoff(&self) {
        self.vmxoff_count.fetch_add(1, Ordering::SeqCst);
    }

    fn vmclear(&self, _region: Hpa) -> Result<(), HvError> {
        Ok(())
    }

    fn vmptrld(&self, _region: Hpa) -> Result<(), HvError> {
        Ok(())
    }

    fn vmread(&self, field: Field) -> u64 {
        self.vmcs_fields.lock().unwrap()[self.core_id()]
            .get(&(field as u32))
            .copied()
            .unwrap_or(0)
    }

    fn vmwrite(&self, field: Field, value: u64) {
        let id = self.core_id();
        self.vmcs_fields.lock().unwrap()[id].insert(field as u32, value);
    }

    fn launch(&self) -> Result<(), HvError> {
        // The trampoline captures RSP right before vmlaunch.
        self.vmwrite(Field::GuestRsp, 0x8_0000);
        self.launch_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn invept_all(&self) {
        self.invept_count.fetch_add(1, Ordering::SeqCst);
    }

    fn vmcall(&self, op: u64, arg1: u64, arg2: u64, arg3: u64) -> u64 {
        let ctx = self.context();
        let id = self.core_id();

        // vmcall traps synchronously into the root-mode dispatcher.
        self.vmcs_set(id, Field::VmexitReason, EXIT_REASON_VMCALL as u64);
        self.vmcs_set(id, Field::VmexitInstructionLength, 3);
        let mut regs = GuestRegisters {
            rcx: op,
            rdx: arg1,
            r8: arg2,
            r9: arg3,
            ..Default::default()
        };
        let shutdown = {
            let mut core = ctx.core(id).lock();
            vmexit::handle(self, &mut core, &mut regs)
        };
        if shutdown {
            // What the exit trampoline does on the way out.
            vmcs::restore(self);
            self.vmxoff();
        }
        regs.rax
    }

    fn vmexit_entry(&self) -> Hva {
        Hva::new(0xffff_8000_dead_0000)
    }

    fn guest_entry(&self) -> Hva {
        Hva::new(0xffff_8000_dead_1000)
    }
}

impl CrossCore for Sim {
    fn broadcast(&self, work: &(dyn Fn() -> u64 + Sync)) -> u64 {
        let previous = self.core_id();
        let mut aggregate = mzhv::STATUS_SUCCESS;
        for id in 0..self.core_count {
            self.set_current_core(id);
            let status = work();
            if aggregate == mzhv::STATUS_SUCCESS {
                aggregate = status;
            }
        }
        self.set_current_core(previous);
        aggregate
    }
}

/// Build a simulator and enable the hypervisor on all its cores.
pub fn enabled_hypervisor(cores: usize) -> (Arc<Sim>, Arc<Context>) {
    let sim = Arc::new(Sim::new(cores));
    let ctx = Arc::new(Context::new(sim.core_count()).unwrap());
    sim.attach(ctx.clone());
    mzhv::vmm::enable(&ctx, &*sim).expect("enable should succeed on the simulated machine");
    (sim, ctx)
}
