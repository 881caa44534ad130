//! Collaborator traits between the hypervisor core and its host.
//!
//! The core never touches hardware directly. Everything it needs from the
//! machine and the surrounding kernel — pool allocation, address-space
//! inversion, MSR/CPUID/control-register intrinsics, descriptor-table
//! capture, the VMX instruction set, and the inter-processor broadcast —
//! arrives through the traits in this module. An embedding driver
//! implements them with real intrinsics (see [`crate::vmx`] for the VMX
//! instruction wrappers); the test suite implements them with a simulated
//! machine.

use crate::addressing::{Hpa, Hva};
use crate::vmcs::Field;
use crate::HvError;

/// Non-pageable executable-pool memory services.
///
/// Allocations back EPT paging structures, so they must be page-aligned,
/// zero-initialized, resident, and invertible with
/// [`HostMemory::phys_to_virt`] for their whole lifetime.
pub trait HostMemory {
    /// Allocate `bytes` of zeroed, page-aligned pool memory.
    fn allocate(&self, bytes: usize) -> Option<Hva>;

    /// Release an allocation made by [`HostMemory::allocate`].
    fn free(&self, va: Hva);

    /// Translate a host-virtual address to host-physical.
    fn virt_to_phys(&self, va: Hva) -> Hpa;

    /// Translate a host-physical address back to host-virtual.
    ///
    /// The core only ever inverts addresses of memory it allocated itself,
    /// so a failed inversion is a contract violation: implementations must
    /// bug-check instead of returning.
    fn phys_to_virt(&self, pa: Hpa) -> Hva;
}

/// Result registers of a `cpuid` execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuidLeaf {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Processor intrinsics of the current logical core.
pub trait Cpu {
    /// Execute `cpuid` with the given leaf and subleaf.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidLeaf;

    /// Read a model-specific register.
    fn read_msr(&self, msr: u32) -> u64;

    /// Write a model-specific register.
    fn write_msr(&self, msr: u32, value: u64);

    fn read_cr0(&self) -> u64;
    fn write_cr0(&self, value: u64);
    fn read_cr3(&self) -> u64;
    fn write_cr3(&self, value: u64);
    fn read_cr4(&self) -> u64;
    fn write_cr4(&self, value: u64);
    fn read_dr7(&self) -> u64;
    fn read_rflags(&self) -> u64;

    /// Index of the current logical core.
    fn core_id(&self) -> usize;

    /// Number of active logical cores in the system.
    fn core_count(&self) -> usize;
}

/// Segment registers whose state is captured into the VMCS guest area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRegister {
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

/// A segment register's state, already parsed out of the descriptor
/// tables into the VMCS encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentSnapshot {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    /// VMCS-format access rights; bit 16 marks the segment unusable.
    pub access_rights: u32,
}

/// A GDTR/IDTR value.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableRegister {
    pub base: u64,
    pub limit: u16,
}

/// Descriptor-table capture and restore.
///
/// Descriptor parsing (GDT entry layout, FS/GS base MSRs, the unusable
/// marking for LDT-relative or null selectors) happens behind this trait;
/// the core consumes ready-made [`SegmentSnapshot`]s.
pub trait DescriptorTables {
    /// Snapshot one segment register of the current core.
    fn segment(&self, reg: SegmentRegister) -> SegmentSnapshot;

    /// Current GDTR.
    fn gdtr(&self) -> TableRegister;

    /// Current IDTR.
    fn idtr(&self) -> TableRegister;

    /// Reload the GDTR, used on the shutdown path.
    fn load_gdtr(&self, table: TableRegister);

    /// Reload the IDTR, used on the shutdown path.
    fn load_idtr(&self, table: TableRegister);
}

/// The VMX instruction set, plus the two entry points the VMCS needs.
pub trait Vmx {
    /// `vmxon` with the physical address of the VMXON region.
    fn vmxon(&self, region: Hpa) -> Result<(), HvError>;

    /// `vmxoff`, leaving VMX operation on this core.
    fn vmxoff(&self);

    /// `vmclear` on a VMCS region.
    fn vmclear(&self, region: Hpa) -> Result<(), HvError>;

    /// `vmptrld`, making a VMCS region current.
    fn vmptrld(&self, region: Hpa) -> Result<(), HvError>;

    /// Read a field of the current VMCS.
    fn vmread(&self, field: Field) -> u64;

    /// Write a field of the current VMCS.
    fn vmwrite(&self, field: Field, value: u64);

    /// `vmlaunch` through the host trampoline: captures the current RSP
    /// and the continuation RIP into the guest state, enters the guest,
    /// and returns `Ok` *as the guest* at that continuation.
    fn launch(&self) -> Result<(), HvError>;

    /// Invalidate all EPT-derived translation caches on this core.
    fn invept_all(&self);

    /// Execute the hyperclient call: `vmcall` with the operation in RCX
    /// and arguments in RDX/R8/R9; the handler's RAX comes back.
    fn vmcall(&self, op: u64, arg1: u64, arg2: u64, arg3: u64) -> u64;

    /// Address of the root-mode exit trampoline (VMCS host RIP).
    fn vmexit_entry(&self) -> Hva;

    /// Address of the post-launch continuation (initial VMCS guest RIP).
    fn guest_entry(&self) -> Hva;
}

/// Synchronous execution on every logical core.
pub trait CrossCore {
    /// Run `work` once on each logical core, all cores rendezvousing
    /// before any resumes. Each invocation returns a status word;
    /// the aggregate is [`crate::STATUS_SUCCESS`] iff every core
    /// succeeded, otherwise the first nonzero status observed.
    fn broadcast(&self, work: &(dyn Fn() -> u64 + Sync)) -> u64;
}

/// Everything the hypervisor core needs from its host, in one bound.
/// `Sync` because broadcast workers share the platform across cores.
pub trait Platform: HostMemory + Cpu + DescriptorTables + Vmx + CrossCore + Sync {}

impl<T: HostMemory + Cpu + DescriptorTables + Vmx + CrossCore + Sync> Platform for T {}
