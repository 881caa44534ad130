//! Enable and tear down virtualization across the system.
//!
//! [`enable`] captures the system CR3, builds each core's identity EPT,
//! then broadcasts the per-core virtualization sequence: prerequisite
//! checks, feature-control and CR fixups, VMXON, VMCS programming, and
//! the launch that slides the running system into VMX non-root operation.
//! If any core refuses, the whole system is rolled back — there is no
//! partially virtualized state.
//!
//! [`disable`] is the mirror image: a shutdown hyperclient call on every
//! virtualized core (the exit trampoline restores descriptor state and
//! executes `vmxoff`), then EPT teardown.

use log::{info, warn};

use crate::context::Context;
use crate::ept::{EptPointer, ExtendedPageTable};
use crate::mtrr::MtrrSnapshot;
use crate::platform::Platform;
use crate::vm_control::{
    self, FeatureControl, CR4_VMX_ENABLE, VMX_BASIC_TRUE_CONTROLS,
};
use crate::vmcs;
use crate::vmexit::VMCALL_SHUTDOWN;
use crate::{status_of, HvError};

/// CPUID.1 ECX bit 5: VMX supported.
const CPUID_FEATURE_VMX: u32 = 1 << 5;

/// Virtualize every logical core.
///
/// On failure the error of the first refusing core is returned and
/// [`disable`] has already run; the system is exactly as it was.
pub fn enable<P: Platform>(ctx: &Context, p: &P) -> Result<(), HvError> {
    info!("vmm: enabling virtualization on {} cores", ctx.core_count());

    ctx.set_system_cr3(p.read_cr3());

    // MTRRs are read once, here; the EPT leaves snapshot them for good.
    let mtrrs = MtrrSnapshot::read(p);
    for id in 0..ctx.core_count() {
        let mut core = ctx.core(id).lock();
        match ExtendedPageTable::build(p, &mtrrs, &mut core.split_arena) {
            Ok(ept) => core.eptp = ept.eptp(p).bits(),
            Err(e) => {
                drop(core);
                disable(ctx, p);
                return Err(e);
            }
        }
    }

    let status = p.broadcast(&|| status_of(virtualize_core(ctx, p)));

    for id in 0..ctx.core_count() {
        if !ctx.core(id).lock().virtualized {
            warn!("vmm: core {id} failed to virtualize, rolling back");
            disable(ctx, p);
            return Err(match HvError::from_status(status) {
                Err(e) => e,
                Ok(()) => HvError::Unspecified,
            });
        }
    }

    info!("vmm: all cores virtualized");
    Ok(())
}

/// Devirtualize every core and free the EPT structures.
pub fn disable<P: Platform>(ctx: &Context, p: &P) {
    info!("vmm: disabling virtualization");

    p.broadcast(&|| {
        let id = p.core_id();
        let virtualized = ctx.core(id).lock().virtualized;
        if virtualized {
            // The shutdown exit restores descriptor state and executes
            // vmxoff before this call returns.
            p.vmcall(VMCALL_SHUTDOWN, 0, 0, 0);
            ctx.core(id).lock().virtualized = false;
        }
        crate::STATUS_SUCCESS
    });

    for id in 0..ctx.core_count() {
        let mut core = ctx.core(id).lock();
        if core.eptp != 0 {
            let eptp = EptPointer::from_bits(core.eptp);
            core.eptp = 0;
            ExtendedPageTable::from_eptp(p, eptp).destroy(p);
        }
    }
}

/// The sequence a single core runs inside the enable broadcast.
fn virtualize_core<P: Platform>(ctx: &Context, p: &P) -> Result<(), HvError> {
    check_prerequisites(p)?;
    set_control_register_bits(p)?;

    let id = p.core_id();
    let mut core = ctx.core(id).lock();

    // VMXON region: revision identifier, then enter VMX root operation.
    let revision = vm_control::vmx_revision_id(p.read_msr(vm_control::IA32_VMX_BASIC));
    core.vmxon_region.0[..4].copy_from_slice(&revision.to_le_bytes());
    p.vmxon(p.virt_to_phys(core.vmxon_region_va()))?;

    if let Err(e) = vmcs::setup(p, &mut core, ctx.system_cr3()) {
        p.vmxoff();
        return Err(e);
    }
    if let Err(e) = p.launch() {
        p.vmxoff();
        return Err(e);
    }

    core.virtualized = true;
    info!("vmm: core {id} virtualized");
    Ok(())
}

/// The hardware this design requires: a GenuineIntel processor with VMX
/// and the TRUE_* capability MSRs.
fn check_prerequisites<P: Platform>(p: &P) -> Result<(), HvError> {
    let leaf0 = p.cpuid(0, 0);
    let mut vendor = [0u8; 12];
    vendor[..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
    vendor[8..].copy_from_slice(&leaf0.ecx.to_le_bytes());
    if &vendor != b"GenuineIntel" {
        return Err(HvError::UnsupportedProcessor);
    }

    if p.cpuid(1, 0).ecx & CPUID_FEATURE_VMX == 0 {
        return Err(HvError::UnsupportedProcessor);
    }

    if p.read_msr(vm_control::IA32_VMX_BASIC) & VMX_BASIC_TRUE_CONTROLS == 0 {
        return Err(HvError::UnsupportedProcessor);
    }

    Ok(())
}

/// Bring IA32_FEATURE_CONTROL and CR0/CR4 into a state where VMXON is
/// legal: lock the feature MSR with VMX-outside-SMX if the firmware left
/// it open, refuse if it locked VMX off, and fold both control registers
/// through their FIXED0/FIXED1 masks with CR4.VMXE raised.
fn set_control_register_bits<P: Platform>(p: &P) -> Result<(), HvError> {
    let mut feature =
        FeatureControl::from_bits_retain(p.read_msr(vm_control::IA32_FEATURE_CONTROL));
    if feature.contains(FeatureControl::LOCK)
        && !feature.contains(FeatureControl::VMX_OUTSIDE_SMX)
    {
        return Err(HvError::VmxLockedOff);
    }
    if !feature.contains(FeatureControl::LOCK) {
        feature |= FeatureControl::VMX_OUTSIDE_SMX | FeatureControl::LOCK;
        p.write_msr(vm_control::IA32_FEATURE_CONTROL, feature.bits());
    }

    let cr4_fixed0 = p.read_msr(vm_control::IA32_VMX_CR4_FIXED0);
    let cr4_fixed1 = p.read_msr(vm_control::IA32_VMX_CR4_FIXED1);
    p.write_cr4(((p.read_cr4() | CR4_VMX_ENABLE) | cr4_fixed0) & cr4_fixed1);

    let cr0_fixed0 = p.read_msr(vm_control::IA32_VMX_CR0_FIXED0);
    let cr0_fixed1 = p.read_msr(vm_control::IA32_VMX_CR0_FIXED1);
    p.write_cr0((p.read_cr0() | cr0_fixed0) & cr0_fixed1);

    Ok(())
}
