//! VMCS field encodings and state-area programming.
//!
//! [`setup`] prepares a core's VMCS for the "virtualize the running
//! system" entry: the guest area is a snapshot of the core's current
//! state, the host area points root mode at the per-core stack and the
//! exit trampoline, and the control fields are folded against the TRUE_*
//! capability MSRs so reserved bits land wherever the processor insists.
//! [`restore`] is the shutdown half: it pulls CR3 and the descriptor
//! tables back out of the guest area before `vmxoff`.
//!
//! Field encodings are from Intel SDM Vol. 3D, Appendix B.

use log::debug;

use crate::context::LogicalCore;
use crate::msr;
use crate::platform::{Cpu, DescriptorTables, Platform, SegmentRegister, TableRegister, Vmx};
use crate::vm_control::{
    self, adjust_controls, EntryControls, ExitControls, PrimaryControls, SecondaryControls,
};
use crate::HvError;

/// VMCS field encodings used by this hypervisor.
#[allow(missing_docs)]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    // 16-bit fields.
    GuestEsSelector = 0x00000800,
    GuestCsSelector = 0x00000802,
    GuestSsSelector = 0x00000804,
    GuestDsSelector = 0x00000806,
    GuestFsSelector = 0x00000808,
    GuestGsSelector = 0x0000080A,
    GuestLdtrSelector = 0x0000080C,
    GuestTrSelector = 0x0000080E,
    HostEsSelector = 0x00000C00,
    HostCsSelector = 0x00000C02,
    HostSsSelector = 0x00000C04,
    HostDsSelector = 0x00000C06,
    HostFsSelector = 0x00000C08,
    HostGsSelector = 0x00000C0A,
    HostTrSelector = 0x00000C0C,
    // 64-bit fields.
    MsrBitmaps = 0x00002004,
    Eptp = 0x0000201A,
    GuestPhysicalAddr = 0x00002400,
    GuestLinkPointer = 0x00002800,
    GuestIa32Debugctl = 0x00002802,
    // 32-bit fields.
    PinBasedControls = 0x00004000,
    PrimaryProcBasedControls = 0x00004002,
    ExceptionBitmap = 0x00004004,
    ExitControls = 0x0000400C,
    EntryControls = 0x00004012,
    SecondaryProcBasedControls = 0x0000401E,
    VmexitReason = 0x00004402,
    VmexitInstructionLength = 0x0000440C,
    GuestEsLimit = 0x00004800,
    GuestCsLimit = 0x00004802,
    GuestSsLimit = 0x00004804,
    GuestDsLimit = 0x00004806,
    GuestFsLimit = 0x00004808,
    GuestGsLimit = 0x0000480A,
    GuestLdtrLimit = 0x0000480C,
    GuestTrLimit = 0x0000480E,
    GuestGdtrLimit = 0x00004810,
    GuestIdtrLimit = 0x00004812,
    GuestEsAccessRights = 0x00004814,
    GuestCsAccessRights = 0x00004816,
    GuestSsAccessRights = 0x00004818,
    GuestDsAccessRights = 0x0000481A,
    GuestFsAccessRights = 0x0000481C,
    GuestGsAccessRights = 0x0000481E,
    GuestLdtrAccessRights = 0x00004820,
    GuestTrAccessRights = 0x00004822,
    GuestIa32SysenterCs = 0x0000482A,
    HostIa32SysenterCs = 0x00004C00,
    // Natural-width fields.
    VmexitQualification = 0x00006400,
    GuestCr0 = 0x00006800,
    GuestCr3 = 0x00006802,
    GuestCr4 = 0x00006804,
    GuestEsBase = 0x00006806,
    GuestCsBase = 0x00006808,
    GuestSsBase = 0x0000680A,
    GuestDsBase = 0x0000680C,
    GuestFsBase = 0x0000680E,
    GuestGsBase = 0x00006810,
    GuestLdtrBase = 0x00006812,
    GuestTrBase = 0x00006814,
    GuestGdtrBase = 0x00006816,
    GuestIdtrBase = 0x00006818,
    GuestDr7 = 0x0000681A,
    GuestRsp = 0x0000681C,
    GuestRip = 0x0000681E,
    GuestRflags = 0x00006820,
    GuestIa32SysenterEsp = 0x00006824,
    GuestIa32SysenterEip = 0x00006826,
    HostCr0 = 0x00006C00,
    HostCr3 = 0x00006C02,
    HostCr4 = 0x00006C04,
    HostFsBase = 0x00006C06,
    HostGsBase = 0x00006C08,
    HostTrBase = 0x00006C0A,
    HostGdtrBase = 0x00006C0C,
    HostIdtrBase = 0x00006C0E,
    HostIa32SysenterEsp = 0x00006C10,
    HostIa32SysenterEip = 0x00006C12,
    HostRsp = 0x00006C14,
    HostRip = 0x00006C16,
}

/// Gap left between the top of the root stack and the host RSP so the
/// exit handler starts 16-byte aligned.
const HOST_STACK_BIAS: u64 = 16;

/// Program the current core's VMCS region.
///
/// The region gets the revision identifier, is cleared and made current,
/// and then the guest, host, and control areas are written in that order,
/// mirroring how the structure will be consumed at entry.
pub fn setup<P: Platform>(p: &P, core: &mut LogicalCore, system_cr3: u64) -> Result<(), HvError> {
    let revision = vm_control::vmx_revision_id(p.read_msr(vm_control::IA32_VMX_BASIC));
    core.vmcs_region.0[..4].copy_from_slice(&revision.to_le_bytes());

    let region = p.virt_to_phys(core.vmcs_region_va());
    p.vmclear(region)?;
    p.vmptrld(region)?;

    write_guest_state(p);
    write_host_state(p, core, system_cr3);
    write_control_fields(p, core);

    debug!(
        "vmcs: core {} programmed, eptp={:#x}",
        p.core_id(),
        core.eptp
    );
    Ok(())
}

/// Write the guest area as a snapshot of the running core. RSP is left to
/// the launch trampoline, which captures it at the last instant.
fn write_guest_state<P: Platform>(p: &P) {
    p.vmwrite(Field::GuestCr0, p.read_cr0());
    p.vmwrite(Field::GuestCr3, p.read_cr3());
    p.vmwrite(Field::GuestCr4, p.read_cr4());
    p.vmwrite(Field::GuestDr7, p.read_dr7());
    p.vmwrite(Field::GuestRip, p.guest_entry().into_u64());
    p.vmwrite(Field::GuestRflags, p.read_rflags());

    let segments = [
        (
            SegmentRegister::Cs,
            Field::GuestCsSelector,
            Field::GuestCsBase,
            Field::GuestCsLimit,
            Field::GuestCsAccessRights,
        ),
        (
            SegmentRegister::Ss,
            Field::GuestSsSelector,
            Field::GuestSsBase,
            Field::GuestSsLimit,
            Field::GuestSsAccessRights,
        ),
        (
            SegmentRegister::Ds,
            Field::GuestDsSelector,
            Field::GuestDsBase,
            Field::GuestDsLimit,
            Field::GuestDsAccessRights,
        ),
        (
            SegmentRegister::Es,
            Field::GuestEsSelector,
            Field::GuestEsBase,
            Field::GuestEsLimit,
            Field::GuestEsAccessRights,
        ),
        (
            SegmentRegister::Fs,
            Field::GuestFsSelector,
            Field::GuestFsBase,
            Field::GuestFsLimit,
            Field::GuestFsAccessRights,
        ),
        (
            SegmentRegister::Gs,
            Field::GuestGsSelector,
            Field::GuestGsBase,
            Field::GuestGsLimit,
            Field::GuestGsAccessRights,
        ),
        (
            SegmentRegister::Ldtr,
            Field::GuestLdtrSelector,
            Field::GuestLdtrBase,
            Field::GuestLdtrLimit,
            Field::GuestLdtrAccessRights,
        ),
        (
            SegmentRegister::Tr,
            Field::GuestTrSelector,
            Field::GuestTrBase,
            Field::GuestTrLimit,
            Field::GuestTrAccessRights,
        ),
    ];
    for (reg, selector, base, limit, rights) in segments {
        let snapshot = p.segment(reg);
        p.vmwrite(selector, snapshot.selector as u64);
        p.vmwrite(base, snapshot.base);
        p.vmwrite(limit, snapshot.limit as u64);
        p.vmwrite(rights, snapshot.access_rights as u64);
    }

    let gdtr = p.gdtr();
    p.vmwrite(Field::GuestGdtrBase, gdtr.base);
    p.vmwrite(Field::GuestGdtrLimit, gdtr.limit as u64);
    let idtr = p.idtr();
    p.vmwrite(Field::GuestIdtrBase, idtr.base);
    p.vmwrite(Field::GuestIdtrLimit, idtr.limit as u64);

    p.vmwrite(Field::GuestIa32Debugctl, p.read_msr(msr::IA32_DEBUGCTL));
    p.vmwrite(Field::GuestIa32SysenterCs, p.read_msr(msr::IA32_SYSENTER_CS));
    p.vmwrite(Field::GuestIa32SysenterEsp, p.read_msr(msr::IA32_SYSENTER_ESP));
    p.vmwrite(Field::GuestIa32SysenterEip, p.read_msr(msr::IA32_SYSENTER_EIP));

    // No shadow VMCS.
    p.vmwrite(Field::GuestLinkPointer, u64::MAX);
}

fn write_host_state<P: Platform>(p: &P, core: &LogicalCore, system_cr3: u64) {
    p.vmwrite(Field::HostCr0, p.read_cr0());
    p.vmwrite(Field::HostCr3, system_cr3);
    p.vmwrite(Field::HostCr4, p.read_cr4());

    p.vmwrite(
        Field::HostRsp,
        core.root_stack_top().into_u64() - HOST_STACK_BIAS,
    );
    p.vmwrite(Field::HostRip, p.vmexit_entry().into_u64());

    // Host selectors must have TI and RPL clear.
    let selectors = [
        (SegmentRegister::Cs, Field::HostCsSelector),
        (SegmentRegister::Ss, Field::HostSsSelector),
        (SegmentRegister::Ds, Field::HostDsSelector),
        (SegmentRegister::Es, Field::HostEsSelector),
        (SegmentRegister::Fs, Field::HostFsSelector),
        (SegmentRegister::Gs, Field::HostGsSelector),
        (SegmentRegister::Tr, Field::HostTrSelector),
    ];
    for (reg, field) in selectors {
        p.vmwrite(field, (p.segment(reg).selector & !0x7) as u64);
    }

    p.vmwrite(Field::HostTrBase, p.segment(SegmentRegister::Tr).base);
    p.vmwrite(Field::HostFsBase, p.read_msr(msr::IA32_FS_BASE));
    p.vmwrite(Field::HostGsBase, p.read_msr(msr::IA32_GS_BASE));

    p.vmwrite(Field::HostGdtrBase, p.gdtr().base);
    p.vmwrite(Field::HostIdtrBase, p.idtr().base);

    p.vmwrite(Field::HostIa32SysenterCs, p.read_msr(msr::IA32_SYSENTER_CS));
    p.vmwrite(Field::HostIa32SysenterEsp, p.read_msr(msr::IA32_SYSENTER_ESP));
    p.vmwrite(Field::HostIa32SysenterEip, p.read_msr(msr::IA32_SYSENTER_EIP));
}

fn write_control_fields<P: Platform>(p: &P, core: &LogicalCore) {
    p.vmwrite(
        Field::PinBasedControls,
        adjust_controls(0, p.read_msr(vm_control::IA32_VMX_TRUE_PINBASED_CTLS)) as u64,
    );
    p.vmwrite(
        Field::PrimaryProcBasedControls,
        adjust_controls(
            (PrimaryControls::USE_MSR_BITMAPS | PrimaryControls::ACTIVATE_SECONDARY_CONTROLS)
                .bits(),
            p.read_msr(vm_control::IA32_VMX_TRUE_PROCBASED_CTLS),
        ) as u64,
    );
    p.vmwrite(
        Field::SecondaryProcBasedControls,
        adjust_controls(
            (SecondaryControls::ENABLE_EPT
                | SecondaryControls::ENABLE_RDTSCP
                | SecondaryControls::ENABLE_INVPCID
                | SecondaryControls::ENABLE_XSAVES_XRSTORS)
                .bits(),
            p.read_msr(vm_control::IA32_VMX_PROCBASED_CTLS2),
        ) as u64,
    );

    p.vmwrite(
        Field::MsrBitmaps,
        p.virt_to_phys(core.msr_bitmap_va()).into_u64(),
    );
    p.vmwrite(Field::Eptp, core.eptp);

    p.vmwrite(
        Field::ExitControls,
        adjust_controls(
            ExitControls::HOST_ADDRESS_SPACE_SIZE.bits(),
            p.read_msr(vm_control::IA32_VMX_TRUE_EXIT_CTLS),
        ) as u64,
    );
    p.vmwrite(
        Field::EntryControls,
        adjust_controls(
            EntryControls::IA32E_MODE_GUEST.bits(),
            p.read_msr(vm_control::IA32_VMX_TRUE_ENTRY_CTLS),
        ) as u64,
    );
}

/// Undo the address-space side of virtualization on the shutdown path:
/// reload CR3 and the descriptor tables from the guest area so the core
/// continues exactly where the guest stopped, then the caller issues
/// `vmxoff`.
pub fn restore<P: Vmx + Cpu + DescriptorTables>(p: &P) {
    p.write_cr3(p.vmread(Field::GuestCr3));
    p.load_gdtr(TableRegister {
        base: p.vmread(Field::GuestGdtrBase),
        limit: p.vmread(Field::GuestGdtrLimit) as u16,
    });
    p.load_idtr(TableRegister {
        base: p.vmread(Field::GuestIdtrBase),
        limit: p.vmread(Field::GuestIdtrLimit) as u16,
    });
}
