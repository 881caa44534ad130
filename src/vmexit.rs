//! The VMX root-mode exit dispatcher.
//!
//! Hardware delivers every VM exit to the trampoline named in the VMCS
//! host RIP; the trampoline saves the guest's general-purpose registers
//! into a [`GuestRegisters`] frame and calls [`handle`]. Three exit
//! classes are expected — CPUID, VMCALL, and EPT violation — and anything
//! else bug-checks, because with an all-zero MSR bitmap and no other
//! exiting controls enabled, nothing else can legitimately occur.
//!
//! The dispatcher runs with the guest suspended, on the core's root-mode
//! stack, against the core's own state only: per-core mutation needs no
//! cross-core synchronization here.

use log::{debug, error, trace};

use crate::addressing::Gpa;
use crate::context::LogicalCore;
use crate::mapping;
use crate::platform::Platform;
use crate::vmcs::Field;
use crate::{status_of, STATUS_SUCCESS};

/// VM-exit basic reason: CPUID.
pub const EXIT_REASON_CPUID: u32 = 10;
/// VM-exit basic reason: VMCALL.
pub const EXIT_REASON_VMCALL: u32 = 18;
/// VM-exit basic reason: EPT violation.
pub const EXIT_REASON_EPT_VIOLATION: u32 = 48;

/// Hyperclient operation: devirtualize this core.
pub const VMCALL_SHUTDOWN: u64 = 0xFFFF_FFFF_0000_0000;
/// Hyperclient operation: install a split mapping.
pub const VMCALL_INSTALL: u64 = 0xF1337;
/// Hyperclient operation: remove a split mapping.
pub const VMCALL_REMOVE: u64 = 0xF2137;

/// Vendor-string words the guest sees in CPUID leaf 0. Together they
/// spell "AvocadoIntel" across EBX, EDX, ECX.
pub const CPUID_VENDOR_EBX: u32 = u32::from_le_bytes(*b"Avoc");
pub const CPUID_VENDOR_EDX: u32 = u32::from_le_bytes(*b"adoI");
pub const CPUID_VENDOR_ECX: u32 = u32::from_le_bytes(*b"ntel");

/// CPUID.1 ECX bit 31: a hypervisor is present.
pub const CPUID_HYPERVISOR_PRESENT: u32 = 1 << 31;

/// The guest register frame, in the order the exit trampoline pushes it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

bitflags::bitflags! {
    /// Exit qualification for EPT violations, Table 28-7 of the Intel
    /// SDM (access-kind bits only; the rest is ignored here).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptViolation: u64 {
        /// The access was a data read.
        const DATA_READ = 1 << 0;
        /// The access was a data write.
        const DATA_WRITE = 1 << 1;
        /// The access was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 2;
    }
}

/// Handle one VM exit. Returns whether the trampoline should tear this
/// core down instead of resuming the guest.
///
/// Guest RSP is read into the frame up front and written back at the end;
/// RIP advances over the exiting instruction for every class except EPT
/// violations, which must re-run the faulting access against the flipped
/// mapping.
pub fn handle<P: Platform>(p: &P, core: &mut LogicalCore, regs: &mut GuestRegisters) -> bool {
    regs.rsp = p.vmread(Field::GuestRsp);

    let reason = p.vmread(Field::VmexitReason) as u32 & 0xffff;
    let mut shutdown = false;
    let mut advance_rip = true;

    match reason {
        EXIT_REASON_CPUID => handle_cpuid(p, regs),
        EXIT_REASON_VMCALL => handle_vmcall(p, core, regs, &mut shutdown),
        EXIT_REASON_EPT_VIOLATION => {
            handle_ept_violation(p, core);
            advance_rip = false;
        }
        other => {
            error!("vmexit: unhandled exit reason {other}");
            panic!("unhandled VM-exit reason {other}");
        }
    }

    if advance_rip {
        let length = p.vmread(Field::VmexitInstructionLength);
        let rip = p.vmread(Field::GuestRip);
        p.vmwrite(Field::GuestRip, rip + length);
    }

    p.vmwrite(Field::GuestRsp, regs.rsp);
    shutdown
}

/// Run CPUID on the guest's behalf, rewriting the two leaves that betray
/// or advertise the hypervisor: leaf 0 reports the `AvocadoIntel` vendor,
/// leaf 1 raises the hypervisor-present bit.
fn handle_cpuid<P: Platform>(p: &P, regs: &mut GuestRegisters) {
    let leaf = regs.rax as u32;
    let subleaf = regs.rcx as u32;
    let mut result = p.cpuid(leaf, subleaf);

    if leaf == 0 {
        result.ebx = CPUID_VENDOR_EBX;
        result.edx = CPUID_VENDOR_EDX;
        result.ecx = CPUID_VENDOR_ECX;
    }
    if leaf == 1 {
        result.ecx |= CPUID_HYPERVISOR_PRESENT;
    }

    regs.rax = result.eax as u64;
    regs.rbx = result.ebx as u64;
    regs.rcx = result.ecx as u64;
    regs.rdx = result.edx as u64;
}

/// Dispatch a hyperclient call on RCX. Unknown operations are ignored;
/// RAX passes through untouched so the guest cannot probe for the
/// hypervisor by sweeping call numbers.
fn handle_vmcall<P: Platform>(
    p: &P,
    core: &mut LogicalCore,
    regs: &mut GuestRegisters,
    shutdown: &mut bool,
) {
    match regs.rcx {
        VMCALL_SHUTDOWN => {
            debug!("vmexit: core {} shutdown request", p.core_id());
            regs.rax = STATUS_SUCCESS;
            *shutdown = true;
        }
        VMCALL_INSTALL => {
            regs.rax = status_of(mapping::handle_install(
                p, core, regs.rdx, regs.r8, regs.r9,
            ));
        }
        VMCALL_REMOVE => {
            regs.rax = status_of(mapping::handle_remove(p, core, regs.rdx));
        }
        _ => {}
    }
}

/// Resolve an EPT violation by flipping the faulting page's mapping to
/// the view matching the access kind. An address without a registered
/// mapping cannot fault — the identity map is fully permissive — so a
/// miss here is a contract violation and bug-checks.
fn handle_ept_violation<P: Platform>(p: &P, core: &mut LogicalCore) {
    let qualification =
        EptViolation::from_bits_truncate(p.vmread(Field::VmexitQualification));
    let guest = Gpa::new(p.vmread(Field::GuestPhysicalAddr)).page_base();

    trace!(
        "vmexit: ept violation at {guest} ({:?}) on core {}",
        qualification,
        p.core_id()
    );

    if qualification.intersects(EptViolation::DATA_READ | EptViolation::DATA_WRITE) {
        mapping::flip_to_rw(p, core, guest);
    } else if qualification.contains(EptViolation::INSTRUCTION_FETCH) {
        mapping::flip_to_fetch(p, core, guest);
    } else {
        error!("vmexit: ept violation with unknown access class {qualification:?}");
        panic!("EPT violation with unrecognized access kind");
    }
}
