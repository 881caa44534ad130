//! Raw VMX instruction wrappers.
//!
//! These are the building blocks an embedding driver uses to implement
//! [`crate::platform::Vmx`] on real hardware. Every wrapper follows the
//! same convention: clear CF first, execute the instruction, and read
//! VMfail through the flags (`setna` catches both CF and ZF forms).
//!
//! The two pieces deliberately *not* here are the VM-exit trampoline and
//! the launch continuation — they are inseparable from the embedder's
//! stack and context discipline, so the [`crate::platform::Vmx`] trait
//! carries them as `vmexit_entry`/`guest_entry` addresses and the
//! `launch` operation.

use core::arch::asm;

use crate::addressing::Hpa;
use crate::vmcs::Field;
use crate::HvError;

/// `vmxon` with the physical address of a prepared VMXON region.
///
/// # Safety
/// CR4.VMXE and IA32_FEATURE_CONTROL must permit VMX operation and the
/// region must carry the revision identifier.
pub unsafe fn vmxon(region: Hpa) -> Result<(), HvError> {
    let pa = region.into_u64();
    let err: u8;
    asm!(
        "clc",
        "vmxon [{}]",
        "setna {}",
        in(reg) &pa,
        out(reg_byte) err,
    );
    if err != 0 {
        Err(HvError::VmxFailure)
    } else {
        Ok(())
    }
}

/// `vmxoff`, leaving VMX root operation.
///
/// # Safety
/// Only valid in VMX root operation.
pub unsafe fn vmxoff() {
    asm!("vmxoff");
}

/// `vmclear` a VMCS region.
///
/// # Safety
/// Only valid in VMX root operation; `region` must be a VMCS region.
pub unsafe fn vmclear(region: Hpa) -> Result<(), HvError> {
    let pa = region.into_u64();
    let err: u8;
    asm!(
        "clc",
        "vmclear [{}]",
        "setna {}",
        in(reg) &pa,
        out(reg_byte) err,
    );
    if err != 0 {
        Err(HvError::VmxFailure)
    } else {
        Ok(())
    }
}

/// `vmptrld`, making a VMCS region current.
///
/// # Safety
/// Only valid in VMX root operation; `region` must be a cleared VMCS
/// region with the right revision identifier.
pub unsafe fn vmptrld(region: Hpa) -> Result<(), HvError> {
    let pa = region.into_u64();
    let err: u8;
    asm!(
        "clc",
        "vmptrld [{}]",
        "setna {}",
        in(reg) &pa,
        out(reg_byte) err,
    );
    if err != 0 {
        Err(HvError::VmxFailure)
    } else {
        Ok(())
    }
}

/// `vmread` a field of the current VMCS.
///
/// # Safety
/// Only valid with a current VMCS.
pub unsafe fn vmread(field: Field) -> Result<u64, HvError> {
    let value: u64;
    let err: u8;
    asm!(
        "clc",
        "vmread {}, {}",
        "setna {}",
        out(reg) value,
        in(reg) field as u64,
        out(reg_byte) err,
    );
    if err != 0 {
        Err(HvError::VmxFailure)
    } else {
        Ok(value)
    }
}

/// `vmwrite` a field of the current VMCS.
///
/// # Safety
/// Only valid with a current VMCS.
pub unsafe fn vmwrite(field: Field, value: u64) -> Result<(), HvError> {
    let err: u8;
    asm!(
        "clc",
        "vmwrite {}, {}",
        "setna {}",
        in(reg) field as u64,
        in(reg) value,
        out(reg_byte) err,
    );
    if err != 0 {
        Err(HvError::VmxFailure)
    } else {
        Ok(())
    }
}

/// `invept` in all-context mode: flush every EPT-derived translation on
/// this core.
///
/// # Safety
/// Only valid in VMX operation on a processor reporting all-context
/// INVEPT support.
pub unsafe fn invept_all() {
    // Type 2 = all-context; the descriptor is ignored but must be
    // addressable.
    let descriptor = [0u64; 2];
    asm!(
        "invept {}, [{}]",
        in(reg) 2u64,
        in(reg) descriptor.as_ptr(),
    );
}

/// The hyperclient call: `vmcall` with the fixed register marshalling —
/// operation in RCX, arguments in RDX/R8/R9, status back in RAX.
///
/// # Safety
/// The core must be in VMX non-root operation under this hypervisor;
/// anywhere else, `vmcall` faults or lands in a foreign hypervisor.
pub unsafe fn vmcall(op: u64, arg1: u64, arg2: u64, arg3: u64) -> u64 {
    let status: u64;
    asm!(
        "vmcall",
        inout("rcx") op => _,
        in("rdx") arg1,
        in("r8") arg2,
        in("r9") arg3,
        lateout("rax") status,
    );
    status
}
