//! Model-specific register indices used outside the VMX capability set.
//!
//! VMX capability MSRs live in [`crate::vm_control`].

/// MTRR capability register.
pub const IA32_MTRRCAP: u32 = 0xFE;
/// Base of the variable-range MTRR base/mask pairs.
pub const IA32_MTRR_PHYSBASE0: u32 = 0x200;
/// Mask side of the first variable-range pair.
pub const IA32_MTRR_PHYSMASK0: u32 = 0x201;
/// Stride between consecutive PHYSBASE (and PHYSMASK) registers.
pub const IA32_MTRR_PAIR_STRIDE: u32 = 2;

/// Fixed-range MTRR covering 0x00000..0x80000 in 64 KiB blocks.
pub const IA32_MTRR_FIX64K_00000: u32 = 0x250;
/// Fixed-range MTRR covering 0x80000..0xA0000 in 16 KiB blocks.
pub const IA32_MTRR_FIX16K_80000: u32 = 0x258;
/// Fixed-range MTRR covering 0xA0000..0xC0000 in 16 KiB blocks.
pub const IA32_MTRR_FIX16K_A0000: u32 = 0x259;
/// Fixed-range MTRRs covering 0xC0000..0x100000 in 4 KiB blocks.
pub const IA32_MTRR_FIX4K_C0000: u32 = 0x268;
pub const IA32_MTRR_FIX4K_C8000: u32 = 0x269;
pub const IA32_MTRR_FIX4K_D0000: u32 = 0x26A;
pub const IA32_MTRR_FIX4K_D8000: u32 = 0x26B;
pub const IA32_MTRR_FIX4K_E0000: u32 = 0x26C;
pub const IA32_MTRR_FIX4K_E8000: u32 = 0x26D;
pub const IA32_MTRR_FIX4K_F0000: u32 = 0x26E;
pub const IA32_MTRR_FIX4K_F8000: u32 = 0x26F;
/// MTRR default-type register.
pub const IA32_MTRR_DEF_TYPE: u32 = 0x2FF;

/// Debug-control MSR, mirrored into the VMCS guest area.
pub const IA32_DEBUGCTL: u32 = 0x1D9;
/// SYSENTER CS/ESP/EIP, mirrored into guest and host areas.
pub const IA32_SYSENTER_CS: u32 = 0x174;
pub const IA32_SYSENTER_ESP: u32 = 0x175;
pub const IA32_SYSENTER_EIP: u32 = 0x176;
/// FS/GS base registers.
pub const IA32_FS_BASE: u32 = 0xC0000100;
pub const IA32_GS_BASE: u32 = 0xC0000101;
