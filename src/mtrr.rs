//! Memory-Type Range Register resolution.
//!
//! EPT leaves carry an explicit memory type, so the identity mapping must
//! reproduce whatever cacheability the host has configured through its
//! MTRRs — mapping a UC device region as write-back would be a spectacular
//! way to corrupt MMIO. The configuration is read **once** at enable time
//! and projected onto the 2 MiB leaves; later MTRR changes are
//! deliberately not tracked.
//!
//! See Intel SDM Vol. 3A, 11.11 "Memory Type Range Registers".

use alloc::vec::Vec;

use crate::addressing::PAGE_SHIFT;
use crate::msr;
use crate::platform::Cpu;
use crate::HvError;

/// CPUID.1 EDX bit signalling MTRR support.
const CPUID_FEATURE_MTRR: u32 = 1 << 12;

/// An MTRR memory type. The numeric values are architectural.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryType {
    Uncacheable = 0,
    WriteCombining = 1,
    WriteThrough = 4,
    WriteProtected = 5,
    WriteBack = 6,
}

impl MemoryType {
    /// Decode an architectural type value.
    pub const fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(MemoryType::Uncacheable),
            1 => Some(MemoryType::WriteCombining),
            4 => Some(MemoryType::WriteThrough),
            5 => Some(MemoryType::WriteProtected),
            6 => Some(MemoryType::WriteBack),
            _ => None,
        }
    }

    /// Architectural type value.
    pub const fn bits(self) -> u64 {
        self as u64
    }
}

/// One decoded variable-range register pair.
#[derive(Debug, Clone, Copy)]
struct VariableRange {
    base: u64,
    length: u64,
    mem_type: MemoryType,
}

/// The eleven fixed-range MSRs in ascending address order, with the block
/// size each of their bytes covers, in KiB.
const FIXED_RANGE_MSRS: [(u32, u64); 11] = [
    (msr::IA32_MTRR_FIX64K_00000, 64),
    (msr::IA32_MTRR_FIX16K_80000, 16),
    (msr::IA32_MTRR_FIX16K_A0000, 16),
    (msr::IA32_MTRR_FIX4K_C0000, 4),
    (msr::IA32_MTRR_FIX4K_C8000, 4),
    (msr::IA32_MTRR_FIX4K_D0000, 4),
    (msr::IA32_MTRR_FIX4K_D8000, 4),
    (msr::IA32_MTRR_FIX4K_E0000, 4),
    (msr::IA32_MTRR_FIX4K_E8000, 4),
    (msr::IA32_MTRR_FIX4K_F0000, 4),
    (msr::IA32_MTRR_FIX4K_F8000, 4),
];

/// Number of 4 KiB pages the fixed ranges cover (the first 1 MiB).
pub const FIXED_RANGE_PAGES: usize = 256;

/// A one-shot snapshot of the host MTRR configuration.
pub struct MtrrSnapshot {
    supported: bool,
    enabled: bool,
    fixed_enabled: bool,
    default_type: MemoryType,
    variable: Vec<VariableRange>,
    fixed: [u64; FIXED_RANGE_MSRS.len()],
}

impl MtrrSnapshot {
    /// Capture the MTRR configuration of the current core.
    pub fn read<C: Cpu>(cpu: &C) -> Self {
        let supported = cpu.cpuid(1, 0).edx & CPUID_FEATURE_MTRR != 0;
        let def_type = cpu.read_msr(msr::IA32_MTRR_DEF_TYPE);
        let cap = cpu.read_msr(msr::IA32_MTRRCAP);

        let enabled = def_type & (1 << 11) != 0;
        let fixed_enabled = cap & (1 << 8) != 0 && def_type & (1 << 10) != 0;
        let default_type =
            MemoryType::from_bits(def_type & 0xff).unwrap_or(MemoryType::Uncacheable);

        let mut variable = Vec::new();
        if supported && enabled {
            let count = (cap & 0xff) as u32;
            for index in 0..count {
                let base = cpu.read_msr(msr::IA32_MTRR_PHYSBASE0 + msr::IA32_MTRR_PAIR_STRIDE * index);
                let mask = cpu.read_msr(msr::IA32_MTRR_PHYSMASK0 + msr::IA32_MTRR_PAIR_STRIDE * index);
                if mask & (1 << 11) == 0 {
                    continue;
                }
                // The mask describes a power-of-two length: the lowest set
                // bit of its frame-number portion.
                let mask_address = (mask >> PAGE_SHIFT) << PAGE_SHIFT;
                if mask_address == 0 {
                    continue;
                }
                let Some(mem_type) = MemoryType::from_bits(base & 0xff) else {
                    continue;
                };
                variable.push(VariableRange {
                    base: (base >> PAGE_SHIFT) << PAGE_SHIFT,
                    length: 1u64 << mask_address.trailing_zeros(),
                    mem_type,
                });
            }
        }

        let mut fixed = [0u64; FIXED_RANGE_MSRS.len()];
        if supported && enabled && fixed_enabled {
            for (slot, (index, _)) in fixed.iter_mut().zip(FIXED_RANGE_MSRS.iter()) {
                *slot = cpu.read_msr(*index);
            }
        }

        MtrrSnapshot {
            supported,
            enabled,
            fixed_enabled,
            default_type,
            variable,
            fixed,
        }
    }

    /// Whether MTRRs are present and globally enabled.
    pub fn active(&self) -> bool {
        self.supported && self.enabled
    }

    /// Whether the first MiB must be overlaid with the fixed ranges.
    pub fn fixed_overlay(&self) -> bool {
        self.active() && self.fixed_enabled
    }

    /// Resolve the memory type of a physical address against the variable
    /// ranges.
    ///
    /// Precedence follows the SDM: a single hit wins outright; UC beats
    /// any mixture; exactly {WT, WB} collapses to WT; any other plurality
    /// is an inconsistent configuration and fails; no hit at all falls
    /// back to the default type.
    pub fn resolve(&self, address: u64) -> Result<MemoryType, HvError> {
        let mut uc = false;
        let mut wc = false;
        let mut wt = false;
        let mut wp = false;
        let mut wb = false;

        for range in &self.variable {
            if address < range.base || address >= range.base + range.length {
                continue;
            }
            match range.mem_type {
                MemoryType::Uncacheable => uc = true,
                MemoryType::WriteCombining => wc = true,
                MemoryType::WriteThrough => wt = true,
                MemoryType::WriteProtected => wp = true,
                MemoryType::WriteBack => wb = true,
            }
        }

        let hits = uc as u32 + wc as u32 + wt as u32 + wp as u32 + wb as u32;
        if hits == 1 {
            return Ok(if uc {
                MemoryType::Uncacheable
            } else if wc {
                MemoryType::WriteCombining
            } else if wt {
                MemoryType::WriteThrough
            } else if wp {
                MemoryType::WriteProtected
            } else {
                MemoryType::WriteBack
            });
        }
        if uc {
            return Ok(MemoryType::Uncacheable);
        }
        if wt && wb && hits == 2 {
            return Ok(MemoryType::WriteThrough);
        }
        if hits != 0 {
            return Err(HvError::MtrrConflict);
        }
        Ok(self.default_type)
    }

    /// Expand the fixed ranges into a per-4 KiB-page type table for the
    /// first MiB, in ascending page order.
    pub fn fixed_page_types(&self) -> [MemoryType; FIXED_RANGE_PAGES] {
        let mut types = [MemoryType::Uncacheable; FIXED_RANGE_PAGES];
        let mut page = 0;
        for (value, (_, block_kib)) in self.fixed.iter().zip(FIXED_RANGE_MSRS.iter()) {
            for byte_index in 0..8 {
                let raw = (value >> (byte_index * 8)) & 0xff;
                let mem_type =
                    MemoryType::from_bits(raw & 0x7).unwrap_or(MemoryType::Uncacheable);
                for _ in 0..(block_kib / 4) {
                    types[page] = mem_type;
                    page += 1;
                }
            }
        }
        debug_assert_eq!(page, FIXED_RANGE_PAGES);
        types
    }
}
