//! mzhv — a type-II hypervisor core for Intel VT-x with split-view EPT
//! remapping.
//!
//! The crate virtualizes an already-running x86-64 system: every logical
//! core keeps executing the same operating system, but underneath an
//! identity-mapped set of Extended Page Tables. On top of that baseline the
//! hypervisor offers one unusual service: a single guest-physical 4 KiB
//! page can be redirected to *two* host-physical frames at once — one frame
//! answers data reads and writes, the other answers instruction fetches.
//! The guest cannot read its own instructions or execute its own data on
//! such a page, and it cannot tell that the split exists.
//!
//! ## How the split works
//!
//! An installed mapping starts *dormant*: the EPT leaf for the page carries
//! no read, write, or fetch permission. The first access of either kind
//! raises an EPT violation. The violation handler looks up the mapping
//! record, points the leaf at the frame matching the access kind, and
//! grants only that kind's permissions — so the *other* kind traps next
//! time, swapping the view back. The guest ping-pongs between the two
//! frames forever, one INVEPT per flip.
//!
//! ## Crate layout
//!
//! - [`ept`] — four-level EPT build / walk / split / mutate, from a
//!   fixed-capacity per-core split arena.
//! - [`mtrr`] — projects the host MTRR configuration onto 2 MiB EPT leaves.
//! - [`context`] — per-core state: VMXON/VMCS regions, MSR bitmap, root
//!   stack, split arena, mapping table.
//! - [`vmexit`] — the root-mode dispatcher for CPUID, VMCALL and
//!   EPT-violation exits.
//! - [`mapping`] — install/remove entry points that broadcast to every
//!   core, and the root-mode engine they land in.
//! - [`vmm`] — enable/disable lifecycle.
//! - [`control`] — the `MZHV` control-device surface.
//! - [`platform`] — the traits the embedding driver implements: host
//!   memory, CPU intrinsics, descriptor tables, VMX instructions, and the
//!   inter-processor broadcast.
//!
//! The crate is `no_std` + `alloc`; all hardware access flows through the
//! [`platform`] traits, which is also what makes the whole state machine
//! testable on a plain host (see the `tests/` directory).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addressing;
pub mod context;
pub mod control;
pub mod ept;
pub mod mapping;
pub mod msr;
pub mod mtrr;
pub mod platform;
pub mod vm_control;
pub mod vmcs;
pub mod vmexit;
pub mod vmm;
#[cfg(target_arch = "x86_64")]
pub mod vmx;

/// Errors surfaced by the hypervisor.
///
/// Hardware-prerequisite and allocation failures abort [`vmm::enable`]
/// wholesale; invalid requests are returned through the IOCTL / VMCALL
/// result without touching global state. Contract violations inside the
/// root-mode handler do not produce an `HvError` — they bug-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvError {
    /// Not an Intel processor, VMX missing, or no true-controls support.
    UnsupportedProcessor,
    /// IA32_FEATURE_CONTROL is locked with VMX-outside-SMX disabled.
    VmxLockedOff,
    /// Out of non-paged executable pool.
    AllocationFailed,
    /// Overlapping variable MTRRs with an unresolvable type combination.
    MtrrConflict,
    /// A VMX instruction reported failure.
    VmxFailure,
    /// Malformed request (unaligned address, short input buffer,
    /// unknown control code).
    InvalidParameter,
    /// All 32 mapping-table slots are in use on some core.
    MappingTableFull,
    /// All 32 split-arena slots are in use on some core.
    SplitCapacity,
    /// One of the requested frames already participates in a mapping.
    AliasCollision,
    /// Remove was asked for a guest frame that has no mapping.
    NotMapped,
    /// A core reported a status code this build does not know.
    Unspecified,
}

/// Status value meaning "success" on the hyperclient RAX channel.
pub const STATUS_SUCCESS: u64 = 0;

impl HvError {
    /// Encode for the RAX result channel of a hyperclient call.
    pub const fn status(self) -> u64 {
        match self {
            HvError::UnsupportedProcessor => 1,
            HvError::VmxLockedOff => 2,
            HvError::AllocationFailed => 3,
            HvError::MtrrConflict => 4,
            HvError::VmxFailure => 5,
            HvError::InvalidParameter => 6,
            HvError::MappingTableFull => 7,
            HvError::SplitCapacity => 8,
            HvError::AliasCollision => 9,
            HvError::NotMapped => 10,
            HvError::Unspecified => 11,
        }
    }

    /// Decode a status that crossed the RAX channel.
    pub const fn from_status(status: u64) -> Result<(), HvError> {
        match status {
            0 => Ok(()),
            1 => Err(HvError::UnsupportedProcessor),
            2 => Err(HvError::VmxLockedOff),
            3 => Err(HvError::AllocationFailed),
            4 => Err(HvError::MtrrConflict),
            5 => Err(HvError::VmxFailure),
            6 => Err(HvError::InvalidParameter),
            7 => Err(HvError::MappingTableFull),
            8 => Err(HvError::SplitCapacity),
            9 => Err(HvError::AliasCollision),
            10 => Err(HvError::NotMapped),
            _ => Err(HvError::Unspecified),
        }
    }
}

/// Collapse a result into the RAX status encoding.
pub fn status_of(r: Result<(), HvError>) -> u64 {
    match r {
        Ok(()) => STATUS_SUCCESS,
        Err(e) => e.status(),
    }
}
