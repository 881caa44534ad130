//! The split-mapping engine.
//!
//! Two halves live here. The *kernel-context* half ([`install`],
//! [`remove`]) translates caller virtual addresses to physical frames,
//! then broadcasts a hyperclient call so every core applies the change in
//! its own root mode — a mapping exists on all cores or on none. The
//! *root-mode* half ([`handle_install`], [`handle_remove`], the flip
//! functions) is what those hyperclient calls land in, via the VMCALL
//! dispatcher.
//!
//! An installed mapping's EPT leaf is always in exactly one of three
//! states:
//!
//! - **dormant** — no permissions; any access traps,
//! - **R/W active** — leaf points at the rw target, fetch traps,
//! - **fetch active** — leaf points at the fetch target, data access
//!   traps.
//!
//! Install parks the leaf dormant and every EPT violation flips it to the
//! view the access wants, leaving the opposite kind armed to trap.

use log::{debug, info};

use crate::addressing::{Gpa, Hpa, Hva};
use crate::context::{LogicalCore, MappingRecord};
use crate::ept::{EptPointer, ExtendedPageTable};
use crate::platform::Platform;
use crate::vmexit::{VMCALL_INSTALL, VMCALL_REMOVE};
use crate::HvError;

/// Install a split mapping on every core.
///
/// `original` is the page whose guest-physical identity gets split;
/// `rw` serves its data view and `fetch` its code view. All three are
/// caller virtual addresses, translated here; all three must be
/// page-aligned (enforced in root mode against the translated frames).
pub fn install<P: Platform>(p: &P, original: Hva, rw: Hva, fetch: Hva) -> Result<(), HvError> {
    let guest = p.virt_to_phys(original);
    let rw = p.virt_to_phys(rw);
    let fetch = p.virt_to_phys(fetch);

    info!("mapping: install guest={guest} rw={rw} fetch={fetch}");

    let status = p.broadcast(&|| {
        p.vmcall(
            VMCALL_INSTALL,
            guest.into_u64(),
            rw.into_u64(),
            fetch.into_u64(),
        )
    });
    HvError::from_status(status)
}

/// Remove the split mapping of `original` on every core, restoring the
/// identity view.
pub fn remove<P: Platform>(p: &P, original: Hva) -> Result<(), HvError> {
    let guest = p.virt_to_phys(original);

    info!("mapping: remove guest={guest}");

    let status = p.broadcast(&|| p.vmcall(VMCALL_REMOVE, guest.into_u64(), 0, 0));
    HvError::from_status(status)
}

/// Root-mode install on the current core.
///
/// Validation happens in a fixed order so a failure at any step leaves
/// the core untouched: alignment, alias scan, table capacity, then the
/// EPT mutation (which may consume a split slot and is the only step
/// with a side effect), and only then the record store.
pub(crate) fn handle_install<P: Platform>(
    p: &P,
    core: &mut LogicalCore,
    guest: u64,
    rw: u64,
    fetch: u64,
) -> Result<(), HvError> {
    let guest = Hpa::new(guest);
    let rw = Hpa::new(rw);
    let fetch = Hpa::new(fetch);

    if !guest.is_page_aligned() || !rw.is_page_aligned() || !fetch.is_page_aligned() {
        return Err(HvError::InvalidParameter);
    }
    if core.mappings.aliases(guest, rw, fetch) {
        return Err(HvError::AliasCollision);
    }
    if core.mappings.is_full() {
        return Err(HvError::MappingTableFull);
    }

    // Park the leaf dormant: identity frame, no permissions. The first
    // touch of either kind will fault into the flip path.
    let mut ept = ExtendedPageTable::from_eptp(p, EptPointer::from_bits(core.eptp));
    ept.change_mapping(
        p,
        &mut core.split_arena,
        Gpa::new(guest.into_u64()),
        guest,
        false,
        false,
    )?;

    let slot = core.mappings.first_free().expect("capacity checked above");
    *slot = MappingRecord {
        guest,
        rw_target: rw,
        fetch_target: fetch,
        valid: true,
    };

    p.invept_all();
    debug!("mapping: core {} installed {guest}", p.core_id());
    Ok(())
}

/// Root-mode remove on the current core: restore the identity leaf with
/// full permissions and invalidate the record.
pub(crate) fn handle_remove<P: Platform>(
    p: &P,
    core: &mut LogicalCore,
    guest: u64,
) -> Result<(), HvError> {
    let guest = Hpa::new(guest);
    if core.mappings.find(guest).is_none() {
        return Err(HvError::NotMapped);
    }

    let mut ept = ExtendedPageTable::from_eptp(p, EptPointer::from_bits(core.eptp));
    ept.change_mapping(
        p,
        &mut core.split_arena,
        Gpa::new(guest.into_u64()),
        guest,
        true,
        true,
    )?;

    *core.mappings.find_mut(guest).expect("presence checked above") = MappingRecord::default();

    p.invept_all();
    debug!("mapping: core {} removed {guest}", p.core_id());
    Ok(())
}

/// Flip the leaf to the data view: frame = rw target, read/write allowed,
/// fetch armed to trap.
pub(crate) fn flip_to_rw<P: Platform>(p: &P, core: &mut LogicalCore, guest: Gpa) {
    flip(p, core, guest, false)
}

/// Flip the leaf to the code view: frame = fetch target, fetch allowed,
/// data access armed to trap.
pub(crate) fn flip_to_fetch<P: Platform>(p: &P, core: &mut LogicalCore, guest: Gpa) {
    flip(p, core, guest, true)
}

fn flip<P: Platform>(p: &P, core: &mut LogicalCore, guest: Gpa, fetch_view: bool) {
    let record = *core
        .mappings
        .find(Hpa::new(guest.into_u64()))
        .unwrap_or_else(|| panic!("EPT violation at {guest} without a registered mapping"));

    let target = if fetch_view {
        record.fetch_target
    } else {
        record.rw_target
    };

    let mut ept = ExtendedPageTable::from_eptp(p, EptPointer::from_bits(core.eptp));
    ept.change_mapping(
        p,
        &mut core.split_arena,
        guest,
        target,
        !fetch_view,
        fetch_view,
    )
    .expect("an installed mapping's page is already split");

    p.invept_all();
}
