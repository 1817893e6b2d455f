use tracing::warn;

use crate::error::Result;
use crate::local::LocalStore;
use crate::record::{Entity, Record, RecordId};

/// Repairs identifier-representation drift: a record created under the old
/// auto-increment schema lives locally as `Legacy(7)` while the remote copy
/// of the same logical record is keyed by the canonical string `"7"`. This is
/// a compatibility bridge only; it never matches on field content.
///
/// Local rows whose id differs from `incoming_id` in representation but not
/// in canonical string form.
pub fn representation_mismatches<'a, E>(
    locals: &'a [Record<E>],
    incoming_id: &RecordId,
) -> Vec<&'a Record<E>> {
    let canonical = incoming_id.canonical();
    locals
        .iter()
        .filter(|record| record.id != *incoming_id && record.id.canonical() == canonical)
        .collect()
}

/// Removes mismatched rows that the canonical `incoming` record supersedes,
/// so exactly one row remains per logical record after the pull write. A
/// mismatched row that is *newer* than the incoming record is left alone
/// (never silently drop the winning copy); it is surfaced as a diagnostic
/// and unified by a later run once timestamps settle. Returns the number of
/// rows removed.
pub fn repair_before_put<E: Entity>(
    store: &LocalStore,
    locals: &[Record<E>],
    incoming: &Record<E>,
) -> Result<usize> {
    let mut healed = 0;
    for stale in representation_mismatches(locals, &incoming.id) {
        if stale.last_modified > incoming.last_modified {
            warn!(
                collection = E::COLLECTION,
                id = %stale.id,
                canonical = %incoming.id,
                "keeping newer legacy-keyed row alongside canonical copy"
            );
            continue;
        }
        store.remove::<E>(&stale.group_id, &stale.id)?;
        healed += 1;
    }
    Ok(healed)
}
