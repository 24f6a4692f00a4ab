//! Estimates how much archive space compaction could reclaim, without
//! actually rewriting anything. Cheap relative to a full compaction pass:
//! it walks the reference graph (see [`super::reachable`]) but never loads
//! record payloads or rewrites segments.

use crate::error::Result;
use crate::store::Store;

/// A point-in-time estimate of reclaimable archive space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Estimate {
    pub total_bytes: u64,
    pub reachable_bytes: u64,
    pub reclaimable_pct: u8,
}

/// Computes [`Estimate`] against the current head. Returns an all-zero
/// estimate if the repository has no head yet (nothing to reclaim).
pub fn run(store: &Store) -> Result<Estimate> {
    if store.head().is_none() && store.extra_roots().is_empty() {
        return Ok(Estimate::default());
    }

    let reachable = super::reachable::compute_reachable(store, super::reachable::gc_roots(store))?;

    let mut total_bytes = 0u64;
    let mut reachable_bytes = 0u64;
    for reader in store.readers_snapshot() {
        for id in reader.ids() {
            let size = reader.size_of(id).unwrap_or(0);
            total_bytes += size;
            if reachable.contains(&id) {
                reachable_bytes += size;
            }
        }
    }
    for (id, size, _generation) in store.current_writer_entries() {
        total_bytes += size;
        if reachable.contains(&id) {
            reachable_bytes += size;
        }
    }

    let reclaimable_pct = if total_bytes == 0 {
        0
    } else {
        let reclaimable = total_bytes.saturating_sub(reachable_bytes);
        ((reclaimable.saturating_mul(100)) / total_bytes).min(100) as u8
    };

    Ok(Estimate {
        total_bytes,
        reachable_bytes,
        reclaimable_pct,
    })
}
