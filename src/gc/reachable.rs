//! Reachability: which segments are still live from a given root.
//!
//! Reachability is computed over the inter-segment reference graph (the
//! same `refs` header list recorded in every segment and mirrored into each
//! sealed archive's `.gph` footer), not by walking individual records. A
//! segment is live iff some chain of segment references leads to it from
//! the repository's root segment — exactly the question the archive's
//! graph footer exists to answer cheaply, without re-parsing every segment.

use crate::error::Result;
use crate::id::SegmentId;
use crate::store::Store;
use std::collections::HashSet;

/// The repository head's segment plus every retained checkpoint's segment —
/// everything GC must treat as a live starting point.
#[must_use]
pub fn gc_roots(store: &Store) -> Vec<SegmentId> {
    let mut roots: Vec<SegmentId> = store.head().into_iter().map(|r| r.segment_id).collect();
    roots.extend(store.extra_roots().into_iter().map(|r| r.segment_id));
    roots
}

/// Returns every segment reachable from any of `roots`, inclusive. Callers
/// pass the repository head's segment alongside every retained checkpoint's
/// segment (see [`crate::store::Store::extra_roots`]) so that a checkpoint
/// referencing history the head has moved past still survives GC.
pub fn compute_reachable<I: IntoIterator<Item = SegmentId>>(store: &Store, roots: I) -> Result<HashSet<SegmentId>> {
    let mut visited = HashSet::new();
    let mut stack: Vec<SegmentId> = roots.into_iter().collect();

    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        for r in refs_of(store, id)? {
            if !visited.contains(&r) {
                stack.push(r);
            }
        }
    }

    Ok(visited)
}

/// The reference list for `id`, preferring a sealed archive's `.gph` graph
/// entry (no parse needed) and falling back to loading and parsing the
/// segment itself (covers segments still buffered in the in-flight writer).
fn refs_of(store: &Store, id: SegmentId) -> Result<Vec<SegmentId>> {
    for reader in store.readers_snapshot().iter().rev() {
        if let Some(refs) = reader.graph().get(&id) {
            return Ok(refs.clone());
        }
    }
    let segment = store.read_segment(id)?;
    Ok(segment.refs().to_vec())
}
