//! Compaction: the first generational GC phase. Copies every segment still
//! reachable from the current head forward into the next generation, then
//! checks that the head hasn't moved underneath it before handing off to
//! [`super::cleanup`].
//!
//! Segment ids are random (not content hashes, see [`crate::id::SegmentId`]),
//! so "copying forward" re-archives a segment's id, refs and record payload
//! unchanged, only re-encoding its header to declare the bumped generation
//! (see [`crate::segment::Segment::reheadered`]). Every [`crate::id::RecordId`]
//! that points into it — including the repository head itself — stays valid
//! without rewriting a single offset.

use crate::error::Result;
use crate::id::SegmentId;
use crate::store::Store;
use crate::writer_pool::SegmentSink;
use std::collections::HashSet;

/// Runs one compaction cycle. Returns `true` if a new generation was
/// produced, `false` if compaction was skipped (too little to reclaim) or
/// abandoned (the head kept moving faster than compaction could keep up).
pub fn run(store: &Store) -> Result<bool> {
    let monitor = &store.config().gc_monitor;
    let opts = &store.config().gc_options;

    let estimate = super::estimate::run(store)?;
    if estimate.reclaimable_pct < opts.gain_threshold_pct {
        monitor.compaction_skipped(estimate.reclaimable_pct, opts.gain_threshold_pct);
        return Ok(false);
    }

    monitor.compaction_started();

    let retry_count = opts.retry_count;
    let mut attempt = 0u32;

    loop {
        let Some(head) = store.head() else {
            return Ok(false);
        };

        let reachable = super::reachable::compute_reachable(store, super::reachable::gc_roots(store))?;
        let new_generation = store.current_generation() + 1;
        let copied = copy_forward(store, &reachable, new_generation)?;

        if store.head() == Some(head) {
            store.advance_generation();
            monitor.compaction_succeeded(new_generation, copied);
            store.cleanup()?;
            return Ok(true);
        }

        attempt += 1;
        if attempt > retry_count {
            if opts.force_after_fail {
                let Some(head) = store.head() else {
                    return Ok(false);
                };
                let reachable = super::reachable::compute_reachable(store, super::reachable::gc_roots(store))?;
                let new_generation = store.current_generation() + 1;
                let copied = copy_forward(store, &reachable, new_generation)?;
                store.advance_generation();
                monitor.compaction_succeeded(new_generation, copied);
                store.cleanup()?;
                return Ok(true);
            }
            monitor.compaction_abandoned(attempt - 1);
            return Ok(false);
        }
    }
}

/// Re-archives every segment in `reachable` whose on-disk generation trails
/// `new_generation`, preserving its id, refs and payload exactly but
/// re-encoding the header so the segment itself reports `new_generation`
/// (not just the archive entry/index wrapping it). Returns how many
/// segments were actually copied (segments already at `new_generation` or
/// newer are skipped — nothing to do).
fn copy_forward(store: &Store, reachable: &HashSet<SegmentId>, new_generation: u32) -> Result<usize> {
    let mut copied = 0usize;
    for id in reachable {
        let segment = store.read_segment(*id)?;
        if segment.generation() >= new_generation {
            continue;
        }
        let refs = segment.refs().to_vec();
        let bytes = segment.reheadered(new_generation)?;
        store.write_segment(*id, new_generation, &bytes, &refs)?;
        copied += 1;
    }
    store.flush()?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GcOptions};
    use crate::id::{RecordId, SegmentKind, Version};
    use crate::record::block::write_block;
    use crate::segment::Builder;
    use test_log::test;

    #[test]
    fn below_threshold_is_skipped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(Config::new(dir.path()))?;

        let root_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);
        let offset = write_block(&mut builder, b"root");
        let (bytes, _) = builder.seal(root_id)?;
        store.write_segment(root_id, 0, &bytes, &[])?;
        store.compare_and_set_head(None, RecordId::new(root_id, offset))?;

        let ran = run(&store)?;
        assert!(!ran);
        store.close()?;
        Ok(())
    }

    #[test]
    fn reclaims_unreachable_segment_into_new_generation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(Config::new(dir.path()).gc_options(GcOptions {
            gain_threshold_pct: 1,
            ..GcOptions::default()
        }))?;

        let root_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut root_builder = Builder::new(0);
        let offset = write_block(&mut root_builder, b"root");
        let (root_bytes, _) = root_builder.seal(root_id)?;
        store.write_segment(root_id, 0, &root_bytes, &[])?;
        store.compare_and_set_head(None, RecordId::new(root_id, offset))?;

        let orphan_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut orphan_builder = Builder::new(0);
        write_block(&mut orphan_builder, &vec![7u8; 256]);
        let (orphan_bytes, _) = orphan_builder.seal(orphan_id)?;
        store.write_segment(orphan_id, 0, &orphan_bytes, &[])?;

        let head_before = store.head();
        let ran = run(&store)?;
        assert!(ran);
        assert_eq!(store.head(), head_before);
        assert!(store.contains_segment(root_id));
        store.close()?;
        Ok(())
    }
}
