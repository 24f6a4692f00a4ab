//! Cleanup: the second generational GC phase. Reclaims archive space held
//! by segments that compaction has already copied forward into a newer
//! generation (so a byte-identical copy with a later generation tag exists
//! elsewhere) or that are no longer reachable from the current head at all.

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::error::Result;
use crate::file::archive_file_name;
use crate::store::Store;
use std::sync::Arc;

/// Summary of one cleanup pass, handed to the configured
/// [`super::monitor::GcMonitor`] and returned to direct callers of
/// [`Store::cleanup`](crate::store::Store::cleanup).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CleanupReport {
    pub archives_rewritten: usize,
    pub archives_removed: usize,
    pub bytes_reclaimed: u64,
}

/// Runs one cleanup pass against the store's current head.
///
/// An archive file whose every entry is unreachable (or superseded by a
/// strictly newer generation already retained elsewhere) is removed outright.
/// An archive whose reclaimable share exceeds `rewrite_threshold_pct` is
/// rewritten to hold only its still-needed entries. Anything below that
/// threshold is left alone — rewriting is only worth its own I/O cost once
/// enough of a file is actually dead.
pub fn run(store: &Store) -> Result<CleanupReport> {
    let opts = &store.config().gc_options;
    let retained_generations = opts.retained_generations.max(2);
    let rewrite_threshold_pct = u64::from(opts.rewrite_threshold_pct);
    let current_generation = store.current_generation();
    let reclaim_below = current_generation.saturating_sub(retained_generations - 1);

    if store.head().is_none() && store.extra_roots().is_empty() {
        return Ok(CleanupReport::default());
    }
    let reachable = super::reachable::compute_reachable(store, super::reachable::gc_roots(store))?;

    let readers = store.readers_snapshot();
    let mut next_readers = Vec::with_capacity(readers.len());
    let mut report = CleanupReport::default();

    for reader in readers {
        let mut live_bytes = 0u64;
        let mut dead_bytes = 0u64;
        let mut live_ids = Vec::new();

        for id in reader.ids() {
            let size = reader.size_of(id).unwrap_or(0);
            let generation = reader.generation_of(id).unwrap_or(0);
            let reclaimable = generation < reclaim_below && !reachable.contains(&id);
            if reclaimable {
                dead_bytes += size;
            } else {
                live_bytes += size;
                live_ids.push(id);
            }
        }

        if dead_bytes == 0 {
            next_readers.push(reader);
            continue;
        }

        if live_ids.is_empty() {
            log::info!("cleanup removing empty archive {:?}", reader.path());
            let path = reader.path().to_path_buf();
            reader.close();
            std::fs::remove_file(&path)?;
            report.archives_removed += 1;
            report.bytes_reclaimed += dead_bytes;
            continue;
        }

        let total = live_bytes + dead_bytes;
        let reclaimable_pct = if total == 0 { 0 } else { dead_bytes * 100 / total };
        if reclaimable_pct < rewrite_threshold_pct {
            next_readers.push(reader);
            continue;
        }

        let rewritten = rewrite_archive(store, &reader, &live_ids)?;
        log::info!(
            "cleanup rewrote {:?} -> {:?}, reclaiming {} bytes",
            reader.path(),
            rewritten.path(),
            dead_bytes
        );
        let old_path = reader.path().to_path_buf();
        reader.close();
        std::fs::remove_file(&old_path)?;

        report.archives_rewritten += 1;
        report.bytes_reclaimed += dead_bytes;
        next_readers.push(Arc::new(rewritten));
    }

    store.replace_readers(next_readers);
    store.config().gc_monitor.cleanup_succeeded(&report);
    Ok(report)
}

/// Writes a fresh archive file holding only `live_ids` from `reader`, seals
/// it and opens it back up as a reader. The caller is responsible for
/// removing `reader`'s underlying file only after this succeeds, so a crash
/// mid-rewrite never loses data.
fn rewrite_archive(
    store: &Store,
    reader: &ArchiveReader,
    live_ids: &[crate::id::SegmentId],
) -> Result<ArchiveReader> {
    let (file_index, file_generation) = reader
        .path()
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(crate::file::parse_archive_file_name)
        .map(|(index, file_generation)| (index, file_generation + 1))
        .unwrap_or((0, 0));

    let new_path = store.path().join(archive_file_name(file_index, file_generation));
    let mut writer = ArchiveWriter::create(&new_path)?;

    for id in live_ids {
        let bytes = reader.read(*id)?;
        let segment_generation = reader.generation_of(*id).unwrap_or(0);
        let refs = reader.graph().get(id).cloned().unwrap_or_default();
        writer.append_segment(*id, segment_generation, &bytes, &refs)?;
    }

    let sealed_path = writer.seal()?;
    crate::file::fsync_directory(store.path())?;
    ArchiveReader::open(&sealed_path, store.config().memory_mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GcOptions};
    use crate::id::{RecordId, SegmentId, SegmentKind, Version};
    use crate::record::block::write_block;
    use crate::segment::Builder;
    use crate::writer_pool::SegmentSink;
    use test_log::test;

    #[test]
    fn no_head_is_a_no_op() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(Config::new(dir.path()))?;
        let report = run(&store)?;
        assert_eq!(report, CleanupReport::default());
        store.close()?;
        Ok(())
    }

    #[test]
    fn rewrites_archive_once_past_threshold() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(
            Config::new(dir.path()).gc_options(GcOptions {
                retained_generations: 2,
                rewrite_threshold_pct: 10,
                ..GcOptions::default()
            }),
        )?;

        let root_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut root_builder = Builder::new(0);
        let offset = write_block(&mut root_builder, b"root");
        let (root_bytes, _) = root_builder.seal(root_id)?;
        store.write_segment(root_id, 0, &root_bytes, &[])?;
        store.compare_and_set_head(None, RecordId::new(root_id, offset))?;

        let orphan_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut orphan_builder = Builder::new(0);
        write_block(&mut orphan_builder, &vec![1u8; 128]);
        let (orphan_bytes, _) = orphan_builder.seal(orphan_id)?;
        store.write_segment(orphan_id, 0, &orphan_bytes, &[])?;

        // Force both segments into a sealed archive so cleanup can act on
        // them (cleanup only rewrites sealed readers, never the live
        // writer).
        store.close()?;
        let store = Store::open(Config::new(dir.path()).gc_options(GcOptions {
            retained_generations: 2,
            rewrite_threshold_pct: 10,
            ..GcOptions::default()
        }))?;
        for _ in 0..5 {
            store.advance_generation();
        }

        let report = run(&store)?;
        assert!(report.archives_rewritten >= 1 || report.archives_removed >= 1);
        assert!(store.contains_segment(root_id));
        store.close()?;
        Ok(())
    }
}
