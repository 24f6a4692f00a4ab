//! The central collaborator: owns the repository directory, the archive
//! readers/writer, the journal, the segment tracker/cache, the writer pool
//! and the background workers. Everything else in the crate (the record
//! codec, the node store, garbage collection) is built on top of the
//! `readSegment`/`writeSegment`/`getHead`/`setHead` contract this module
//! implements.

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::background::Background;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::file::{self, archive_file_name, is_legacy_archive_name, parse_archive_file_name};
use crate::id::{RecordId, SegmentId};
use crate::journal::Journal;
use crate::lock::RepoLock;
use crate::segment::{Segment, SegmentSource};
use crate::tracker::Tracker;
use crate::writer_pool::{SegmentSink, WriterPool};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

struct Inner {
    dir: PathBuf,
    config: Config,
    _lock: RepoLock,

    tracker: Tracker,
    cache: crate::cache::SegmentCache,
    writer_pool: WriterPool,

    readers: RwLock<Vec<Arc<ArchiveReader>>>,
    current_writer: Mutex<ArchiveWriter>,
    next_archive_index: AtomicU32,

    journal: Journal,
    head: Mutex<Option<RecordId>>,
    extra_roots: RwLock<Vec<RecordId>>,

    generation: AtomicU32,
    low_disk_space: AtomicBool,

    background: Mutex<Option<Background>>,
}

/// A handle to an open repository. Cheap to clone (an `Arc` underneath); all
/// clones share the same archives, cache and background workers.
#[derive(Clone)]
pub struct Store(Arc<Inner>);

impl Store {
    /// Opens (or creates) the repository described by `config`.
    pub fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;
        let lock = RepoLock::acquire(&config.path)?;

        upgrade_legacy_archive_names(&config.path)?;

        let mut archive_entries: Vec<(u32, u8, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&config.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((index, generation)) = parse_archive_file_name(name) {
                archive_entries.push((index, generation, entry.path()));
            }
        }
        archive_entries.sort_by_key(|(index, generation, _)| (*index, *generation));

        let mut readers = Vec::with_capacity(archive_entries.len());
        let mut max_index = None;
        let mut max_generation = 0u32;
        for (index, _gen, path) in &archive_entries {
            let reader = ArchiveReader::open(path, config.memory_mapping)?;
            for id in reader.ids() {
                if let Some(g) = reader.generation_of(id) {
                    max_generation = max_generation.max(g);
                }
            }
            max_index = Some(max_index.map_or(*index, |m: u32| m.max(*index)));
            readers.push(Arc::new(reader));
        }

        let next_index = max_index.map_or(0, |m| m + 1);
        let current_writer = ArchiveWriter::create(config.path.join(archive_file_name(next_index, 0)))?;

        let journal = Journal::at(&config.path);
        let head = resolve_head(&journal, &readers)?;

        let inner = Arc::new(Inner {
            dir: config.path.clone(),
            cache: crate::cache::SegmentCache::new(config.cache_size),
            config,
            _lock: lock,
            tracker: Tracker::new(),
            writer_pool: WriterPool::new(),
            readers: RwLock::new(readers),
            current_writer: Mutex::new(current_writer),
            next_archive_index: AtomicU32::new(next_index + 1),
            journal,
            head: Mutex::new(head),
            extra_roots: RwLock::new(Vec::new()),
            generation: AtomicU32::new(max_generation),
            low_disk_space: AtomicBool::new(false),
            background: Mutex::new(None),
        });

        let store = Self(inner);
        store.start_background();
        Ok(store)
    }

    fn start_background(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.0);

        let flush_weak = weak.clone();
        let compact_weak = weak.clone();
        let probe_weak = weak;

        let background = Background::start(
            move || {
                if let Some(inner) = flush_weak.upgrade() {
                    if let Err(e) = Self(inner).flush() {
                        log::warn!("background flush failed: {e}");
                    }
                }
            },
            move || {
                if let Some(inner) = compact_weak.upgrade() {
                    let store = Self(inner);
                    if !store.0.config.gc_options.paused {
                        if let Err(e) = store.compact() {
                            log::warn!("background compaction failed: {e}");
                        }
                    }
                }
            },
            move || {
                if let Some(inner) = probe_weak.upgrade() {
                    Self(inner).probe_disk_space();
                }
            },
        );

        *self.0.background.lock() = Some(background);
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.0.dir
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.0.config
    }

    #[must_use]
    pub(crate) fn tracker(&self) -> &Tracker {
        &self.0.tracker
    }

    #[must_use]
    pub(crate) fn writer_pool(&self) -> &WriterPool {
        &self.0.writer_pool
    }

    #[must_use]
    pub fn current_generation(&self) -> u32 {
        self.0.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_generation(&self) -> u32 {
        self.0.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[must_use]
    pub fn is_disk_space_low(&self) -> bool {
        self.0.low_disk_space.load(Ordering::SeqCst)
    }

    /// The repository's current root, or `None` if nothing has ever been
    /// committed (a brand-new repository).
    #[must_use]
    pub fn head(&self) -> Option<RecordId> {
        *self.0.head.lock()
    }

    /// Compare-and-swap the repository's root. Fails with
    /// [`Error::CommitConflict`] if `expected` no longer matches the current
    /// head (another writer committed first).
    pub fn compare_and_set_head(&self, expected: Option<RecordId>, new: RecordId) -> Result<()> {
        let mut guard = self.0.head.lock();
        if *guard != expected {
            return Err(Error::CommitConflict);
        }

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.0.journal.append(new, millis)?;

        *guard = Some(new);
        Ok(())
    }

    /// Roots that GC must keep alive in addition to the current head — in
    /// practice, the repository head plus every retained checkpoint.
    /// `node_store::Checkpoints` keeps this in sync as checkpoints are
    /// created and released.
    #[must_use]
    pub(crate) fn extra_roots(&self) -> Vec<RecordId> {
        self.0.extra_roots.read().clone()
    }

    pub(crate) fn set_extra_roots(&self, roots: Vec<RecordId>) {
        *self.0.extra_roots.write() = roots;
    }

    /// Reads a fully parsed segment, consulting the cache, the in-flight
    /// archive writer and the sealed archive readers in that order.
    pub fn read_segment(&self, id: SegmentId) -> Result<Segment> {
        if let Some(segment) = self.0.cache.get(&id) {
            return Ok(segment);
        }

        {
            let writer = self.0.current_writer.lock();
            if let Some(bytes) = writer.read_buffered(id) {
                let segment = Segment::parse(id, bytes)?;
                self.0.cache.insert(id, segment.clone());
                return Ok(segment);
            }
        }

        let readers = self.0.readers.read();
        for reader in readers.iter().rev() {
            if reader.contains(id) {
                let bytes = reader.read(id)?;
                let segment = Segment::parse(id, bytes)?;
                self.0.cache.insert(id, segment.clone());
                return Ok(segment);
            }
        }

        Err(Error::SegmentNotFound(id))
    }

    /// `true` if `id` resolves somewhere in this store (cache, in-flight
    /// writer or sealed readers), without paying for a full parse.
    #[must_use]
    pub fn contains_segment(&self, id: SegmentId) -> bool {
        if self.0.cache.get(&id).is_some() {
            return true;
        }
        if self.0.current_writer.lock().contains(id) {
            return true;
        }
        self.0.readers.read().iter().any(|r| r.contains(id))
    }

    /// Seals every writer pool buffer into the current archive, sealing and
    /// rotating the archive file itself if it has grown past
    /// `max_file_size`. Called periodically by the background flush worker
    /// and by `NodeStore::merge` after a successful commit.
    pub fn flush(&self) -> Result<()> {
        self.0.writer_pool.flush_all(self)
    }

    /// Reports how much archive space compaction could currently reclaim,
    /// without rewriting anything.
    pub fn estimate(&self) -> Result<crate::gc::estimate::Estimate> {
        crate::gc::estimate::run(self)
    }

    /// Runs one generational GC cycle: estimate, compact (copy reachable
    /// records forward into a new generation), then clean up (reclaim
    /// archive space from generations older than the retained window).
    pub fn compact(&self) -> Result<bool> {
        crate::gc::compact::run(self)
    }

    /// Reclaims archive space for generations older than
    /// `retained_generations`. Ordinarily called automatically after
    /// `compact` succeeds; exposed directly for callers that want to force
    /// a cleanup pass without a fresh compaction.
    pub fn cleanup(&self) -> Result<crate::gc::cleanup::CleanupReport> {
        crate::gc::cleanup::run(self)
    }

    /// Wakes the background compaction worker immediately.
    pub fn trigger_compact(&self) {
        if let Some(background) = self.0.background.lock().as_ref() {
            background.trigger_compact();
        }
    }

    fn probe_disk_space(&self) {
        let available = fs4::available_space(&self.0.dir).ok();
        let total = fs4::total_space(&self.0.dir).ok();
        if let (Some(available), Some(total)) = (available, total) {
            if total > 0 {
                let used_pct = 100u64.saturating_sub(available.saturating_mul(100) / total);
                let threshold = u64::from(self.0.config.gc_options.memory_threshold_pct);
                let low = used_pct + threshold >= 100;
                self.0.low_disk_space.store(low, Ordering::SeqCst);
                if low {
                    log::warn!(
                        "disk space low on {:?}: {used_pct}% used (threshold {threshold}%)",
                        self.0.dir
                    );
                }
            }
        }
    }

    /// Seals the current archive writer (even if under the size threshold),
    /// opens it as a reader, and starts a fresh writer for the next archive
    /// index. Used by both the normal file-size rollover path and by
    /// `close`.
    fn rotate_writer(&self) -> Result<()> {
        let mut writer_guard = self.0.current_writer.lock();
        if writer_guard.is_empty() {
            return Ok(());
        }

        let next_index = self.0.next_archive_index.fetch_add(1, Ordering::SeqCst);
        let fresh = ArchiveWriter::create(self.0.dir.join(archive_file_name(next_index, 0)))?;
        let sealing = std::mem::replace(&mut *writer_guard, fresh);

        let sealed_path = sealing.seal()?;
        let reader = ArchiveReader::open(&sealed_path, self.0.config.memory_mapping)?;
        self.0.readers.write().push(Arc::new(reader));
        file::fsync_directory(&self.0.dir)?;
        Ok(())
    }

    /// Every currently open archive reader, oldest first. Used by GC to scan
    /// the whole repository.
    #[must_use]
    pub(crate) fn readers_snapshot(&self) -> Vec<Arc<ArchiveReader>> {
        self.0.readers.read().clone()
    }

    /// Segments appended to the in-flight (not yet sealed) archive writer,
    /// as `(id, payload_len, generation)`. GC's estimate and cleanup passes
    /// need these alongside the sealed readers' entries since they aren't
    /// visible in any [`ArchiveReader`] until the writer rotates.
    #[must_use]
    pub(crate) fn current_writer_entries(&self) -> Vec<(SegmentId, u64, u32)> {
        self.0.current_writer.lock().entries().collect()
    }

    pub(crate) fn replace_readers(&self, new_readers: Vec<Arc<ArchiveReader>>) {
        let mut guard = self.0.readers.write();
        for old in guard.iter() {
            old.close();
        }
        *guard = new_readers;
    }

    pub(crate) fn cache(&self) -> &crate::cache::SegmentCache {
        &self.0.cache
    }

    /// Flushes outstanding writes, seals the in-flight archive file and
    /// stops the background workers. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.rotate_writer()?;
        if let Some(background) = self.0.background.lock().take() {
            background.stop();
        }
        Ok(())
    }
}

impl SegmentSource for Store {
    fn load(&self, id: SegmentId) -> Result<Segment> {
        self.read_segment(id)
    }
}

impl SegmentSink for Store {
    fn write_segment(&self, id: SegmentId, generation: u32, bytes: &[u8], refs: &[SegmentId]) -> Result<()> {
        {
            let mut writer = self.0.current_writer.lock();
            writer.append_segment(id, generation, bytes, refs)?;
            if writer.should_seal(self.0.config.max_file_size) {
                drop(writer);
                self.rotate_writer()?;
            }
        }

        self.0.tracker.intern_id(id);
        let segment = Segment::parse(id, bytes.to_vec().into())?;
        self.0.cache.insert(id, segment);
        Ok(())
    }
}

/// Renames every `bundle<NNNNN><gen>.tar` file in `dir` to the canonical
/// `data<NNNNN><gen>.tar` name, a one-time upgrade applied the first time a
/// pre-rename repository is opened.
fn upgrade_legacy_archive_names(dir: &std::path::Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_legacy_archive_name(name) {
            if let Some((index, generation)) = parse_archive_file_name(name) {
                let new_path = dir.join(archive_file_name(index, generation));
                std::fs::rename(entry.path(), &new_path)?;
                log::info!("upgraded legacy archive name {name:?} -> {new_path:?}");
            }
        }
    }
    Ok(())
}

/// Walks the journal newest-first, returning the first entry whose record id
/// resolves against at least one of the opened readers. Falls back to the
/// journal's very first (oldest) entry if none resolve — better to start
/// from a possibly-stale root than to silently lose history — and to `None`
/// if the journal itself is empty (a brand-new repository).
fn resolve_head(journal: &Journal, readers: &[Arc<ArchiveReader>]) -> Result<Option<RecordId>> {
    let newest_first = journal.read_newest_first()?;
    for entry in &newest_first {
        if readers.iter().any(|r| r.contains(entry.record_id.segment_id)) {
            return Ok(Some(entry.record_id));
        }
    }
    Ok(newest_first.first().map(|e| e.record_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSize;
    use crate::record::block::write_block;
    use crate::segment::Builder;
    use test_log::test;

    #[test]
    fn open_empty_repo_has_no_head() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(Config::new(dir.path()))?;
        assert!(store.head().is_none());
        store.close()?;
        Ok(())
    }

    #[test]
    fn write_then_read_segment_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(Config::new(dir.path()).cache_size(CacheSize::Bytes(1024 * 1024)))?;

        let mut builder = Builder::new(0);
        write_block(&mut builder, b"hello store");
        let id = crate::id::SegmentId::new_random(crate::id::SegmentKind::Data, crate::id::Version::CURRENT);
        let refs = builder.refs().to_vec();
        let (bytes, _) = builder.seal(id)?;
        store.write_segment(id, 0, &bytes, &refs)?;

        let segment = store.read_segment(id)?;
        assert_eq!(segment.id(), id);
        store.close()?;
        Ok(())
    }

    #[test]
    fn head_cas_rejects_stale_expectation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Store::open(Config::new(dir.path()))?;

        let segment_id = crate::id::SegmentId::new_random(crate::id::SegmentKind::Data, crate::id::Version::CURRENT);
        let a = RecordId::new(segment_id, 0);
        let b = RecordId::new(segment_id, 16);

        store.compare_and_set_head(None, a)?;
        assert_eq!(store.head(), Some(a));

        let result = store.compare_and_set_head(None, b);
        assert!(matches!(result, Err(Error::CommitConflict)));
        store.close()?;
        Ok(())
    }

    #[test]
    fn reopen_recovers_head_from_journal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().to_path_buf();

        let segment_id = crate::id::SegmentId::new_random(crate::id::SegmentKind::Data, crate::id::Version::CURRENT);
        let record_id = RecordId::new(segment_id, 0);

        {
            let store = Store::open(Config::new(&path))?;
            let mut builder = Builder::new(0);
            write_block(&mut builder, b"root payload");
            let refs = builder.refs().to_vec();
            let (bytes, _) = builder.seal(segment_id)?;
            store.write_segment(segment_id, 0, &bytes, &refs)?;
            store.compare_and_set_head(None, record_id)?;
            store.close()?;
        }

        let reopened = Store::open(Config::new(&path))?;
        assert_eq!(reopened.head(), Some(record_id));
        reopened.close()?;
        Ok(())
    }

    #[test]
    fn legacy_bundle_names_upgraded_on_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let legacy_path = dir.path().join("bundle00000a.tar");
        {
            let mut writer = ArchiveWriter::create(&legacy_path)?;
            let segment_id = crate::id::SegmentId::new_random(crate::id::SegmentKind::Data, crate::id::Version::CURRENT);
            writer.append_segment(segment_id, 0, b"legacy bytes", &[])?;
            writer.seal()?;
        }

        let store = Store::open(Config::new(dir.path()))?;
        assert!(!legacy_path.exists());
        assert!(dir.path().join("data00000a.tar").exists());
        store.close()?;
        Ok(())
    }
}
