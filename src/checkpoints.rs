//! Checkpoints: named, time-retained references to a past root.
//!
//! The checkpoint table is itself an ordinary `MAP` record (see
//! [`crate::record::map`]), keyed by checkpoint uuid and valued by a small
//! bespoke "checkpoint entry" record holding a [`RecordRef`] to the
//! checkpointed root plus its expiry. Its root is tracked in its own journal
//! file (`checkpoints.log`, not `journal.log`) so checkpoint bookkeeping
//! never perturbs head recovery, and is registered with
//! [`Store::set_extra_roots`] so GC keeps every live checkpoint's target
//! reachable even after the head itself has moved past it.

use crate::error::Result;
use crate::file::CHECKPOINTS_JOURNAL_FILE;
use crate::id::{RecordId, SegmentId, SegmentKind, Version};
use crate::journal::Journal;
use crate::record::map::{map_iter, write_map};
use crate::record::{make_ref, resolve, RecordRef};
use crate::segment::{Builder, Segment};
use crate::store::Store;
use crate::writer_pool::SegmentSink;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifies one retained checkpoint.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    #[must_use]
    fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CheckpointId({})", self.0)
    }
}

impl std::str::FromStr for CheckpointId {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::error::Error::Decode(format!("invalid checkpoint id {s:?}: {e}")))
    }
}

/// The checkpoint table: `CheckpointId -> (target RecordId, expiry)`.
pub struct Checkpoints {
    store: Store,
    journal: Journal,
    root: Mutex<Option<RecordId>>,
}

impl Checkpoints {
    pub(crate) fn open(store: Store) -> Result<Self> {
        let journal = Journal::named(store.path(), CHECKPOINTS_JOURNAL_FILE);
        let root = journal
            .read_newest_first()?
            .into_iter()
            .find(|e| store.contains_segment(e.record_id.segment_id))
            .map(|e| e.record_id);

        let checkpoints = Self {
            store,
            journal,
            root: Mutex::new(root),
        };
        checkpoints.sync_extra_roots();
        Ok(checkpoints)
    }

    /// Retains `target` under a fresh checkpoint id for at least `lifetime`.
    pub fn create(&self, target: RecordId, lifetime: Duration) -> Result<CheckpointId> {
        let id = CheckpointId::new_random();
        let expires_at_millis = now_millis().saturating_add(millis_of(lifetime));

        self.rebuild(|builder, segment_id, entries| {
            let entry_offset = write_entry(builder, segment_id, target, expires_at_millis)?;
            entries.push((id.0.as_bytes().to_vec(), RecordId::new(segment_id, entry_offset)));
            Ok(())
        })?;

        Ok(id)
    }

    /// Resolves `id` to its retained target, or `None` if absent or expired.
    pub fn get(&self, id: CheckpointId) -> Result<Option<RecordId>> {
        let Some(root) = *self.root.lock() else {
            return Ok(None);
        };
        let segment = self.store.read_segment(root.segment_id)?;
        let entries = map_iter(&self.store, &segment, root.offset)?;
        let Some((_, entry_id)) = entries.into_iter().find(|(k, _)| k.as_slice() == id.0.as_bytes().as_slice()) else {
            return Ok(None);
        };

        let entry_segment = self.store.read_segment(entry_id.segment_id)?;
        let (target, expires_at_millis) = read_entry(&entry_segment, entry_id.offset)?;
        if expires_at_millis < now_millis() {
            return Ok(None);
        }
        Ok(Some(target))
    }

    /// Every checkpoint id currently retained, expired or not.
    pub fn ids(&self) -> Result<Vec<CheckpointId>> {
        let Some(root) = *self.root.lock() else {
            return Ok(Vec::new());
        };
        let segment = self.store.read_segment(root.segment_id)?;
        let entries = map_iter(&self.store, &segment, root.offset)?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| Uuid::from_slice(&key).ok().map(CheckpointId))
            .collect())
    }

    /// Removes `id`, if present. Returns `true` if it was there to remove.
    pub fn release(&self, id: CheckpointId) -> Result<bool> {
        let mut removed = false;
        self.rebuild(|_, _, entries| {
            let before = entries.len();
            entries.retain(|(k, _)| k.as_slice() != id.0.as_bytes().as_slice());
            removed = entries.len() != before;
            Ok(())
        })?;
        Ok(removed)
    }

    /// Drops every expired checkpoint from the table. Returns how many were
    /// removed.
    ///
    /// Not run by any background worker: checkpoint expiry is a node-store
    /// concern layered on top of [`Store`], not one of its background
    /// tasks, so callers that rely on checkpoints actually expiring should
    /// invoke this themselves on whatever cadence suits them.
    pub fn sweep_expired(&self) -> Result<usize> {
        let Some(root) = *self.root.lock() else {
            return Ok(0);
        };
        let segment = self.store.read_segment(root.segment_id)?;
        let entries = map_iter(&self.store, &segment, root.offset)?;

        let now = now_millis();
        let mut expired_keys = Vec::new();
        for (key, entry_id) in &entries {
            let entry_segment = self.store.read_segment(entry_id.segment_id)?;
            let (_, expires_at_millis) = read_entry(&entry_segment, entry_id.offset)?;
            if expires_at_millis < now {
                expired_keys.push(key.clone());
            }
        }

        if expired_keys.is_empty() {
            return Ok(0);
        }

        let removed = expired_keys.len();
        self.rebuild(|_, _, entries| {
            entries.retain(|(k, _)| !expired_keys.contains(k));
            Ok(())
        })?;
        Ok(removed)
    }

    /// Rebuilds the checkpoint map from scratch: materializes its current
    /// live entries, hands them to `edit` (which may append/modify/remove
    /// entries, writing any new entry records through the builder it's
    /// given), then writes a fresh map segment and commits it as the new
    /// root.
    ///
    /// Always rebuilds the full map rather than diffing against the
    /// previous one: the checkpoint table is small and changes rarely
    /// enough that a `Diff` layer (as the node child map uses) would save
    /// nothing worth the extra bookkeeping, and a full rebuild means
    /// `sweep_expired` touches every live entry anyway to check its
    /// expiry.
    fn rebuild(
        &self,
        edit: impl FnOnce(&mut Builder, SegmentId, &mut Vec<(Vec<u8>, RecordId)>) -> Result<()>,
    ) -> Result<()> {
        let current_root = *self.root.lock();
        let generation = self.store.current_generation();
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(generation);

        let mut entries: Vec<(Vec<u8>, RecordId)> = match current_root {
            Some(root) => {
                let segment = self.store.read_segment(root.segment_id)?;
                map_iter(&self.store, &segment, root.offset)?
            }
            None => Vec::new(),
        };

        edit(&mut builder, segment_id, &mut entries)?;

        let map_offset = write_map(&mut builder, segment_id, entries)?;
        let refs = builder.refs().to_vec();
        let (bytes, _) = builder.seal(segment_id)?;
        self.store.write_segment(segment_id, generation, &bytes, &refs)?;

        let new_root = RecordId::new(segment_id, map_offset);
        self.journal.append(new_root, now_millis())?;
        *self.root.lock() = Some(new_root);
        self.sync_extra_roots();
        Ok(())
    }

    fn sync_extra_roots(&self) {
        let roots: Vec<RecordId> = (*self.root.lock()).into_iter().collect();
        self.store.set_extra_roots(roots);
    }
}

fn write_entry(builder: &mut Builder, current_segment: SegmentId, target: RecordId, expires_at_millis: u64) -> Result<u32> {
    let mut buf = Vec::new();
    let target_ref = make_ref(builder, current_segment, target)?;
    target_ref.encode(&mut buf)?;
    buf.write_u64::<BigEndian>(expires_at_millis)?;
    Ok(builder.write_record(&buf))
}

fn read_entry(segment: &Segment, offset: u32) -> Result<(RecordId, u64)> {
    let cursor = segment.cursor();
    let (target_ref, next) = RecordRef::decode(&cursor, offset)?;
    let target = resolve(segment, target_ref)?;
    let expires_at_millis = cursor.read_long(next)?;
    Ok((target, expires_at_millis))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn millis_of(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
