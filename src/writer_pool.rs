//! Writer pool: one buffered segment writer per `(purpose, generation,
//! caller)` tuple. Writing is serialized per writer but parallel across
//! writers.

use crate::error::Result;
use crate::id::{SegmentId, SegmentKind, Version};
use crate::record::RecordType;
use crate::segment::{Builder, MAX_SEGMENT_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Sink a sealed segment is handed off to once a buffered writer fills up.
/// Implemented by [`crate::store::Store`]; kept as a trait so the writer
/// pool itself never needs to know about archives, journals, or locks.
pub trait SegmentSink: Send + Sync {
    fn write_segment(&self, id: SegmentId, generation: u32, bytes: &[u8], refs: &[SegmentId]) -> Result<()>;
}

#[derive(Clone, Eq, PartialEq, Hash)]
struct WriterKey {
    purpose: String,
    generation: u32,
    caller: u64,
}

/// A single buffered segment under construction. Exclusively owned by
/// whichever thread currently holds the pool's per-key lock.
pub struct BufferedWriter {
    generation: u32,
    current_id: SegmentId,
    builder: Builder,
}

impl BufferedWriter {
    fn new(generation: u32) -> Self {
        Self {
            generation,
            current_id: SegmentId::new_random(SegmentKind::Data, Version::CURRENT),
            builder: Builder::new(generation),
        }
    }

    /// The segment id in-flight records should use for same-segment
    /// references (passed as `current_segment` to the record codec).
    #[must_use]
    pub fn current_segment(&self) -> SegmentId {
        self.current_id
    }

    #[must_use]
    pub fn builder_mut(&mut self) -> &mut Builder {
        &mut self.builder
    }

    pub fn add_root(&mut self, record_type: RecordType, offset: u32) {
        self.builder.add_root(record_type, offset);
    }

    /// Seals the current buffer (if non-empty) via `sink`, then starts a
    /// fresh buffer under a newly allocated segment id.
    pub fn seal_into(&mut self, sink: &dyn SegmentSink) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }

        let sealed_id = self.current_id;
        let old_builder = std::mem::replace(&mut self.builder, Builder::new(self.generation));
        let ref_snapshot = old_builder.refs().to_vec();
        let (bytes, _header_len) = old_builder.seal(sealed_id)?;

        sink.write_segment(sealed_id, self.generation, &bytes, &ref_snapshot)?;

        self.current_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        Ok(())
    }

    /// Seals the buffer into `sink` if it has grown past
    /// [`MAX_SEGMENT_SIZE`]. Call this after every record append.
    pub fn seal_if_full(&mut self, sink: &dyn SegmentSink) -> Result<()> {
        if self.builder.estimated_size() >= MAX_SEGMENT_SIZE {
            self.seal_into(sink)?;
        }
        Ok(())
    }
}

/// Hands out [`BufferedWriter`]s keyed by `(purpose, generation,
/// caller-key)`, so different logical writers (the system writer, the
/// initial-content writer, the compactor's writer) never contend with one
/// another while each remains single-threaded internally.
pub struct WriterPool {
    writers: Mutex<HashMap<WriterKey, Arc<Mutex<BufferedWriter>>>>,
}

impl Default for WriterPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `f` against the buffered writer for `(purpose, generation,
    /// caller)`, creating it on first use. Callers must never hand the
    /// same `(purpose, generation, caller)` key to two threads at once;
    /// the pool itself only guards the map of writers, not the writer's
    /// contents while `f` runs re-entrantly from another key.
    pub fn with_writer<T>(
        &self,
        purpose: &str,
        generation: u32,
        caller: u64,
        f: impl FnOnce(&mut BufferedWriter) -> Result<T>,
    ) -> Result<T> {
        let key = WriterKey {
            purpose: purpose.to_string(),
            generation,
            caller,
        };

        let entry = {
            let mut writers = self.writers.lock();
            writers
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(BufferedWriter::new(generation))))
                .clone()
        };

        let mut guard = entry.lock();
        f(&mut guard)
    }

    /// Seals every outstanding buffer across every writer in the pool.
    /// Called by `Store::flush`.
    pub fn flush_all(&self, sink: &dyn SegmentSink) -> Result<()> {
        let writers: Vec<Arc<Mutex<BufferedWriter>>> = self.writers.lock().values().cloned().collect();
        for writer in writers {
            writer.lock().seal_into(sink)?;
        }
        Ok(())
    }

    /// Drops every writer bound to `generation`, e.g. after a compaction
    /// cycle's writer is no longer needed.
    pub fn retire_generation(&self, generation: u32) {
        self.writers.lock().retain(|key, _| key.generation != generation);
    }
}
