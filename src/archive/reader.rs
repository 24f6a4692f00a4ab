//! Archive reader: opens a sealed (or, during recovery, still-unsealed)
//! archive file and answers `contains`/`read`/`graph`/`blob_refs` queries.

use super::entry::{decode_trailer_via_pointer, EntryHeader, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::file::{FOOTER_BLOB_REFS, FOOTER_GRAPH, FOOTER_INDEX};
use crate::id::SegmentId;
use byteorder::{BigEndian, ReadBytesExt};
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

struct IndexEntry {
    offset: u64,
    len: u64,
    generation: u32,
}

enum Backing {
    Mapped(Mmap),
    Plain(Mutex<File>),
}

/// A reader over one sealed archive file.
///
/// May be [`close`](Self::close)d by the store during a GC swap; once
/// closed, every query returns [`Error::Corruption`]-free but empty/false
/// results so the store can detect the condition and retry against a
/// refreshed reader list.
pub struct ArchiveReader {
    path: PathBuf,
    backing: Backing,
    index: HashMap<SegmentId, IndexEntry>,
    graph: HashMap<SegmentId, Vec<SegmentId>>,
    blob_refs: HashSet<String>,
    closed: AtomicBool,
    /// `true` if this file lacked a trailer and was opened via the
    /// best-effort backward-scan recovery path (its footers, if any, are
    /// not trusted).
    recovered: bool,
}

impl ArchiveReader {
    pub fn open<P: AsRef<Path>>(path: P, memory_mapping: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();

        let backing = if memory_mapping {
            // Safety: the archive file is immutable once sealed; the only
            // writer for an unsealed (still being appended) file is this
            // same process's archive writer, which appends strictly past
            // any region ever mapped here.
            let mmap = unsafe { MmapOptions::new().map(&file)? };
            Backing::Mapped(mmap)
        } else {
            Backing::Plain(Mutex::new(file.try_clone()?))
        };

        let footers = if len >= BLOCK_SIZE {
            let mut trailer_buf = vec![0u8; BLOCK_SIZE as usize];
            file.seek(SeekFrom::Start(len - BLOCK_SIZE))?;
            file.read_exact(&mut trailer_buf)?;
            decode_trailer_via_pointer(&trailer_buf)?
        } else {
            None
        };

        if let Some(pointers) = footers {
            let read_at = |offset: u64, expect_len: u64| -> Result<Vec<u8>> {
                let mut f = file.try_clone()?;
                f.seek(SeekFrom::Start(offset))?;
                let header = EntryHeader::decode(&mut f)?;
                if header.payload_len != expect_len {
                    return Err(Error::Corruption(format!(
                        "footer at {offset} has mismatched length"
                    )));
                }
                let mut payload = vec![0u8; expect_len as usize];
                f.read_exact(&mut payload)?;
                Ok(payload)
            };

            let graph_bytes = read_at(pointers[0].0, pointers[0].1)?;
            let blob_refs_bytes = read_at(pointers[1].0, pointers[1].1)?;
            let index_bytes = read_at(pointers[2].0, pointers[2].1)?;

            let graph = decode_graph(&graph_bytes)?;
            let blob_refs = decode_blob_refs(&blob_refs_bytes)?;
            let index = decode_index(&index_bytes)?;

            log::debug!("opened archive {path:?} via trailer ({} segments)", index.len());

            Ok(Self {
                path,
                backing,
                index,
                graph,
                blob_refs,
                closed: AtomicBool::new(false),
                recovered: false,
            })
        } else {
            log::debug!("archive {path:?} has no trailer, attempting recovery scan");
            let index = recover_by_scan(&mut file, len)?;
            Ok(Self {
                path,
                backing,
                index,
                graph: HashMap::new(),
                blob_refs: HashSet::new(),
                closed: AtomicBool::new(false),
                recovered: true,
            })
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn recovered(&self) -> bool {
        self.recovered
    }

    #[must_use]
    pub fn contains(&self, id: SegmentId) -> bool {
        !self.is_closed() && self.index.contains_key(&id)
    }

    #[must_use]
    pub fn generation_of(&self, id: SegmentId) -> Option<u32> {
        self.index.get(&id).map(|e| e.generation)
    }

    /// Size in bytes of the segment payload stored under `id`, not counting
    /// its entry header or padding. Used by the GC estimator and cleanup's
    /// rewrite-threshold check.
    #[must_use]
    pub fn size_of(&self, id: SegmentId) -> Option<u64> {
        self.index.get(&id).map(|e| e.len)
    }

    pub fn read(&self, id: SegmentId) -> Result<std::sync::Arc<[u8]>> {
        if self.is_closed() {
            return Err(Error::SegmentNotFound(id));
        }
        let entry = self
            .index
            .get(&id)
            .ok_or(Error::SegmentNotFound(id))?;

        let header_len = BLOCK_SIZE;
        let start = entry.offset + header_len;
        let end = start + entry.len;

        let bytes = match &self.backing {
            Backing::Mapped(mmap) => mmap
                .get(start as usize..end as usize)
                .ok_or_else(|| Error::Corruption(format!("segment {id} out of file bounds")))?
                .to_vec(),
            Backing::Plain(file) => {
                let mut file = file.lock();
                file.seek(SeekFrom::Start(start))?;
                let mut buf = vec![0u8; entry.len as usize];
                file.read_exact(&mut buf)?;
                buf
            }
        };

        Ok(bytes.into())
    }

    #[must_use]
    pub fn graph(&self) -> &HashMap<SegmentId, Vec<SegmentId>> {
        &self.graph
    }

    #[must_use]
    pub fn blob_refs(&self) -> &HashSet<String> {
        &self.blob_refs
    }

    pub fn ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.index.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Marks this reader as closed; subsequent queries behave as if the
    /// file were absent so the store can retry against a refreshed list.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn decode_graph(buf: &[u8]) -> Result<HashMap<SegmentId, Vec<SegmentId>>> {
    let mut cursor = buf;
    let count = cursor.read_u32::<BigEndian>().unwrap_or(0);
    let mut out = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let msb = cursor.read_u64::<BigEndian>()?;
        let lsb = cursor.read_u64::<BigEndian>()?;
        let id = SegmentId::from_raw_parts(msb, lsb);
        let ref_count = cursor.read_u32::<BigEndian>()?;
        let mut refs = Vec::with_capacity(ref_count as usize);
        for _ in 0..ref_count {
            let rmsb = cursor.read_u64::<BigEndian>()?;
            let rlsb = cursor.read_u64::<BigEndian>()?;
            refs.push(SegmentId::from_raw_parts(rmsb, rlsb));
        }
        out.insert(id, refs);
    }
    Ok(out)
}

fn decode_blob_refs(buf: &[u8]) -> Result<HashSet<String>> {
    let mut cursor = buf;
    let count = cursor.read_u32::<BigEndian>().unwrap_or(0);
    let mut out = HashSet::with_capacity(count as usize);
    for _ in 0..count {
        let len = cursor.read_u32::<BigEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes)?;
        let s = String::from_utf8(bytes)
            .map_err(|e| Error::Corruption(format!("blob ref not utf-8: {e}")))?;
        out.insert(s);
    }
    Ok(out)
}

fn decode_index(buf: &[u8]) -> Result<HashMap<SegmentId, IndexEntry>> {
    let mut cursor = buf;
    let count = cursor.read_u32::<BigEndian>().unwrap_or(0);
    let mut out = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let msb = cursor.read_u64::<BigEndian>()?;
        let lsb = cursor.read_u64::<BigEndian>()?;
        let offset = cursor.read_u64::<BigEndian>()?;
        let len = cursor.read_u64::<BigEndian>()?;
        let generation = cursor.read_u32::<BigEndian>()?;
        out.insert(
            SegmentId::from_raw_parts(msb, lsb),
            IndexEntry {
                offset,
                len,
                generation,
            },
        );
    }
    Ok(out)
}

/// Best-effort recovery for a file with no trailer: scans entries from the
/// start, stopping at the first truncated/unparseable header or payload. A
/// partial tail entry at the very end of the most recently written
/// (unsealed) archive file is expected, not an error.
fn recover_by_scan(file: &mut File, len: u64) -> Result<HashMap<SegmentId, IndexEntry>> {
    file.seek(SeekFrom::Start(0))?;
    let mut index = HashMap::new();
    let mut offset = 0u64;

    while offset + BLOCK_SIZE <= len {
        let header = match EntryHeader::decode(file) {
            Ok(h) => h,
            Err(_) => break,
        };

        if header.name == FOOTER_GRAPH || header.name == FOOTER_BLOB_REFS || header.name == FOOTER_INDEX {
            // A footer entry with no matching trailer means sealing was
            // interrupted; it carries no reliable information, stop here.
            break;
        }

        let Ok(id) = header.name.split('.').next().unwrap_or_default().parse::<SegmentId>() else {
            break;
        };

        let total = BLOCK_SIZE + header.payload_len;
        let padded = super::entry::padded_len(total);
        if offset + padded > len {
            log::debug!("recovery stopped at partial tail entry for {id}");
            break;
        }

        let generation = header.generation;
        file.seek(SeekFrom::Current(header.payload_len as i64))?;
        // consume alignment padding between payload end and next header
        let consumed_payload_block = super::entry::padded_len(BLOCK_SIZE + header.payload_len) - BLOCK_SIZE;
        let pad_after_payload = consumed_payload_block - header.payload_len;
        if pad_after_payload > 0 {
            file.seek(SeekFrom::Current(pad_after_payload as i64))?;
        }

        index.insert(
            id,
            IndexEntry {
                offset,
                len: header.payload_len,
                generation,
            },
        );
        offset += padded;
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::writer::ArchiveWriter;
    use crate::id::{SegmentKind, Version};
    use test_log::test;

    #[test]
    fn write_then_read_back() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data00000a.tar");
        let mut writer = ArchiveWriter::create(&path)?;
        let id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        writer.append_segment(id, 2, b"hello segment", &[])?;
        writer.seal()?;

        let reader = ArchiveReader::open(&path, true)?;
        assert!(reader.contains(id));
        assert_eq!(reader.generation_of(id), Some(2));
        assert_eq!(&*reader.read(id)?, b"hello segment");
        assert!(!reader.recovered());
        Ok(())
    }

    #[test]
    fn unmapped_read_matches_mapped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data00000a.tar");
        let mut writer = ArchiveWriter::create(&path)?;
        let id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        writer.append_segment(id, 0, b"plain read", &[])?;
        writer.seal()?;

        let reader = ArchiveReader::open(&path, false)?;
        assert_eq!(&*reader.read(id)?, b"plain read");
        Ok(())
    }

    #[test]
    fn closed_reader_reports_absent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data00000a.tar");
        let mut writer = ArchiveWriter::create(&path)?;
        let id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        writer.append_segment(id, 0, b"x", &[])?;
        writer.seal()?;

        let reader = ArchiveReader::open(&path, true)?;
        reader.close();
        assert!(!reader.contains(id));
        assert!(reader.read(id).is_err());
        Ok(())
    }

    #[test]
    fn recovers_unsealed_file_with_partial_tail() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("data00000a.tar");
        let mut writer = ArchiveWriter::create(&path)?;
        let id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        writer.append_segment(id, 0, b"complete entry", &[])?;
        // Leave the writer unsealed (no trailer) and append a truncated
        // header to simulate a crash mid-write.
        drop(writer);

        {
            use std::io::Write as _;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path)?;
            f.write_all(&[0u8; 10])?; // shorter than one header block
        }

        let reader = ArchiveReader::open(&path, true)?;
        assert!(reader.recovered());
        assert!(reader.contains(id));
        assert_eq!(&*reader.read(id)?, b"complete entry");
        Ok(())
    }
}
