//! Block-aligned entry framing shared by the archive writer and reader.
//!
//! Every archive entry (a segment, or one of the three footer records) is a
//! fixed-size header block followed by its payload, padded up to the next
//! [`BLOCK_SIZE`] boundary.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Every entry (header + payload) is padded to a multiple of this size.
pub const BLOCK_SIZE: u64 = 512;

/// Bytes reserved for an entry's name within its header block.
const NAME_BYTES: usize = 100;

/// `true` entry name length, so long uuid-based names fit comfortably
/// (`"<uuid>.<generation>"` is at most 36 + 1 + 10 = 47 bytes).
const _: () = assert!(NAME_BYTES >= 47);

/// One archive entry's header: name, payload length, GC generation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryHeader {
    pub name: String,
    pub payload_len: u64,
    pub generation: u32,
}

impl EntryHeader {
    pub fn encode<W: Write>(&self, out: &mut W) -> Result<()> {
        let name_bytes = self.name.as_bytes();
        if name_bytes.len() > NAME_BYTES {
            return Err(Error::Encode(format!(
                "archive entry name {:?} exceeds {NAME_BYTES} bytes",
                self.name
            )));
        }
        let mut name_field = [0u8; NAME_BYTES];
        name_field[..name_bytes.len()].copy_from_slice(name_bytes);
        out.write_all(&name_field)?;
        out.write_u64::<BigEndian>(self.payload_len)?;
        out.write_u32::<BigEndian>(self.generation)?;

        let written = NAME_BYTES + 8 + 4;
        let padding = padded_len(written as u64) - written as u64;
        out.write_all(&vec![0u8; padding as usize])?;
        Ok(())
    }

    pub fn decode<R: Read>(input: &mut R) -> Result<Self> {
        let mut name_field = [0u8; NAME_BYTES];
        input
            .read_exact(&mut name_field)
            .map_err(|_| Error::Corruption("truncated archive entry header".into()))?;
        let name_len = name_field.iter().position(|b| *b == 0).unwrap_or(NAME_BYTES);
        let name = String::from_utf8(name_field[..name_len].to_vec())
            .map_err(|e| Error::Corruption(format!("archive entry name not utf-8: {e}")))?;

        let payload_len = input
            .read_u64::<BigEndian>()
            .map_err(|_| Error::Corruption("truncated archive entry header".into()))?;
        let generation = input
            .read_u32::<BigEndian>()
            .map_err(|_| Error::Corruption("truncated archive entry header".into()))?;

        let written = NAME_BYTES + 8 + 4;
        let padding = padded_len(written as u64) - written as u64;
        let mut pad_buf = vec![0u8; padding as usize];
        input
            .read_exact(&mut pad_buf)
            .map_err(|_| Error::Corruption("truncated archive entry header".into()))?;

        Ok(Self {
            name,
            payload_len,
            generation,
        })
    }
}

/// Rounds `len` up to the next [`BLOCK_SIZE`] boundary.
#[must_use]
pub fn padded_len(len: u64) -> u64 {
    (len + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

/// Magic stamped at the front of the trailer block written by
/// [`super::writer::ArchiveWriter::seal`].
pub const TRAILER_MAGIC: [u8; 4] = *b"NSTR";

/// Parses a trailer block, returning the three `(offset, len)` footer
/// pointers in `(graph, blob_refs, index)` order, or `None` if `buf` does
/// not carry a valid trailer (too short, or bad magic — an unsealed file).
pub fn decode_trailer_via_pointer(buf: &[u8]) -> Result<Option<[(u64, u64); 3]>> {
    if (buf.len() as u64) < BLOCK_SIZE {
        return Ok(None);
    }
    let mut cursor = buf;
    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| Error::Corruption("truncated archive trailer".into()))?;
    if magic != TRAILER_MAGIC {
        return Ok(None);
    }
    let mut out = [(0u64, 0u64); 3];
    for slot in &mut out {
        let offset = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| Error::Corruption("truncated archive trailer".into()))?;
        let len = cursor
            .read_u64::<BigEndian>()
            .map_err(|_| Error::Corruption("truncated archive trailer".into()))?;
        *slot = (offset, len);
    }
    Ok(Some(out))
}
