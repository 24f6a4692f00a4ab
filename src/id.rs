//! Segment and record identifiers.
//!
//! A [`SegmentId`] is a 128-bit value split into two 64-bit halves, modeled
//! directly on `java.util.UUID`'s `(mostSigBits, leastSigBits)` layout so
//! that the textual form is a familiar UUID. The top nibble of the low half
//! carries the segment [`SegmentKind`]; the top nibble of the high half
//! carries the wire [`Version`] of the segment format.

use crate::error::{Error, Result};
use std::fmt;
use uuid::Uuid;

/// What a segment's payload holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SegmentKind {
    /// Holds records: nodes, properties, maps, lists, strings, templates.
    Data,
    /// Holds only opaque binary payload; carries no reference list.
    Bulk,
}

impl SegmentKind {
    fn nibble(self) -> u8 {
        match self {
            Self::Data => 0xA,
            Self::Bulk => 0xB,
        }
    }

    fn from_nibble(nibble: u8) -> Result<Self> {
        match nibble {
            0xA => Ok(Self::Data),
            0xB => Ok(Self::Bulk),
            other => Err(Error::Corruption(format!(
                "unrecognized segment kind nibble: {other:#x}"
            ))),
        }
    }
}

/// Segment wire format version, carried in every segment's high half.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Version(pub u8);

impl Version {
    pub const CURRENT: Self = Self(1);

    fn from_nibble(nibble: u8) -> Self {
        Self(nibble)
    }
}

/// 128-bit identifier of a segment.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SegmentId {
    msb: u64,
    lsb: u64,
}

impl SegmentId {
    /// Creates a fresh random segment id of the given kind and version.
    #[must_use]
    pub fn new_random(kind: SegmentKind, version: Version) -> Self {
        let raw = Uuid::new_v4();
        let (mut msb, mut lsb) = raw.as_u64_pair();

        // Stamp version into the top nibble of the high half.
        msb = (msb & 0x0FFF_FFFF_FFFF_FFFF) | (u64::from(version.0 & 0xF) << 60);
        // Stamp kind into the top nibble of the low half.
        lsb = (lsb & 0x0FFF_FFFF_FFFF_FFFF) | (u64::from(kind.nibble()) << 60);

        Self { msb, lsb }
    }

    #[must_use]
    pub fn from_raw_parts(msb: u64, lsb: u64) -> Self {
        Self { msb, lsb }
    }

    #[must_use]
    pub fn msb(&self) -> u64 {
        self.msb
    }

    #[must_use]
    pub fn lsb(&self) -> u64 {
        self.lsb
    }

    #[must_use]
    pub fn kind(&self) -> SegmentKind {
        let nibble = ((self.lsb >> 60) & 0xF) as u8;
        SegmentKind::from_nibble(nibble).unwrap_or(SegmentKind::Data)
    }

    #[must_use]
    pub fn version(&self) -> Version {
        Version::from_nibble(((self.msb >> 60) & 0xF) as u8)
    }

    #[must_use]
    pub fn is_data(&self) -> bool {
        matches!(self.kind(), SegmentKind::Data)
    }

    #[must_use]
    pub fn is_bulk(&self) -> bool {
        matches!(self.kind(), SegmentKind::Bulk)
    }

    /// Archive entry name: `<uuid-canonical>.<generation-number>`.
    #[must_use]
    pub fn archive_entry_name(&self, generation: u32) -> String {
        format!("{self}.{generation}")
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuid = Uuid::from_u64_pair(self.msb, self.lsb);
        write!(f, "{uuid}")
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({self})")
    }
}

impl std::str::FromStr for SegmentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| Error::Corruption(format!("invalid segment uuid {s:?}: {e}")))?;
        let (msb, lsb) = uuid.as_u64_pair();
        Ok(Self { msb, lsb })
    }
}

/// Record alignment, in bytes. All record offsets are multiples of this.
pub const ALIGN: u32 = 16;

/// Address of a single record: the segment it lives in, plus a
/// 16-byte-aligned byte offset into that segment's record area.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct RecordId {
    pub segment_id: SegmentId,
    pub offset: u32,
}

impl RecordId {
    #[must_use]
    pub fn new(segment_id: SegmentId, offset: u32) -> Self {
        debug_assert_eq!(offset % ALIGN, 0, "record offset must be ALIGN-aligned");
        Self { segment_id, offset }
    }

    /// Canonical textual form: `<uuid>.<offset-hex4>`.
    #[must_use]
    pub fn to_canonical_string(&self) -> String {
        format!("{}.{:04x}", self.segment_id, self.offset)
    }

    /// Legacy textual form: `<uuid>:<decimal-offset>`.
    #[must_use]
    pub fn to_legacy_string(&self) -> String {
        format!("{}:{}", self.segment_id, self.offset)
    }

    /// Parses either the canonical (`.`-separated hex) or legacy
    /// (`:`-separated decimal) textual form.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some((uuid_part, offset_part)) = s.split_once('.') {
            let segment_id: SegmentId = uuid_part.parse()?;
            let offset = u32::from_str_radix(offset_part, 16)
                .map_err(|e| Error::Corruption(format!("bad hex offset in {s:?}: {e}")))?;
            return Ok(Self::new(segment_id, offset));
        }

        if let Some((uuid_part, offset_part)) = s.split_once(':') {
            let segment_id: SegmentId = uuid_part.parse()?;
            let offset: u32 = offset_part
                .parse()
                .map_err(|e| Error::Corruption(format!("bad decimal offset in {s:?}: {e}")))?;
            return Ok(Self::new(segment_id, offset));
        }

        Err(Error::Corruption(format!("unparseable record id: {s:?}")))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_canonical_string())
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({self})")
    }
}
