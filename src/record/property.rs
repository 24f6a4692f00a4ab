//! `PROPERTY` record: a single value, or a list of values, tagged with a
//! [`PropertyType`]. Numeric types preserve their exact bit pattern by
//! storing the value's big-endian byte representation as a `VALUE` record.

use crate::error::{Error, Result};
use crate::id::{RecordId, SegmentId};
use crate::record::list::{list_to_vec, write_list};
use crate::record::value::{is_external, read_external, read_inline, write_external, write_inline};
use crate::record::{make_ref, resolve, RecordRef};
use crate::segment::{Builder, Segment, SegmentSource};
use byteorder::WriteBytesExt;

/// JCR-style property type tags. Numeric/date/boolean values are encoded as
/// their raw big-endian bytes inside a `VALUE` record so that
/// `read(write(x)) == x` holds bit-for-bit.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum PropertyType {
    String = 0,
    Binary = 1,
    Long = 2,
    Double = 3,
    Date = 4,
    Boolean = 5,
    Name = 6,
    Path = 7,
    Reference = 8,
    WeakReference = 9,
    Uri = 10,
    Decimal = 11,
}

impl PropertyType {
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::String,
            1 => Self::Binary,
            2 => Self::Long,
            3 => Self::Double,
            4 => Self::Date,
            5 => Self::Boolean,
            6 => Self::Name,
            7 => Self::Path,
            8 => Self::Reference,
            9 => Self::WeakReference,
            10 => Self::Uri,
            11 => Self::Decimal,
            other => return Err(Error::Decode(format!("unknown property type tag {other}"))),
        })
    }
}

const MULTI_FLAG: u8 = 0x80;

/// A decoded property: its type, and either one value or a list of values,
/// each as raw bytes (callers interpret according to `property_type`).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PropertyValues {
    Single(Vec<u8>),
    Multi(Vec<Vec<u8>>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Property {
    pub property_type: PropertyType,
    pub values: PropertyValues,
}

/// Writes a single-valued property.
pub fn write_single(
    builder: &mut Builder,
    current_segment: SegmentId,
    property_type: PropertyType,
    bytes: &[u8],
) -> Result<u32> {
    let value_offset = write_inline(builder, current_segment, bytes)?;

    let mut buf = Vec::new();
    buf.write_u8(property_type as u8)?;
    let r = make_ref(
        builder,
        current_segment,
        RecordId::new(current_segment, value_offset),
    )?;
    r.encode(&mut buf)?;
    Ok(builder.write_record(&buf))
}

/// Writes a multi-valued property.
pub fn write_multi(
    builder: &mut Builder,
    current_segment: SegmentId,
    property_type: PropertyType,
    values: &[Vec<u8>],
) -> Result<u32> {
    let mut value_ids = Vec::with_capacity(values.len());
    for v in values {
        let offset = write_inline(builder, current_segment, v)?;
        value_ids.push(RecordId::new(current_segment, offset));
    }
    let list_offset = write_list(builder, current_segment, &value_ids)?;

    let mut buf = Vec::new();
    buf.write_u8((property_type as u8) | MULTI_FLAG)?;
    let r = make_ref(
        builder,
        current_segment,
        RecordId::new(current_segment, list_offset),
    )?;
    r.encode(&mut buf)?;
    Ok(builder.write_record(&buf))
}

/// Writes a single-valued property whose value is an external blob
/// reference (see [`crate::record::value::write_external`]) rather than an
/// inline payload — used for `Binary` properties backed by
/// [`crate::node_store::NodeStore::create_blob`].
pub fn write_single_external(
    builder: &mut Builder,
    current_segment: SegmentId,
    property_type: PropertyType,
    blob_id: &str,
) -> Result<u32> {
    let value_offset = write_external(builder, current_segment, blob_id)?;

    let mut buf = Vec::new();
    buf.write_u8(property_type as u8)?;
    let r = make_ref(
        builder,
        current_segment,
        RecordId::new(current_segment, value_offset),
    )?;
    r.encode(&mut buf)?;
    Ok(builder.write_record(&buf))
}

/// Reads a property record at `offset`.
pub fn read_property(source: &dyn SegmentSource, segment: &Segment, offset: u32) -> Result<Property> {
    let cursor = segment.cursor();
    let tag = cursor.read_byte(offset)?;
    let is_multi = tag & MULTI_FLAG != 0;
    let property_type = PropertyType::from_tag(tag & !MULTI_FLAG)?;

    let (r, _) = RecordRef::decode(&cursor, offset + 1)?;
    let target = resolve(segment, r)?;
    let target_segment = load(source, segment, target.segment_id)?;

    if is_multi {
        let ids = list_to_vec(source, &target_segment, target.offset)?;
        let mut values = Vec::with_capacity(ids.len());
        for id in ids {
            let value_segment = load(source, &target_segment, id.segment_id)?;
            values.push(read_inline(source, &value_segment, id.offset)?);
        }
        Ok(Property {
            property_type,
            values: PropertyValues::Multi(values),
        })
    } else {
        let value = if is_external(&target_segment, target.offset)? {
            read_external(source, &target_segment, target.offset)?.into_bytes()
        } else {
            read_inline(source, &target_segment, target.offset)?
        };
        Ok(Property {
            property_type,
            values: PropertyValues::Single(value),
        })
    }
}

/// `true` if the property at `offset` is single-valued and its value is an
/// external blob reference (see [`crate::record::value::write_external`]),
/// as opposed to an inline payload. Multi-valued properties are never
/// external, so this is `false` for them regardless of their elements.
pub fn is_single_external(source: &dyn SegmentSource, segment: &Segment, offset: u32) -> Result<bool> {
    let cursor = segment.cursor();
    let tag = cursor.read_byte(offset)?;
    if tag & MULTI_FLAG != 0 {
        return Ok(false);
    }

    let (r, _) = RecordRef::decode(&cursor, offset + 1)?;
    let target = resolve(segment, r)?;
    let target_segment = load(source, segment, target.segment_id)?;
    is_external(&target_segment, target.offset)
}

fn load(source: &dyn SegmentSource, current: &Segment, id: SegmentId) -> Result<Segment> {
    if id == current.id() {
        Ok(current.clone())
    } else {
        source.load(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{SegmentKind, Version};
    use test_log::test;

    struct Null;
    impl SegmentSource for Null {
        fn load(&self, id: SegmentId) -> Result<Segment> {
            Err(Error::SegmentNotFound(id))
        }
    }

    #[test]
    fn single_long_property_preserves_bit_pattern() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);

        let value: i64 = -42;
        let offset = write_single(
            &mut builder,
            segment_id,
            PropertyType::Long,
            &value.to_be_bytes(),
        )?;

        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        let prop = read_property(&Null, &segment, offset)?;
        assert_eq!(prop.property_type, PropertyType::Long);
        match prop.values {
            PropertyValues::Single(bytes) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                assert_eq!(i64::from_be_bytes(arr), value);
            }
            PropertyValues::Multi(_) => panic!("expected single value"),
        }
        Ok(())
    }

    #[test]
    fn single_binary_property_with_external_value_roundtrips() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);

        let blob_id = "bulk:deadbeef-0000-0000-0000-000000000000:1024";
        let offset = write_single_external(&mut builder, segment_id, PropertyType::Binary, blob_id)?;

        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        let prop = read_property(&Null, &segment, offset)?;
        assert_eq!(prop.property_type, PropertyType::Binary);
        match prop.values {
            PropertyValues::Single(bytes) => assert_eq!(bytes, blob_id.as_bytes()),
            PropertyValues::Multi(_) => panic!("expected single value"),
        }
        Ok(())
    }

    #[test]
    fn multi_string_property_roundtrips() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);

        let values = vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()];
        let offset = write_multi(&mut builder, segment_id, PropertyType::String, &values)?;

        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        let prop = read_property(&Null, &segment, offset)?;
        assert_eq!(prop.property_type, PropertyType::String);
        assert_eq!(prop.values, PropertyValues::Multi(values));
        Ok(())
    }
}
