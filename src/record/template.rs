//! `TEMPLATE` record: a node's shared shape descriptor — its property
//! names/types plus optional primary type, mixin types and child name hint.
//! Nodes with identical shape share a single template record.

use crate::error::Result;
use crate::id::{RecordId, SegmentId};
use crate::record::list::{list_to_vec, write_list};
use crate::record::property::PropertyType;
use crate::record::string::{read_string, write_string};
use crate::record::{make_ref, resolve, RecordRef};
use crate::segment::{Builder, Segment, SegmentSource};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

const HAS_PRIMARY_TYPE: u8 = 0b001;
const HAS_MIXIN_TYPES: u8 = 0b010;
const HAS_CHILD_NAME: u8 = 0b100;

/// One property's shape entry: its name and declared type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PropertyDescriptor {
    pub name: String,
    pub property_type: PropertyType,
}

/// A decoded template's shape.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Template {
    pub properties: Vec<PropertyDescriptor>,
    pub primary_type: Option<String>,
    pub mixin_types: Vec<String>,
    pub child_name: Option<String>,
}

/// Writes a template record, returning its offset.
pub fn write_template(
    builder: &mut Builder,
    current_segment: SegmentId,
    template: &Template,
) -> Result<u32> {
    let mut flags = 0u8;
    if template.primary_type.is_some() {
        flags |= HAS_PRIMARY_TYPE;
    }
    if !template.mixin_types.is_empty() {
        flags |= HAS_MIXIN_TYPES;
    }
    if template.child_name.is_some() {
        flags |= HAS_CHILD_NAME;
    }

    let mut buf = Vec::new();
    buf.write_u8(flags)?;
    buf.write_u16::<BigEndian>(template.properties.len() as u16)?;

    for prop in &template.properties {
        buf.write_u8(prop.property_type as u8)?;
        let name_offset = write_string(builder, current_segment, prop.name.as_bytes())?;
        let name_ref = make_ref(
            builder,
            current_segment,
            RecordId::new(current_segment, name_offset),
        )?;
        name_ref.encode(&mut buf)?;
    }

    if let Some(primary) = &template.primary_type {
        let offset = write_string(builder, current_segment, primary.as_bytes())?;
        let r = make_ref(builder, current_segment, RecordId::new(current_segment, offset))?;
        r.encode(&mut buf)?;
    }

    if !template.mixin_types.is_empty() {
        let mut mixin_ids = Vec::new();
        for mixin in &template.mixin_types {
            let offset = write_string(builder, current_segment, mixin.as_bytes())?;
            mixin_ids.push(RecordId::new(current_segment, offset));
        }
        let list_offset = write_list(builder, current_segment, &mixin_ids)?;
        let r = make_ref(
            builder,
            current_segment,
            RecordId::new(current_segment, list_offset),
        )?;
        r.encode(&mut buf)?;
    }

    if let Some(child_name) = &template.child_name {
        let offset = write_string(builder, current_segment, child_name.as_bytes())?;
        let r = make_ref(builder, current_segment, RecordId::new(current_segment, offset))?;
        r.encode(&mut buf)?;
    }

    Ok(builder.write_record(&buf))
}

/// Reads a template record at `offset`.
pub fn read_template(source: &dyn SegmentSource, segment: &Segment, offset: u32) -> Result<Template> {
    let cursor = segment.cursor();
    let flags = cursor.read_byte(offset)?;
    let prop_count = cursor.read_short(offset + 1)? as usize;

    let mut pos = offset + 3;
    let mut properties = Vec::with_capacity(prop_count);
    for _ in 0..prop_count {
        let type_tag = cursor.read_byte(pos)?;
        let property_type = PropertyType::from_tag(type_tag)?;
        let (name_ref, next) = RecordRef::decode(&cursor, pos + 1)?;
        pos = next;

        let name_record = resolve(segment, name_ref)?;
        let name_segment = load(source, segment, name_record.segment_id)?;
        let name = String::from_utf8(read_string(source, &name_segment, name_record.offset)?)
            .map_err(|e| crate::error::Error::Decode(format!("bad property name: {e}")))?;

        properties.push(PropertyDescriptor { name, property_type });
    }

    let mut primary_type = None;
    if flags & HAS_PRIMARY_TYPE != 0 {
        let (r, next) = RecordRef::decode(&cursor, pos)?;
        pos = next;
        let record = resolve(segment, r)?;
        let record_segment = load(source, segment, record.segment_id)?;
        primary_type = Some(
            String::from_utf8(read_string(source, &record_segment, record.offset)?)
                .map_err(|e| crate::error::Error::Decode(format!("bad primary type: {e}")))?,
        );
    }

    let mut mixin_types = Vec::new();
    if flags & HAS_MIXIN_TYPES != 0 {
        let (r, next) = RecordRef::decode(&cursor, pos)?;
        pos = next;
        let record = resolve(segment, r)?;
        let record_segment = load(source, segment, record.segment_id)?;
        for id in list_to_vec(source, &record_segment, record.offset)? {
            let id_segment = load(source, &record_segment, id.segment_id)?;
            mixin_types.push(
                String::from_utf8(read_string(source, &id_segment, id.offset)?)
                    .map_err(|e| crate::error::Error::Decode(format!("bad mixin type: {e}")))?,
            );
        }
    }

    let mut child_name = None;
    if flags & HAS_CHILD_NAME != 0 {
        let (r, _) = RecordRef::decode(&cursor, pos)?;
        let record = resolve(segment, r)?;
        let record_segment = load(source, segment, record.segment_id)?;
        child_name = Some(
            String::from_utf8(read_string(source, &record_segment, record.offset)?)
                .map_err(|e| crate::error::Error::Decode(format!("bad child name: {e}")))?,
        );
    }

    Ok(Template {
        properties,
        primary_type,
        mixin_types,
        child_name,
    })
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
    use crate::error::Error;
    use crate::id::{SegmentKind, Version};
    use test_log::test;

    struct Null;
    impl SegmentSource for Null {
        fn load(&self, id: SegmentId) -> Result<Segment> {
            Err(Error::SegmentNotFound(id))
        }
    }

    #[test]
    fn template_roundtrip_full_shape() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);

        let template = Template {
            properties: vec![
                PropertyDescriptor {
                    name: "title".into(),
                    property_type: PropertyType::String,
                },
                PropertyDescriptor {
                    name: "count".into(),
                    property_type: PropertyType::Long,
                },
            ],
            primary_type: Some("nt:unstructured".into()),
            mixin_types: vec!["mix:referenceable".into(), "mix:versionable".into()],
            child_name: Some("jcr:content".into()),
        };

        let offset = write_template(&mut builder, segment_id, &template)?;
        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        let decoded = read_template(&Null, &segment, offset)?;
        assert_eq!(decoded, template);
        Ok(())
    }

    #[test]
    fn template_roundtrip_minimal_shape() -> Result<()> {
        let segment_id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let mut builder = Builder::new(0);

        let template = Template {
            properties: vec![],
            primary_type: None,
            mixin_types: vec![],
            child_name: None,
        };

        let offset = write_template(&mut builder, segment_id, &template)?;
        let (bytes, _) = builder.seal(segment_id)?;
        let segment = Segment::parse(segment_id, bytes.into())?;

        let decoded = read_template(&Null, &segment, offset)?;
        assert_eq!(decoded, template);
        Ok(())
    }
}
