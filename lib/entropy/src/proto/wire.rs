//! Primitive wire encoding.
//!
//! Integers are big-endian. Strings carry a u16 length prefix, byte blobs a
//! u32 prefix. Hashes travel as their canonical 16-byte big-endian form.
//! Readers bound every length against the remaining payload before
//! allocating, so a forged prefix cannot balloon memory.

use crate::error::{Error, ErrorKind, NetResult};
use crate::hash::Hash128;
use crate::property::{PropertyMetadata, PropertyType, PropertyValue, Quat, Vec2, Vec3, Vec4};
use crate::schema::{ComponentSchema, PropertyDefinition};
use byteorder::{BigEndian, ByteOrder};
use std::convert::TryFrom;

pub struct WireWriter {
    out: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> WireWriter {
        WireWriter { out: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> WireWriter {
        WireWriter {
            out: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.out
    }

    #[inline]
    pub fn u8(&mut self, value: u8) {
        self.out.push(value);
    }

    #[inline]
    pub fn u16(&mut self, value: u16) {
        let mut buf = [0u8; 2];
        BigEndian::write_u16(&mut buf, value);
        self.out.extend_from_slice(&buf);
    }

    #[inline]
    pub fn u32(&mut self, value: u32) {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.out.extend_from_slice(&buf);
    }

    #[inline]
    pub fn u64(&mut self, value: u64) {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        self.out.extend_from_slice(&buf);
    }

    #[inline]
    pub fn i32(&mut self, value: i32) {
        self.u32(value as u32);
    }

    #[inline]
    pub fn i64(&mut self, value: i64) {
        self.u64(value as u64);
    }

    #[inline]
    pub fn f32(&mut self, value: f32) {
        self.u32(value.to_bits());
    }

    #[inline]
    pub fn f64(&mut self, value: f64) {
        self.u64(value.to_bits());
    }

    pub fn string(&mut self, value: &str) -> NetResult<()> {
        if value.len() > usize::from(u16::MAX) {
            return Err(Error::invalid_message("String field too long for wire"));
        }
        self.u16(value.len() as u16);
        self.out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    pub fn blob(&mut self, value: &[u8]) -> NetResult<()> {
        if value.len() > u32::MAX as usize {
            return Err(Error::invalid_message("Byte field too long for wire"));
        }
        self.u32(value.len() as u32);
        self.out.extend_from_slice(value);
        Ok(())
    }

    #[inline]
    pub fn hash(&mut self, value: Hash128) {
        self.out.extend_from_slice(&value.to_bytes());
    }

    pub fn value(&mut self, value: &PropertyValue) -> NetResult<()> {
        self.u8(value.value_type() as u8);
        match value {
            PropertyValue::Int32(v) => self.i32(*v),
            PropertyValue::Int64(v) => self.i64(*v),
            PropertyValue::Float32(v) => self.f32(*v),
            PropertyValue::Float64(v) => self.f64(*v),
            PropertyValue::Vec2(v) => self.vec2(v),
            PropertyValue::Vec3(v) => self.vec3(v),
            PropertyValue::Vec4(v) => self.vec4(v),
            PropertyValue::Quat(v) => self.quat(v),
            PropertyValue::String(v) => self.string(v)?,
            PropertyValue::Bool(v) => self.u8(*v as u8),
            PropertyValue::Bytes(v) => self.blob(v)?,
            PropertyValue::Int32Array(v) => {
                self.array_len(v.len())?;
                v.iter().for_each(|item| self.i32(*item));
            }
            PropertyValue::Int64Array(v) => {
                self.array_len(v.len())?;
                v.iter().for_each(|item| self.i64(*item));
            }
            PropertyValue::Float32Array(v) => {
                self.array_len(v.len())?;
                v.iter().for_each(|item| self.f32(*item));
            }
            PropertyValue::Float64Array(v) => {
                self.array_len(v.len())?;
                v.iter().for_each(|item| self.f64(*item));
            }
            PropertyValue::Vec2Array(v) => {
                self.array_len(v.len())?;
                v.iter().for_each(|item| self.vec2(item));
            }
            PropertyValue::Vec3Array(v) => {
                self.array_len(v.len())?;
                v.iter().for_each(|item| self.vec3(item));
            }
            PropertyValue::Vec4Array(v) => {
                self.array_len(v.len())?;
                v.iter().for_each(|item| self.vec4(item));
            }
            PropertyValue::QuatArray(v) => {
                self.array_len(v.len())?;
                v.iter().for_each(|item| self.quat(item));
            }
        }
        Ok(())
    }

    pub fn metadata(&mut self, metadata: &PropertyMetadata) -> NetResult<()> {
        self.hash(metadata.hash);
        self.u64(metadata.entity_id);
        self.string(&metadata.component_type)?;
        self.string(&metadata.property_name)?;
        self.u8(metadata.value_type as u8);
        self.u64(metadata.registered_at);
        Ok(())
    }

    pub fn schema(&mut self, schema: &ComponentSchema) -> NetResult<()> {
        self.hash(schema.type_hash);
        self.string(&schema.app_id)?;
        self.string(&schema.component_name)?;
        self.u32(schema.schema_version);
        self.hash(schema.structural_hash);

        if schema.properties.len() > usize::from(u16::MAX) {
            return Err(Error::invalid_message("Schema has too many properties for wire"));
        }
        self.u16(schema.properties.len() as u16);
        for prop in &schema.properties {
            self.string(&prop.name)?;
            self.u8(prop.value_type as u8);
            self.u64(prop.offset);
            self.u64(prop.size);
        }

        self.u64(schema.total_size);
        self.u8(schema.is_public as u8);
        Ok(())
    }

    fn array_len(&mut self, len: usize) -> NetResult<()> {
        if len > u32::MAX as usize {
            return Err(Error::invalid_message("Array field too long for wire"));
        }
        self.u32(len as u32);
        Ok(())
    }

    #[inline]
    fn vec2(&mut self, v: &Vec2) {
        self.f32(v.x);
        self.f32(v.y);
    }

    #[inline]
    fn vec3(&mut self, v: &Vec3) {
        self.f32(v.x);
        self.f32(v.y);
        self.f32(v.z);
    }

    #[inline]
    fn vec4(&mut self, v: &Vec4) {
        self.f32(v.x);
        self.f32(v.y);
        self.f32(v.z);
        self.f32(v.w);
    }

    #[inline]
    fn quat(&mut self, v: &Quat) {
        self.f32(v.x);
        self.f32(v.y);
        self.f32(v.z);
        self.f32(v.w);
    }
}

pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> WireReader<'a> {
        WireReader { data, pos: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, count: usize) -> NetResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(Error::invalid_message("Unexpected end of payload"));
        }
        let slice = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    #[inline]
    pub fn u8(&mut self) -> NetResult<u8> {
        Ok(self.take(1)?[0])
    }

    #[inline]
    pub fn u16(&mut self) -> NetResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    #[inline]
    pub fn u32(&mut self) -> NetResult<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    #[inline]
    pub fn u64(&mut self) -> NetResult<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    #[inline]
    pub fn i32(&mut self) -> NetResult<i32> {
        Ok(self.u32()? as i32)
    }

    #[inline]
    pub fn i64(&mut self) -> NetResult<i64> {
        Ok(self.u64()? as i64)
    }

    #[inline]
    pub fn f32(&mut self) -> NetResult<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    #[inline]
    pub fn f64(&mut self) -> NetResult<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    pub fn string(&mut self) -> NetResult<String> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::invalid_message("String field is not valid UTF-8"))
    }

    pub fn blob(&mut self) -> NetResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    #[inline]
    pub fn hash(&mut self) -> NetResult<Hash128> {
        Ok(Hash128::from_digest_prefix(self.take(16)?))
    }

    pub fn property_type(&mut self) -> NetResult<PropertyType> {
        let raw = u32::from(self.u8()?);
        PropertyType::try_from(raw).map_err(|raw| Error::invalid_message(format!("Unknown property type tag {}", raw)))
    }

    pub fn value(&mut self) -> NetResult<PropertyValue> {
        let tag = self.property_type()?;
        Ok(match tag {
            PropertyType::Int32 => PropertyValue::Int32(self.i32()?),
            PropertyType::Int64 => PropertyValue::Int64(self.i64()?),
            PropertyType::Float32 => PropertyValue::Float32(self.f32()?),
            PropertyType::Float64 => PropertyValue::Float64(self.f64()?),
            PropertyType::Vec2 => PropertyValue::Vec2(self.vec2()?),
            PropertyType::Vec3 => PropertyValue::Vec3(self.vec3()?),
            PropertyType::Vec4 => PropertyValue::Vec4(self.vec4()?),
            PropertyType::Quat => PropertyValue::Quat(self.quat()?),
            PropertyType::String => PropertyValue::String(self.string()?),
            PropertyType::Bool => PropertyValue::Bool(self.u8()? != 0),
            PropertyType::Bytes => PropertyValue::Bytes(self.blob()?),
            PropertyType::Int32Array => {
                let count = self.array_len(4)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.i32()?);
                }
                PropertyValue::Int32Array(items)
            }
            PropertyType::Int64Array => {
                let count = self.array_len(8)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.i64()?);
                }
                PropertyValue::Int64Array(items)
            }
            PropertyType::Float32Array => {
                let count = self.array_len(4)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.f32()?);
                }
                PropertyValue::Float32Array(items)
            }
            PropertyType::Float64Array => {
                let count = self.array_len(8)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.f64()?);
                }
                PropertyValue::Float64Array(items)
            }
            PropertyType::Vec2Array => {
                let count = self.array_len(8)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.vec2()?);
                }
                PropertyValue::Vec2Array(items)
            }
            PropertyType::Vec3Array => {
                let count = self.array_len(12)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.vec3()?);
                }
                PropertyValue::Vec3Array(items)
            }
            PropertyType::Vec4Array => {
                let count = self.array_len(16)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.vec4()?);
                }
                PropertyValue::Vec4Array(items)
            }
            PropertyType::QuatArray => {
                let count = self.array_len(16)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.quat()?);
                }
                PropertyValue::QuatArray(items)
            }
        })
    }

    pub fn metadata(&mut self) -> NetResult<PropertyMetadata> {
        let hash = self.hash()?;
        let entity_id = self.u64()?;
        let component_type = self.string()?;
        let property_name = self.string()?;
        let value_type = self.property_type()?;
        let registered_at = self.u64()?;
        Ok(PropertyMetadata {
            hash,
            entity_id,
            component_type,
            property_name,
            value_type,
            registered_at,
        })
    }

    /// Reads a schema and re-verifies both hashes. A mismatch between the
    /// transmitted and recomputed hashes is `SchemaValidationFailed`;
    /// transmitted hashes are never trusted.
    pub fn schema(&mut self) -> NetResult<ComponentSchema> {
        let type_hash = self.hash()?;
        let app_id = self.string()?;
        let component_name = self.string()?;
        let schema_version = self.u32()?;
        let structural_hash = self.hash()?;

        let count = usize::from(self.u16()?);
        let mut properties = Vec::new();
        for _ in 0..count {
            let name = self.string()?;
            let value_type = self.property_type()?;
            let offset = self.u64()?;
            let size = self.u64()?;
            properties.push(PropertyDefinition {
                name,
                value_type,
                offset,
                size,
            });
        }

        let total_size = self.u64()?;
        let is_public = self.u8()? != 0;

        let computed_structural = ComponentSchema::compute_structural_hash(&properties);
        if computed_structural != structural_hash {
            return Err(Error::new(
                ErrorKind::SchemaValidationFailed,
                "Structural hash mismatch after deserialization",
            ));
        }

        let computed_type = ComponentSchema::compute_type_hash(&app_id, &component_name, schema_version, &structural_hash);
        if computed_type != type_hash {
            return Err(Error::new(
                ErrorKind::SchemaValidationFailed,
                "Type hash mismatch after deserialization",
            ));
        }

        Ok(ComponentSchema {
            type_hash,
            app_id,
            component_name,
            schema_version,
            structural_hash,
            properties,
            total_size,
            is_public,
        })
    }

    /// Reads an array length prefix and bounds it against the bytes left in
    /// the payload for the given minimum element size.
    fn array_len(&mut self, element_size: usize) -> NetResult<usize> {
        let count = self.u32()? as usize;
        if count.checked_mul(element_size).map_or(true, |needed| needed > self.remaining()) {
            return Err(Error::invalid_message("Array length exceeds payload"));
        }
        Ok(count)
    }

    #[inline]
    fn vec2(&mut self) -> NetResult<Vec2> {
        Ok(Vec2::new(self.f32()?, self.f32()?))
    }

    #[inline]
    fn vec3(&mut self) -> NetResult<Vec3> {
        Ok(Vec3::new(self.f32()?, self.f32()?, self.f32()?))
    }

    #[inline]
    fn vec4(&mut self) -> NetResult<Vec4> {
        Ok(Vec4::new(self.f32()?, self.f32()?, self.f32()?, self.f32()?))
    }

    #[inline]
    fn quat(&mut self) -> NetResult<Quat> {
        Ok(Quat::new(self.f32()?, self.f32()?, self.f32()?, self.f32()?))
    }
}
