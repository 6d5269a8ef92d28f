//! Property type system: the tag enum, value sum type, and per-property
//! registration metadata.

use crate::hash::PropertyHash;
use serde::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;

/// Unique identifier for entities. Id 0 is reserved for "root / no parent".
pub type EntityId = u64;

pub const ROOT_ENTITY: EntityId = 0;

/// Wire-stable property type tags. Ordinals are part of the protocol.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum PropertyType {
    Int32 = 0,
    Int64 = 1,
    Float32 = 2,
    Float64 = 3,
    Vec2 = 4,
    Vec3 = 5,
    Vec4 = 6,
    Quat = 7,
    String = 8,
    Bool = 9,
    Bytes = 10,

    // Array types
    Int32Array = 11,
    Int64Array = 12,
    Float32Array = 13,
    Float64Array = 14,
    Vec2Array = 15,
    Vec3Array = 16,
    Vec4Array = 17,
    QuatArray = 18,
}

impl PropertyType {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyType::Int32 => "Int32",
            PropertyType::Int64 => "Int64",
            PropertyType::Float32 => "Float32",
            PropertyType::Float64 => "Float64",
            PropertyType::Vec2 => "Vec2",
            PropertyType::Vec3 => "Vec3",
            PropertyType::Vec4 => "Vec4",
            PropertyType::Quat => "Quat",
            PropertyType::String => "String",
            PropertyType::Bool => "Bool",
            PropertyType::Bytes => "Bytes",
            PropertyType::Int32Array => "Int32Array",
            PropertyType::Int64Array => "Int64Array",
            PropertyType::Float32Array => "Float32Array",
            PropertyType::Float64Array => "Float64Array",
            PropertyType::Vec2Array => "Vec2Array",
            PropertyType::Vec3Array => "Vec3Array",
            PropertyType::Vec4Array => "Vec4Array",
            PropertyType::QuatArray => "QuatArray",
        }
    }

    /// Whether the tag is accepted for per-instance property registration.
    /// Array tags appear only inside component schemas.
    #[inline]
    pub fn is_registrable(self) -> bool {
        (self as u32) <= PropertyType::Bytes as u32
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u32> for PropertyType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        Ok(match value {
            0 => PropertyType::Int32,
            1 => PropertyType::Int64,
            2 => PropertyType::Float32,
            3 => PropertyType::Float64,
            4 => PropertyType::Vec2,
            5 => PropertyType::Vec3,
            6 => PropertyType::Vec4,
            7 => PropertyType::Quat,
            8 => PropertyType::String,
            9 => PropertyType::Bool,
            10 => PropertyType::Bytes,
            11 => PropertyType::Int32Array,
            12 => PropertyType::Int64Array,
            13 => PropertyType::Float32Array,
            14 => PropertyType::Float64Array,
            15 => PropertyType::Vec2Array,
            16 => PropertyType::Vec3Array,
            17 => PropertyType::Vec4Array,
            18 => PropertyType::QuatArray,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec4 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Vec2 {
    pub fn new(x: f32, y: f32) -> Vec2 {
        Vec2 { x, y }
    }
}

impl Vec3 {
    pub fn new(x: f32, y: f32, z: f32) -> Vec3 {
        Vec3 { x, y, z }
    }
}

impl Vec4 {
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Vec4 {
        Vec4 { x, y, z, w }
    }
}

impl Quat {
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Quat {
        Quat { x, y, z, w }
    }
}

/// Type-safe container for a property value. The active variant carries the
/// dynamic tag reported by [`PropertyValue::value_type`].
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Quat(Quat),
    String(String),
    Bool(bool),
    Bytes(Vec<u8>),
    Int32Array(Vec<i32>),
    Int64Array(Vec<i64>),
    Float32Array(Vec<f32>),
    Float64Array(Vec<f64>),
    Vec2Array(Vec<Vec2>),
    Vec3Array(Vec<Vec3>),
    Vec4Array(Vec<Vec4>),
    QuatArray(Vec<Quat>),
}

impl PropertyValue {
    /// The tag corresponding to the active variant.
    pub fn value_type(&self) -> PropertyType {
        match self {
            PropertyValue::Int32(_) => PropertyType::Int32,
            PropertyValue::Int64(_) => PropertyType::Int64,
            PropertyValue::Float32(_) => PropertyType::Float32,
            PropertyValue::Float64(_) => PropertyType::Float64,
            PropertyValue::Vec2(_) => PropertyType::Vec2,
            PropertyValue::Vec3(_) => PropertyType::Vec3,
            PropertyValue::Vec4(_) => PropertyType::Vec4,
            PropertyValue::Quat(_) => PropertyType::Quat,
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::Bytes(_) => PropertyType::Bytes,
            PropertyValue::Int32Array(_) => PropertyType::Int32Array,
            PropertyValue::Int64Array(_) => PropertyType::Int64Array,
            PropertyValue::Float32Array(_) => PropertyType::Float32Array,
            PropertyValue::Float64Array(_) => PropertyType::Float64Array,
            PropertyValue::Vec2Array(_) => PropertyType::Vec2Array,
            PropertyValue::Vec3Array(_) => PropertyType::Vec3Array,
            PropertyValue::Vec4Array(_) => PropertyType::Vec4Array,
            PropertyValue::QuatArray(_) => PropertyType::QuatArray,
        }
    }
}

/// Registration record for one property instance. Two records match when all
/// fields except the registration timestamp are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMetadata {
    pub hash: PropertyHash,
    pub entity_id: EntityId,
    pub component_type: String,
    pub property_name: String,
    pub value_type: PropertyType,
    pub registered_at: u64,
}

impl PropertyMetadata {
    pub fn new(
        hash: PropertyHash,
        entity_id: EntityId,
        component_type: impl Into<String>,
        property_name: impl Into<String>,
        value_type: PropertyType,
        registered_at: u64,
    ) -> PropertyMetadata {
        PropertyMetadata {
            hash,
            entity_id,
            component_type: component_type.into(),
            property_name: property_name.into(),
            value_type,
            registered_at,
        }
    }

    /// Identity comparison, ignoring the registration timestamp.
    pub fn matches(&self, other: &PropertyMetadata) -> bool {
        self.hash == other.hash
            && self.entity_id == other.entity_id
            && self.component_type == other.component_type
            && self.property_name == other.property_name
            && self.value_type == other.value_type
    }
}
