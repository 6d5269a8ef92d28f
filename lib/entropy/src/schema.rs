//! Component schemas: declared binary layouts with structural and nominal
//! hashing.

use crate::error::{Error, ErrorKind, NetResult};
use crate::hash::{sha256_high128, ComponentTypeHash, PropertyHash};
use crate::property::PropertyType;
use byteorder::{BigEndian, ByteOrder};

/// One field inside a component layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyDefinition {
    pub name: String,
    pub value_type: PropertyType,
    pub offset: u64,
    pub size: u64,
}

impl PropertyDefinition {
    pub fn new(name: impl Into<String>, value_type: PropertyType, offset: u64, size: u64) -> PropertyDefinition {
        PropertyDefinition {
            name: name.into(),
            value_type,
            offset,
            size,
        }
    }
}

/// The complete declared structure of a component type.
///
/// Schemas are private by default; applications opt in to discovery with the
/// `is_public` flag or a later registry publish. The structural hash
/// identifies the field layout alone, the type hash adds nominal identity
/// (app id, name, version).
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSchema {
    pub type_hash: ComponentTypeHash,
    pub app_id: String,
    pub component_name: String,
    pub schema_version: u32,
    pub structural_hash: PropertyHash,
    pub properties: Vec<PropertyDefinition>,
    pub total_size: u64,
    pub is_public: bool,
}

impl ComponentSchema {
    /// Computes the structural hash: SHA-256 over each property's
    /// `name || type BE4 || offset BE8 || size BE8` concatenated in list
    /// order, truncated to 128 bits. Reordering fields changes the hash.
    pub fn compute_structural_hash(properties: &[PropertyDefinition]) -> PropertyHash {
        let mut input = Vec::new();
        let mut scratch = [0u8; 8];

        for prop in properties {
            input.extend_from_slice(prop.name.as_bytes());

            BigEndian::write_u32(&mut scratch[..4], prop.value_type as u32);
            input.extend_from_slice(&scratch[..4]);

            BigEndian::write_u64(&mut scratch, prop.offset);
            input.extend_from_slice(&scratch);

            BigEndian::write_u64(&mut scratch, prop.size);
            input.extend_from_slice(&scratch);
        }

        sha256_high128(&input)
    }

    /// Computes the type hash:
    /// `SHA-256(app_id || component_name || version BE4 || structural.high BE8 || structural.low BE8)`
    /// truncated to 128 bits.
    pub fn compute_type_hash(
        app_id: &str,
        component_name: &str,
        schema_version: u32,
        structural_hash: &PropertyHash,
    ) -> ComponentTypeHash {
        let mut input = Vec::with_capacity(app_id.len() + component_name.len() + 4 + 16);
        let mut scratch = [0u8; 8];

        input.extend_from_slice(app_id.as_bytes());
        input.extend_from_slice(component_name.as_bytes());

        BigEndian::write_u32(&mut scratch[..4], schema_version);
        input.extend_from_slice(&scratch[..4]);

        input.extend_from_slice(&structural_hash.to_bytes());

        sha256_high128(&input)
    }

    /// Validates field definitions and builds a schema with both hashes
    /// computed. Rejects empty identifiers, empty layouts, fields past
    /// `total_size`, and overlapping byte ranges.
    pub fn create(
        app_id: impl Into<String>,
        component_name: impl Into<String>,
        schema_version: u32,
        properties: Vec<PropertyDefinition>,
        total_size: u64,
        is_public: bool,
    ) -> NetResult<ComponentSchema> {
        let app_id = app_id.into();
        let component_name = component_name.into();

        if app_id.is_empty() {
            return Err(Error::invalid_parameter("appId cannot be empty"));
        }

        if component_name.is_empty() {
            return Err(Error::invalid_parameter("componentName cannot be empty"));
        }

        if properties.is_empty() {
            return Err(Error::invalid_parameter("properties list cannot be empty"));
        }

        for prop in &properties {
            if prop.name.is_empty() {
                return Err(Error::new(
                    ErrorKind::SchemaValidationFailed,
                    "Property name cannot be empty",
                ));
            }

            if prop.offset.checked_add(prop.size).map_or(true, |end| end > total_size) {
                return Err(Error::new(
                    ErrorKind::SchemaValidationFailed,
                    format!("Property '{}' extends beyond totalSize", prop.name),
                ));
            }
        }

        for (i, a) in properties.iter().enumerate() {
            for b in &properties[i + 1..] {
                let overlaps = a.offset < b.offset + b.size && b.offset < a.offset + a.size;
                if overlaps {
                    return Err(Error::new(
                        ErrorKind::SchemaValidationFailed,
                        format!("Properties '{}' and '{}' overlap", a.name, b.name),
                    ));
                }
            }
        }

        let structural_hash = Self::compute_structural_hash(&properties);
        let type_hash = Self::compute_type_hash(&app_id, &component_name, schema_version, &structural_hash);

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

    /// Fast structural compatibility: identical field layouts.
    #[inline]
    pub fn is_structurally_compatible(&self, other: &ComponentSchema) -> bool {
        self.structural_hash == other.structural_hash
    }

    /// Subset compatibility: every property of `self` must exist in `other`
    /// with identical type, offset, and size. Failures name the offending
    /// property.
    pub fn can_read_from(&self, other: &ComponentSchema) -> NetResult<()> {
        for ours in &self.properties {
            let theirs = other
                .properties
                .iter()
                .find(|p| p.name == ours.name)
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::SchemaIncompatible,
                        format!("Property '{}' not found in source schema", ours.name),
                    )
                })?;

            if ours.value_type != theirs.value_type {
                return Err(Error::new(
                    ErrorKind::SchemaIncompatible,
                    format!(
                        "Property '{}' type mismatch: expected {}, got {}",
                        ours.name, ours.value_type, theirs.value_type
                    ),
                ));
            }

            if ours.offset != theirs.offset {
                return Err(Error::new(
                    ErrorKind::SchemaIncompatible,
                    format!(
                        "Property '{}' offset mismatch: expected {}, got {}",
                        ours.name, ours.offset, theirs.offset
                    ),
                ));
            }

            if ours.size != theirs.size {
                return Err(Error::new(
                    ErrorKind::SchemaIncompatible,
                    format!(
                        "Property '{}' size mismatch: expected {}, got {}",
                        ours.name, ours.size, theirs.size
                    ),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform_props() -> Vec<PropertyDefinition> {
        vec![
            PropertyDefinition::new("position", PropertyType::Vec3, 0, 12),
            PropertyDefinition::new("rotation", PropertyType::Quat, 12, 16),
            PropertyDefinition::new("scale", PropertyType::Vec3, 28, 12),
        ]
    }

    #[test]
    fn test_create_computes_hashes() {
        let schema = ComponentSchema::create("CanvasEngine", "Transform", 1, transform_props(), 40, true).unwrap();

        assert!(!schema.structural_hash.is_null());
        assert!(!schema.type_hash.is_null());
        assert_eq!(
            schema.structural_hash,
            ComponentSchema::compute_structural_hash(&schema.properties)
        );
        assert_eq!(
            schema.type_hash,
            ComponentSchema::compute_type_hash("CanvasEngine", "Transform", 1, &schema.structural_hash)
        );
    }

    #[test]
    fn test_structural_hash_is_order_sensitive() {
        let forward = transform_props();
        let mut reversed = transform_props();
        reversed.reverse();

        assert_ne!(
            ComponentSchema::compute_structural_hash(&forward),
            ComponentSchema::compute_structural_hash(&reversed)
        );
    }

    #[test]
    fn test_structural_hash_ignores_nominal_identity() {
        let a = ComponentSchema::create("AppA", "Alpha", 1, transform_props(), 40, false).unwrap();
        let b = ComponentSchema::create("AppB", "Beta", 3, transform_props(), 40, false).unwrap();

        assert_eq!(a.structural_hash, b.structural_hash);
        assert_ne!(a.type_hash, b.type_hash);
    }

    #[test]
    fn test_type_hash_depends_on_version() {
        let structural = ComponentSchema::compute_structural_hash(&transform_props());
        let v1 = ComponentSchema::compute_type_hash("App", "Transform", 1, &structural);
        let v2 = ComponentSchema::compute_type_hash("App", "Transform", 2, &structural);
        assert_ne!(v1, v2);
    }

    #[test]
    fn test_create_rejects_empty_identifiers() {
        let err = ComponentSchema::create("", "Transform", 1, transform_props(), 40, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        let err = ComponentSchema::create("App", "", 1, transform_props(), 40, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        let err = ComponentSchema::create("App", "Transform", 1, Vec::new(), 40, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_create_rejects_out_of_bounds_fields() {
        let props = vec![PropertyDefinition::new("position", PropertyType::Vec3, 32, 12)];
        let err = ComponentSchema::create("App", "Transform", 1, props, 40, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailed);
        assert!(err.message.contains("position"));
    }

    #[test]
    fn test_create_rejects_overlapping_fields() {
        let props = vec![
            PropertyDefinition::new("a", PropertyType::Vec3, 0, 12),
            PropertyDefinition::new("b", PropertyType::Vec3, 8, 12),
        ];
        let err = ComponentSchema::create("App", "Transform", 1, props, 40, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailed);
        assert!(err.message.contains('a') && err.message.contains('b'));
    }

    #[test]
    fn test_create_rejects_empty_property_name() {
        let props = vec![PropertyDefinition::new("", PropertyType::Vec3, 0, 12)];
        let err = ComponentSchema::create("App", "Transform", 1, props, 40, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailed);
    }

    #[test]
    fn test_can_read_from_subset() {
        let full = ComponentSchema::create("App", "Transform", 1, transform_props(), 40, false).unwrap();
        let subset = ComponentSchema::create(
            "Other",
            "TransformView",
            1,
            vec![PropertyDefinition::new("position", PropertyType::Vec3, 0, 12)],
            40,
            false,
        )
        .unwrap();

        subset.can_read_from(&full).unwrap();

        let err = full.can_read_from(&subset).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaIncompatible);
        assert!(err.message.contains("rotation"));
    }

    #[test]
    fn test_can_read_from_field_mismatches() {
        let full = ComponentSchema::create("App", "Transform", 1, transform_props(), 40, false).unwrap();

        let wrong_type = ComponentSchema::create(
            "Other",
            "View",
            1,
            vec![PropertyDefinition::new("position", PropertyType::Vec4, 0, 12)],
            40,
            false,
        )
        .unwrap();
        let err = wrong_type.can_read_from(&full).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaIncompatible);
        assert!(err.message.contains("type mismatch"));

        let wrong_offset = ComponentSchema::create(
            "Other",
            "View",
            1,
            vec![PropertyDefinition::new("position", PropertyType::Vec3, 4, 12)],
            40,
            false,
        )
        .unwrap();
        let err = wrong_offset.can_read_from(&full).unwrap_err();
        assert!(err.message.contains("offset mismatch"));
    }
}
