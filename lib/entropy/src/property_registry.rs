//! Thread-safe store mapping property hashes to their registration metadata.
//! Many-readers/one-writer; the entity index is kept in exact correspondence
//! with the main map under the writer lock.

use crate::error::{Error, ErrorKind, NetResult};
use crate::hash::PropertyHash;
use crate::property::{EntityId, PropertyMetadata, PropertyType, PropertyValue};
use enthalpy::logging::{self, Logger};
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::sync::RwLock;

/// Longest accepted component-type or property name, in bytes.
pub const MAX_NAME_LENGTH: usize = 256;
/// Upper bound on properties registered against a single entity.
pub const MAX_PROPERTIES_PER_ENTITY: usize = 256;
/// Upper bound on properties across all entities.
pub const MAX_TOTAL_PROPERTIES: usize = 1_048_576;

#[derive(Default)]
struct Tables {
    by_hash: HashMap<PropertyHash, PropertyMetadata>,
    by_entity: HashMap<EntityId, IndexSet<PropertyHash>>,
}

/// Registry of per-instance properties used for type validation, reverse
/// lookup, and entity-scoped cleanup.
pub struct PropertyRegistry {
    tables: RwLock<Tables>,
    log: Logger,
}

impl PropertyRegistry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> PropertyRegistry {
        PropertyRegistry {
            tables: RwLock::new(Tables::default()),
            log: logging::child(log),
        }
    }

    /// Registers a property.
    ///
    /// Re-registering identical metadata refreshes the stored timestamp and
    /// succeeds. The same hash with different metadata is a `HashCollision`;
    /// the diagnostic names both identities.
    pub fn register_property(&self, metadata: PropertyMetadata) -> NetResult<()> {
        if !metadata.value_type.is_registrable() {
            return Err(Error::invalid_parameter(format!(
                "Property type {} is not registrable",
                metadata.value_type
            )));
        }

        if metadata.component_type.is_empty() || metadata.component_type.len() > MAX_NAME_LENGTH {
            return Err(Error::invalid_parameter("Invalid componentType length"));
        }

        if metadata.property_name.is_empty() || metadata.property_name.len() > MAX_NAME_LENGTH {
            return Err(Error::invalid_parameter("Invalid propertyName length"));
        }

        let mut tables = self.tables.write().unwrap();

        if let Some(existing) = tables.by_hash.get(&metadata.hash) {
            if existing.matches(&metadata) {
                // Idempotent re-registration refreshes the timestamp.
                let refreshed = metadata.registered_at;
                tables.by_hash.get_mut(&metadata.hash).unwrap().registered_at = refreshed;
                return Ok(());
            }

            return Err(Error::new(
                ErrorKind::HashCollision,
                format!(
                    "Property hash collision for {}\nExisting: entity={}, component={}, property={}, type={}\nIncoming: entity={}, component={}, property={}, type={}",
                    metadata.hash,
                    existing.entity_id,
                    existing.component_type,
                    existing.property_name,
                    existing.value_type,
                    metadata.entity_id,
                    metadata.component_type,
                    metadata.property_name,
                    metadata.value_type
                ),
            ));
        }

        if let Some(owned) = tables.by_entity.get(&metadata.entity_id) {
            if owned.len() >= MAX_PROPERTIES_PER_ENTITY {
                return Err(Error::new(
                    ErrorKind::ResourceLimitExceeded,
                    "Entity property limit exceeded",
                ));
            }
        }

        if tables.by_hash.len() >= MAX_TOTAL_PROPERTIES {
            return Err(Error::new(
                ErrorKind::ResourceLimitExceeded,
                "Global property limit exceeded",
            ));
        }

        logging::trace!(self.log, "property registered";
                        "hash" => %metadata.hash,
                        "entity_id" => metadata.entity_id,
                        "property" => &metadata.property_name);

        let hash = metadata.hash;
        let entity_id = metadata.entity_id;
        tables.by_hash.insert(hash, metadata);
        tables.by_entity.entry(entity_id).or_default().insert(hash);

        Ok(())
    }

    pub fn is_registered(&self, hash: PropertyHash) -> bool {
        self.tables.read().unwrap().by_hash.contains_key(&hash)
    }

    pub fn lookup(&self, hash: PropertyHash) -> Option<PropertyMetadata> {
        self.tables.read().unwrap().by_hash.get(&hash).cloned()
    }

    /// True if the property is registered with exactly the expected type.
    pub fn validate_type(&self, hash: PropertyHash, expected: PropertyType) -> bool {
        let tables = self.tables.read().unwrap();
        match tables.by_hash.get(&hash) {
            Some(metadata) => metadata.value_type == expected,
            None => false,
        }
    }

    /// Validates a value against the registered type for `hash`.
    pub fn validate_property_value(&self, hash: PropertyHash, value: &PropertyValue) -> NetResult<()> {
        let tables = self.tables.read().unwrap();

        let metadata = tables
            .by_hash
            .get(&hash)
            .ok_or_else(|| Error::new(ErrorKind::UnknownProperty, "Property hash not registered"))?;

        let actual = value.value_type();
        if actual != metadata.value_type {
            return Err(Error::new(
                ErrorKind::TypeMismatch,
                format!(
                    "Property type mismatch: expected {}, got {}",
                    metadata.value_type, actual
                ),
            ));
        }

        Ok(())
    }

    /// Snapshot of all property hashes owned by the entity; empty when the
    /// entity is unknown.
    pub fn entity_properties(&self, entity_id: EntityId) -> Vec<PropertyHash> {
        let tables = self.tables.read().unwrap();
        match tables.by_entity.get(&entity_id) {
            Some(owned) => owned.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Removes every property for the entity and returns the removed hashes.
    /// Idempotent on a missing entity.
    pub fn unregister_entity(&self, entity_id: EntityId) -> Vec<PropertyHash> {
        let mut tables = self.tables.write().unwrap();

        let owned = match tables.by_entity.remove(&entity_id) {
            Some(owned) => owned,
            None => return Vec::new(),
        };

        let removed: Vec<PropertyHash> = owned.iter().copied().collect();
        for hash in &removed {
            tables.by_hash.remove(hash);
        }

        logging::debug!(self.log, "entity unregistered";
                        "entity_id" => entity_id,
                        "removed" => removed.len());

        removed
    }

    /// Removes a single property, pruning the entity index entry when it
    /// becomes empty. Returns false for an unknown hash.
    pub fn unregister_property(&self, hash: PropertyHash) -> bool {
        let mut tables = self.tables.write().unwrap();

        let entity_id = match tables.by_hash.remove(&hash) {
            Some(metadata) => metadata.entity_id,
            None => return false,
        };

        if let Some(owned) = tables.by_entity.get_mut(&entity_id) {
            owned.shift_remove(&hash);
            if owned.is_empty() {
                tables.by_entity.remove(&entity_id);
            }
        }

        true
    }

    /// Snapshot copy of every registered property.
    pub fn all_properties(&self) -> Vec<PropertyMetadata> {
        self.tables.read().unwrap().by_hash.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().unwrap().by_hash.is_empty()
    }

    pub fn clear(&self) {
        let mut tables = self.tables.write().unwrap();
        tables.by_hash.clear();
        tables.by_entity.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{compute_property_hash, Hash128};

    fn meta(entity: EntityId, component: &str, name: &str, ty: PropertyType, at: u64) -> PropertyMetadata {
        let hash = compute_property_hash(entity, component, name);
        PropertyMetadata::new(hash, entity, component, name, ty, at)
    }

    fn registry() -> PropertyRegistry {
        PropertyRegistry::new(None)
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = registry();
        let m = meta(42, "Transform", "position", PropertyType::Vec3, 1);

        reg.register_property(m.clone()).unwrap();

        assert!(reg.is_registered(m.hash));
        assert_eq!(reg.len(), 1);

        let found = reg.lookup(m.hash).unwrap();
        assert!(found.matches(&m));
        assert!(reg.lookup(compute_property_hash(1, "x", "y")).is_none());
    }

    #[test]
    fn test_idempotent_reregistration_updates_timestamp() {
        let reg = registry();
        let m = meta(42, "Transform", "position", PropertyType::Vec3, 100);
        reg.register_property(m.clone()).unwrap();

        let mut later = m.clone();
        later.registered_at = 200;
        reg.register_property(later).unwrap();

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.lookup(m.hash).unwrap().registered_at, 200);
    }

    #[test]
    fn test_collision_diagnostics_name_both_identities() {
        let reg = registry();
        let m = meta(42, "Transform", "position", PropertyType::Vec3, 1);
        reg.register_property(m.clone()).unwrap();

        // Same hash, different stored identity.
        let mut clash = m.clone();
        clash.value_type = PropertyType::Quat;

        let err = reg.register_property(clash).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HashCollision);
        assert!(err.message.contains("Existing:"));
        assert!(err.message.contains("Incoming:"));
        assert!(err.message.contains("Vec3"));
        assert!(err.message.contains("Quat"));
    }

    #[test]
    fn test_validate_property_value() {
        let reg = registry();
        let m = meta(42, "Transform", "position", PropertyType::Vec3, 1);
        reg.register_property(m.clone()).unwrap();

        reg.validate_property_value(m.hash, &PropertyValue::Vec3(Default::default()))
            .unwrap();

        let err = reg
            .validate_property_value(m.hash, &PropertyValue::Int32(5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert!(err.message.contains("Vec3"));
        assert!(err.message.contains("Int32"));

        let err = reg
            .validate_property_value(Hash128::new(9, 9), &PropertyValue::Int32(5))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownProperty);
    }

    #[test]
    fn test_validate_type() {
        let reg = registry();
        let m = meta(42, "Player", "health", PropertyType::Int32, 1);
        reg.register_property(m.clone()).unwrap();

        assert!(reg.validate_type(m.hash, PropertyType::Int32));
        assert!(!reg.validate_type(m.hash, PropertyType::Int64));
        assert!(!reg.validate_type(Hash128::new(1, 2), PropertyType::Int32));
    }

    #[test]
    fn test_name_length_limits() {
        let reg = registry();

        let long = "A".repeat(MAX_NAME_LENGTH + 1);
        let err = reg
            .register_property(meta(42, &long, "position", PropertyType::Vec3, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        let err = reg
            .register_property(meta(42, "Transform", &long, PropertyType::Vec3, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        // Exactly at the limit is accepted.
        let max = "B".repeat(MAX_NAME_LENGTH);
        reg.register_property(meta(42, &max, &max, PropertyType::Vec3, 1))
            .unwrap();
    }

    #[test]
    fn test_rejects_array_tags_and_empty_names() {
        let reg = registry();

        let err = reg
            .register_property(meta(42, "Transform", "history", PropertyType::Vec3Array, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        let err = reg
            .register_property(meta(42, "", "position", PropertyType::Vec3, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_per_entity_limit() {
        let reg = registry();

        for i in 0..MAX_PROPERTIES_PER_ENTITY {
            let name = format!("prop{}", i);
            reg.register_property(meta(42, "Player", &name, PropertyType::Int32, 1))
                .unwrap();
        }

        let err = reg
            .register_property(meta(42, "Player", "overflow", PropertyType::Int32, 1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimitExceeded);

        // Another entity is unaffected by the first entity's cap.
        reg.register_property(meta(43, "Player", "prop0", PropertyType::Int32, 1))
            .unwrap();
    }

    #[test]
    fn test_unregister_entity() {
        let reg = registry();
        reg.register_property(meta(42, "Player", "health", PropertyType::Int32, 1))
            .unwrap();
        reg.register_property(meta(42, "Player", "name", PropertyType::String, 1))
            .unwrap();
        reg.register_property(meta(7, "Player", "health", PropertyType::Int32, 1))
            .unwrap();

        let removed = reg.unregister_entity(42);
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.len(), 1);
        assert!(reg.entity_properties(42).is_empty());

        // Idempotent on a missing entity.
        assert!(reg.unregister_entity(42).is_empty());
    }

    #[test]
    fn test_unregister_property_prunes_entity_index() {
        let reg = registry();
        let m = meta(42, "Player", "health", PropertyType::Int32, 1);
        reg.register_property(m.clone()).unwrap();

        assert!(reg.unregister_property(m.hash));
        assert!(!reg.unregister_property(m.hash));
        assert!(reg.entity_properties(42).is_empty());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_clear_and_snapshots() {
        let reg = registry();
        reg.register_property(meta(1, "A", "x", PropertyType::Bool, 1)).unwrap();
        reg.register_property(meta(2, "B", "y", PropertyType::Bytes, 1)).unwrap();

        assert_eq!(reg.all_properties().len(), 2);

        reg.clear();
        assert!(reg.is_empty());
        assert!(reg.all_properties().is_empty());
    }
}
