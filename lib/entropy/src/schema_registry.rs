//! Content-addressed catalogue of component schemas.
//!
//! Shared-read/exclusive-write locking; publish and unpublish callbacks are
//! invoked outside the write lock so callback-holders may re-enter the
//! registry without deadlocking.

use crate::error::{Error, ErrorKind, NetResult};
use crate::hash::ComponentTypeHash;
use crate::schema::ComponentSchema;
use enthalpy::logging::{self, Logger};
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::sync::{Arc, Mutex, RwLock};

pub type SchemaPublishedCallback = Arc<dyn Fn(ComponentTypeHash, &ComponentSchema) + Send + Sync>;
pub type SchemaUnpublishedCallback = Arc<dyn Fn(ComponentTypeHash) + Send + Sync>;

#[derive(Default)]
struct Tables {
    schemas: HashMap<ComponentTypeHash, ComponentSchema>,
    structural: HashMap<crate::hash::PropertyHash, Vec<ComponentTypeHash>>,
    public: IndexSet<ComponentTypeHash>,
}

/// Thread-safe schema registry with structural and nominal indexing and
/// publish/unpublish lifecycle events.
pub struct ComponentSchemaRegistry {
    tables: RwLock<Tables>,
    published_cb: Mutex<Option<SchemaPublishedCallback>>,
    unpublished_cb: Mutex<Option<SchemaUnpublishedCallback>>,
    log: Logger,
}

impl ComponentSchemaRegistry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> ComponentSchemaRegistry {
        ComponentSchemaRegistry {
            tables: RwLock::new(Tables::default()),
            published_cb: Mutex::new(None),
            unpublished_cb: Mutex::new(None),
            log: logging::child(log),
        }
    }

    /// Registers a schema, returning its type hash.
    ///
    /// Registering identical content again is idempotent. A different schema
    /// under an already-registered type hash is `SchemaAlreadyExists`.
    pub fn register_schema(&self, schema: ComponentSchema) -> NetResult<ComponentTypeHash> {
        if schema.type_hash.is_null() {
            return Err(Error::invalid_parameter("Schema type hash is null"));
        }

        if schema.structural_hash.is_null() {
            return Err(Error::invalid_parameter("Schema structural hash is null"));
        }

        let mut tables = self.tables.write().unwrap();

        if let Some(existing) = tables.schemas.get(&schema.type_hash) {
            if existing.structural_hash == schema.structural_hash
                && existing.app_id == schema.app_id
                && existing.component_name == schema.component_name
                && existing.schema_version == schema.schema_version
            {
                logging::debug!(self.log, "schema already registered";
                                "app_id" => &schema.app_id,
                                "component" => &schema.component_name,
                                "version" => schema.schema_version);
                return Ok(schema.type_hash);
            }

            return Err(Error::new(
                ErrorKind::SchemaAlreadyExists,
                format!(
                    "Schema conflict: type hash {} already registered with different content",
                    schema.type_hash
                ),
            ));
        }

        logging::info!(self.log, "schema registered";
                       "app_id" => &schema.app_id,
                       "component" => &schema.component_name,
                       "version" => schema.schema_version,
                       "public" => schema.is_public,
                       "properties" => schema.properties.len());

        let type_hash = schema.type_hash;
        tables
            .structural
            .entry(schema.structural_hash)
            .or_default()
            .push(type_hash);
        if schema.is_public {
            tables.public.insert(type_hash);
        }
        tables.schemas.insert(type_hash, schema);

        Ok(type_hash)
    }

    pub fn get_schema(&self, type_hash: ComponentTypeHash) -> Option<ComponentSchema> {
        self.tables.read().unwrap().schemas.get(&type_hash).cloned()
    }

    /// Snapshot of every schema currently in the public set.
    pub fn public_schemas(&self) -> Vec<ComponentSchema> {
        let tables = self.tables.read().unwrap();
        tables
            .public
            .iter()
            .filter_map(|hash| tables.schemas.get(hash).cloned())
            .collect()
    }

    /// All *other* public type hashes sharing this schema's structural hash.
    pub fn find_compatible_schemas(&self, type_hash: ComponentTypeHash) -> Vec<ComponentTypeHash> {
        let tables = self.tables.read().unwrap();

        let schema = match tables.schemas.get(&type_hash) {
            Some(schema) => schema,
            None => return Vec::new(),
        };

        match tables.structural.get(&schema.structural_hash) {
            Some(candidates) => candidates
                .iter()
                .filter(|&&candidate| candidate != type_hash && tables.public.contains(&candidate))
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }

    /// True iff both schemas exist and share a structural hash.
    pub fn are_compatible(&self, a: ComponentTypeHash, b: ComponentTypeHash) -> bool {
        let tables = self.tables.read().unwrap();
        match (tables.schemas.get(&a), tables.schemas.get(&b)) {
            (Some(a), Some(b)) => a.is_structurally_compatible(b),
            _ => false,
        }
    }

    /// Per-field check that `target` can read data written with `source`.
    pub fn validate_detailed_compatibility(
        &self,
        source: ComponentTypeHash,
        target: ComponentTypeHash,
    ) -> NetResult<()> {
        let tables = self.tables.read().unwrap();

        let source_schema = tables
            .schemas
            .get(&source)
            .ok_or_else(|| Error::new(ErrorKind::SchemaNotFound, format!("Source schema {} not found", source)))?;

        let target_schema = tables
            .schemas
            .get(&target)
            .ok_or_else(|| Error::new(ErrorKind::SchemaNotFound, format!("Target schema {} not found", target)))?;

        target_schema.can_read_from(source_schema)
    }

    pub fn is_registered(&self, type_hash: ComponentTypeHash) -> bool {
        self.tables.read().unwrap().schemas.contains_key(&type_hash)
    }

    pub fn is_public(&self, type_hash: ComponentTypeHash) -> bool {
        self.tables.read().unwrap().public.contains(&type_hash)
    }

    /// Adds the schema to the public set. Idempotent; the published callback
    /// fires only on a true private-to-public transition, outside the lock.
    pub fn publish_schema(&self, type_hash: ComponentTypeHash) -> NetResult<()> {
        let (callback, schema) = {
            let mut tables = self.tables.write().unwrap();

            if !tables.schemas.contains_key(&type_hash) {
                return Err(Error::new(
                    ErrorKind::SchemaNotFound,
                    format!("Schema {} not found", type_hash),
                ));
            }

            if !tables.public.insert(type_hash) {
                return Ok(());
            }

            let schema = tables.schemas.get_mut(&type_hash).unwrap();
            schema.is_public = true;

            logging::info!(self.log, "schema published";
                           "app_id" => &schema.app_id,
                           "component" => &schema.component_name,
                           "version" => schema.schema_version);

            (self.published_cb.lock().unwrap().clone(), schema.clone())
        };

        if let Some(callback) = callback {
            callback(type_hash, &schema);
        }

        Ok(())
    }

    /// Removes the schema from the public set. Idempotent; the unpublished
    /// callback fires only on a true public-to-private transition, outside
    /// the lock.
    pub fn unpublish_schema(&self, type_hash: ComponentTypeHash) -> NetResult<()> {
        let callback = {
            let mut tables = self.tables.write().unwrap();

            if !tables.schemas.contains_key(&type_hash) {
                return Err(Error::new(
                    ErrorKind::SchemaNotFound,
                    format!("Schema {} not found", type_hash),
                ));
            }

            if !tables.public.shift_remove(&type_hash) {
                return Ok(());
            }

            let schema = tables.schemas.get_mut(&type_hash).unwrap();
            schema.is_public = false;

            logging::info!(self.log, "schema unpublished";
                           "app_id" => &schema.app_id,
                           "component" => &schema.component_name,
                           "version" => schema.schema_version);

            self.unpublished_cb.lock().unwrap().clone()
        };

        if let Some(callback) = callback {
            callback(type_hash);
        }

        Ok(())
    }

    pub fn schema_count(&self) -> usize {
        self.tables.read().unwrap().schemas.len()
    }

    pub fn public_schema_count(&self) -> usize {
        self.tables.read().unwrap().public.len()
    }

    /// Consistent snapshot of (total count, public count, public schemas)
    /// under one shared lock.
    pub fn stats(&self) -> (usize, usize, Vec<ComponentSchema>) {
        let tables = self.tables.read().unwrap();
        let public = tables
            .public
            .iter()
            .filter_map(|hash| tables.schemas.get(hash).cloned())
            .collect();
        (tables.schemas.len(), tables.public.len(), public)
    }

    /// Installs the published callback. Install before concurrent publishing
    /// begins; installation is not synchronized against in-flight publishes.
    pub fn set_schema_published_callback(&self, callback: SchemaPublishedCallback) {
        *self.published_cb.lock().unwrap() = Some(callback);
    }

    pub fn set_schema_unpublished_callback(&self, callback: SchemaUnpublishedCallback) {
        *self.unpublished_cb.lock().unwrap() = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::PropertyType;
    use crate::schema::PropertyDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_schema(app_id: &str, name: &str, version: u32, public: bool) -> ComponentSchema {
        ComponentSchema::create(
            app_id,
            name,
            version,
            vec![
                PropertyDefinition::new("position", PropertyType::Vec3, 0, 12),
                PropertyDefinition::new("rotation", PropertyType::Quat, 12, 16),
            ],
            28,
            public,
        )
        .unwrap()
    }

    fn registry() -> ComponentSchemaRegistry {
        ComponentSchemaRegistry::new(None)
    }

    #[test]
    fn test_register_and_lookup() {
        let reg = registry();
        let schema = test_schema("App", "Transform", 1, false);

        let hash = reg.register_schema(schema.clone()).unwrap();
        assert_eq!(hash, schema.type_hash);
        assert!(reg.is_registered(hash));
        assert_eq!(reg.schema_count(), 1);

        let found = reg.get_schema(hash).unwrap();
        assert_eq!(found.component_name, "Transform");
    }

    #[test]
    fn test_register_is_idempotent_for_identical_content() {
        let reg = registry();
        let schema = test_schema("App", "Transform", 1, false);

        reg.register_schema(schema.clone()).unwrap();
        reg.register_schema(schema).unwrap();
        assert_eq!(reg.schema_count(), 1);
    }

    #[test]
    fn test_register_rejects_null_hashes() {
        let reg = registry();
        let mut schema = test_schema("App", "Transform", 1, false);
        schema.type_hash = ComponentTypeHash::NULL;

        let err = reg.register_schema(schema).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        let mut schema = test_schema("App", "Transform", 1, false);
        schema.structural_hash = crate::hash::Hash128::NULL;
        let err = reg.register_schema(schema).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_register_conflict_on_same_hash_different_content() {
        let reg = registry();
        let schema = test_schema("App", "Transform", 1, false);
        reg.register_schema(schema.clone()).unwrap();

        // Forge a different schema claiming the same type hash.
        let mut forged = test_schema("App", "Transform", 2, false);
        forged.type_hash = schema.type_hash;

        let err = reg.register_schema(forged).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaAlreadyExists);
    }

    #[test]
    fn test_structural_compatibility_queries() {
        let reg = registry();
        let a = test_schema("AppA", "Alpha", 1, false);
        let b = test_schema("AppB", "Beta", 1, false);
        reg.register_schema(a.clone()).unwrap();
        reg.register_schema(b.clone()).unwrap();

        assert!(reg.are_compatible(a.type_hash, b.type_hash));
        assert!(!reg.are_compatible(a.type_hash, ComponentTypeHash::new(1, 2)));

        // Compatible peers are only reported while public.
        assert!(reg.find_compatible_schemas(a.type_hash).is_empty());

        reg.publish_schema(b.type_hash).unwrap();
        assert_eq!(reg.find_compatible_schemas(a.type_hash), vec![b.type_hash]);

        // Never reports the queried schema itself.
        reg.publish_schema(a.type_hash).unwrap();
        assert_eq!(reg.find_compatible_schemas(a.type_hash), vec![b.type_hash]);
    }

    #[test]
    fn test_validate_detailed_compatibility() {
        let reg = registry();
        let a = test_schema("AppA", "Alpha", 1, false);
        let b = test_schema("AppB", "Beta", 1, false);
        reg.register_schema(a.clone()).unwrap();
        reg.register_schema(b.clone()).unwrap();

        reg.validate_detailed_compatibility(a.type_hash, b.type_hash).unwrap();

        let err = reg
            .validate_detailed_compatibility(ComponentTypeHash::new(5, 5), b.type_hash)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaNotFound);
    }

    #[test]
    fn test_publish_unpublish_round_trip() {
        let reg = registry();
        let schema = test_schema("App", "Transform", 1, false);
        reg.register_schema(schema.clone()).unwrap();

        assert!(!reg.is_public(schema.type_hash));
        assert_eq!(reg.public_schema_count(), 0);

        reg.publish_schema(schema.type_hash).unwrap();
        assert!(reg.is_public(schema.type_hash));
        assert_eq!(reg.public_schema_count(), 1);
        assert!(reg.get_schema(schema.type_hash).unwrap().is_public);

        reg.unpublish_schema(schema.type_hash).unwrap();
        assert!(!reg.is_public(schema.type_hash));
        assert_eq!(reg.public_schema_count(), 0);
        assert!(!reg.get_schema(schema.type_hash).unwrap().is_public);
    }

    #[test]
    fn test_publish_unknown_schema_fails() {
        let reg = registry();
        let err = reg.publish_schema(ComponentTypeHash::new(1, 2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaNotFound);

        let err = reg.unpublish_schema(ComponentTypeHash::new(1, 2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaNotFound);
    }

    #[test]
    fn test_callbacks_fire_once_per_true_transition() {
        let reg = registry();
        let published = Arc::new(AtomicUsize::new(0));
        let unpublished = Arc::new(AtomicUsize::new(0));

        let p = published.clone();
        reg.set_schema_published_callback(Arc::new(move |_, _: &ComponentSchema| {
            p.fetch_add(1, Ordering::SeqCst);
        }));
        let u = unpublished.clone();
        reg.set_schema_unpublished_callback(Arc::new(move |_| {
            u.fetch_add(1, Ordering::SeqCst);
        }));

        let schema = test_schema("App", "CallbackTest", 1, false);
        reg.register_schema(schema.clone()).unwrap();

        reg.publish_schema(schema.type_hash).unwrap();
        reg.publish_schema(schema.type_hash).unwrap();
        assert_eq!(published.load(Ordering::SeqCst), 1);

        reg.unpublish_schema(schema.type_hash).unwrap();
        reg.unpublish_schema(schema.type_hash).unwrap();
        assert_eq!(unpublished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_reenter_registry() {
        let reg = Arc::new(registry());
        let seen = Arc::new(AtomicUsize::new(0));

        let reg2 = reg.clone();
        let seen2 = seen.clone();
        reg.set_schema_published_callback(Arc::new(move |hash, _: &ComponentSchema| {
            // Runs outside the write lock, so reads must not deadlock.
            assert!(reg2.is_public(hash));
            seen2.fetch_add(1, Ordering::SeqCst);
        }));

        let schema = test_schema("App", "Reentrant", 1, false);
        reg.register_schema(schema.clone()).unwrap();
        reg.publish_schema(schema.type_hash).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_public_schema_enters_public_set() {
        let reg = registry();
        let schema = test_schema("App", "Transform", 1, true);
        reg.register_schema(schema.clone()).unwrap();

        assert!(reg.is_public(schema.type_hash));
        assert_eq!(reg.public_schemas().len(), 1);
    }

    #[test]
    fn test_stats_snapshot() {
        let reg = registry();
        reg.register_schema(test_schema("App", "A", 1, true)).unwrap();
        reg.register_schema(test_schema("App", "B", 1, false)).unwrap();

        let (total, public, public_schemas) = reg.stats();
        assert_eq!(total, 2);
        assert_eq!(public, 1);
        assert_eq!(public_schemas.len(), 1);
        assert_eq!(public_schemas[0].component_name, "A");
    }
}
