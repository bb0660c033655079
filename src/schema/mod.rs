//! # Schema validators and migrators
//!
//! Every logical store registers a [`StoreSchema`]: a structural validator for its payload and a table
//! of `from → to` migrations. The registry decides whether a stored payload can be trusted:
//!
//! - payloads restored from durable storage are migrated to the current version first and then
//!   validated, since they may predate the running build;
//! - payloads restored from backups are only validated (backups are taken by the running build);
//! - payloads received from other tabs are only validated.
//!
//! Anything that fails these checks is treated as absent, never coerced.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::durable::Envelope;

pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type Migration = Arc<dyn Fn(Value) -> Value + Send + Sync>;

#[derive(Clone)]
struct MigrationStep {
    to: String,
    apply: Migration,
}

/// Validator plus migration table for one logical store.
#[derive(Clone)]
pub struct StoreSchema {
    validator: Validator,
    migrations: HashMap<String, MigrationStep>,
}

impl fmt::Debug for StoreSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<_> = self
            .migrations
            .iter()
            .map(|(from, step)| format!("{from}->{}", step.to))
            .collect();
        steps.sort();
        f.debug_struct("StoreSchema").field("migrations", &steps).finish()
    }
}

impl StoreSchema {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
            migrations: HashMap::new(),
        }
    }

    /// Accepts exactly the payloads that deserialize into `T`.
    pub fn for_type<T>() -> Self
    where
        T: DeserializeOwned + 'static,
    {
        Self::new(|candidate| T::deserialize(candidate).is_ok())
    }

    pub fn with_migration<F>(mut self, from: impl Into<String>, to: impl Into<String>, migration: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.migrations.insert(
            from.into(),
            MigrationStep {
                to: to.into(),
                apply: Arc::new(migration),
            },
        );
        self
    }

    pub fn validate(&self, candidate: &Value) -> bool {
        (self.validator)(candidate)
    }
}

/// Lookup of [`StoreSchema`]s by logical store id, pinned to the running build's schema version.
#[derive(Clone, Debug)]
pub struct SchemaRegistry {
    current_version: String,
    schemas: HashMap<String, StoreSchema>,
}

impl SchemaRegistry {
    pub fn new(current_version: impl Into<String>) -> Self {
        Self {
            current_version: current_version.into(),
            schemas: HashMap::new(),
        }
    }

    pub fn register(&mut self, store_id: impl Into<String>, schema: StoreSchema) -> &mut Self {
        self.schemas.insert(store_id.into(), schema);
        self
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    pub fn contains(&self, store_id: &str) -> bool {
        self.schemas.contains_key(store_id)
    }

    pub fn store_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.schemas.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Structural check of `candidate` against the store's schema. Unknown store ids never validate.
    pub fn validate(&self, store_id: &str, candidate: &Value) -> bool {
        self.schemas
            .get(store_id)
            .is_some_and(|schema| schema.validate(candidate))
    }

    /// Walks the migration chain from `from_version` to the current version. Returns `None` when a
    /// step is missing or the chain loops.
    pub fn migrate(&self, store_id: &str, from_version: &str, state: Value) -> Option<Value> {
        if from_version == self.current_version {
            return Some(state);
        }

        let schema = self.schemas.get(store_id)?;
        let mut version = from_version.to_owned();
        let mut state = state;
        for _ in 0..schema.migrations.len() {
            let step = schema.migrations.get(&version)?;
            state = (step.apply)(state);
            version.clone_from(&step.to);
            if version == self.current_version {
                return Some(state);
            }
        }
        None
    }

    /// Migrates then validates a payload read from durable storage.
    pub fn restore(&self, store_id: &str, envelope: &Envelope) -> Option<Value> {
        let state = self.migrate(store_id, &envelope.version, envelope.state.clone())?;
        self.validate(store_id, &state).then_some(state)
    }

    /// Validates a payload taken from a backup snapshot. No migration is attempted.
    pub fn restore_backup(&self, store_id: &str, state: &Value) -> Option<Value> {
        self.validate(store_id, state).then(|| state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    #[allow(dead_code)]
    struct Counter {
        count: u32,
    }

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new("1.0");
        registry.register(
            "counter",
            StoreSchema::for_type::<Counter>()
                .with_migration("0.1", "0.2", |state| json!({ "count": state["n"].clone() }))
                .with_migration("0.2", "1.0", |state| state),
        );
        registry
    }

    #[test]
    fn structural_validation() {
        let registry = registry();
        assert!(registry.validate("counter", &json!({"count": 3})));
        assert!(!registry.validate("counter", &json!({"count": "three"})));
        assert!(!registry.validate("counter", &json!({})));
        assert!(!registry.validate("unknown", &json!({"count": 3})));
    }

    #[test]
    fn migration_chain_reaches_current_version() {
        let registry = registry();
        let envelope = Envelope::new(json!({"n": 4}), "0.1", 0);
        assert_eq!(registry.restore("counter", &envelope), Some(json!({"count": 4})));
    }

    #[test]
    fn migration_gap_degrades_to_absent() {
        let registry = registry();
        let envelope = Envelope::new(json!({"count": 4}), "0.0", 0);
        assert_eq!(registry.restore("counter", &envelope), None);
        assert_eq!(registry.migrate("unknown", "0.1", json!({})), None);
    }

    #[test]
    fn migrated_payload_must_still_validate() {
        let registry = registry();
        let envelope = Envelope::new(json!({"n": "not a number"}), "0.1", 0);
        assert_eq!(registry.restore("counter", &envelope), None);
    }

    #[test]
    fn looping_chain_is_rejected() {
        let mut registry = SchemaRegistry::new("1.0");
        registry.register(
            "loop",
            StoreSchema::new(|_| true)
                .with_migration("a", "b", |state| state)
                .with_migration("b", "a", |state| state),
        );
        assert_eq!(registry.migrate("loop", "a", json!({})), None);
    }

    #[test]
    fn backups_are_validated_without_migration() {
        let registry = registry();
        assert_eq!(
            registry.restore_backup("counter", &json!({"count": 1})),
            Some(json!({"count": 1}))
        );
        assert_eq!(registry.restore_backup("counter", &json!({"n": 1})), None);
    }
}
