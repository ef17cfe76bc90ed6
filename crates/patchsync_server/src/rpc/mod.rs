//! Entity types and the request/response methods that mutate them.
//!
//! A method runs against the authoritative state of one entity. Methods marked
//! patch-producing return patches, which the room numbers, applies and returns
//! to the caller; broadcast methods also fan the batch out to every observer.

pub mod board;

use std::collections::HashMap;
use std::sync::Arc;

use patchsync_core::{ConflictStrategy, EntityKey, Patch};
use serde_json::{Map, Value};

use crate::error::ApiError;

/// What a method sees when it runs.
pub struct MethodContext<'a> {
    pub key: &'a EntityKey,
    pub state: &'a Value,
    pub args: &'a Value,
    pub user_id: Option<&'a str>,
}

impl MethodContext<'_> {
    /// Required argument, deserialized.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, ApiError> {
        let raw = self
            .args
            .get(name)
            .ok_or_else(|| ApiError::InvalidArguments(format!("missing '{}'", name)))?;
        serde_json::from_value(raw.clone())
            .map_err(|e| ApiError::InvalidArguments(format!("'{}': {}", name, e)))
    }
}

/// A method's result value and the patches it wants applied.
#[derive(Debug, Default)]
pub struct MethodOutcome {
    pub result: Value,
    pub patches: Vec<Patch>,
}

impl MethodOutcome {
    pub fn patches(patches: Vec<Patch>) -> Self {
        Self {
            result: Value::Null,
            patches,
        }
    }

    pub fn value(result: Value) -> Self {
        Self {
            result,
            patches: Vec::new(),
        }
    }
}

pub type MethodHandler =
    Arc<dyn Fn(&MethodContext<'_>) -> Result<MethodOutcome, ApiError> + Send + Sync>;

/// A registered method and how its patches travel.
#[derive(Clone)]
pub struct MethodSpec {
    pub patch_producing: bool,
    pub broadcast: bool,
    pub handler: MethodHandler,
}

impl MethodSpec {
    /// Read-only method; any patches it returns are ignored.
    pub fn query(handler: MethodHandler) -> Self {
        Self {
            patch_producing: false,
            broadcast: false,
            handler,
        }
    }

    /// Method whose patches are applied and returned to the caller only.
    pub fn patching(handler: MethodHandler) -> Self {
        Self {
            patch_producing: true,
            broadcast: false,
            handler,
        }
    }

    /// Also send the patches to every observer of the entity.
    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }
}

impl std::fmt::Debug for MethodSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodSpec")
            .field("patch_producing", &self.patch_producing)
            .field("broadcast", &self.broadcast)
            .finish_non_exhaustive()
    }
}

/// Methods keyed by `(entity type, method name)`.
#[derive(Debug, Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<(String, String), MethodSpec>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: &str, method: &str, spec: MethodSpec) -> &mut Self {
        self.methods
            .insert((entity_type.to_string(), method.to_string()), spec);
        self
    }

    pub fn get(&self, entity_type: &str, method: &str) -> Result<&MethodSpec, ApiError> {
        self.methods
            .get(&(entity_type.to_string(), method.to_string()))
            .ok_or_else(|| ApiError::UnknownMethod {
                entity_type: entity_type.to_string(),
                method: method.to_string(),
            })
    }

    /// Method names for one entity type, sorted.
    pub fn methods_for(&self, entity_type: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .methods
            .keys()
            .filter(|(t, _)| t == entity_type)
            .map(|(_, m)| m.clone())
            .collect();
        names.sort();
        names
    }
}

/// How entities of one type are seeded and ordered.
#[derive(Debug, Clone)]
pub struct EntityTypeSpec {
    pub strategy: ConflictStrategy,
    pub initial_state: Value,
}

impl Default for EntityTypeSpec {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            initial_state: Value::Object(Map::new()),
        }
    }
}

/// Entity types the server hosts. Rooms for any other type are refused.
#[derive(Debug, Default, Clone)]
pub struct EntityTypeRegistry {
    types: HashMap<String, EntityTypeSpec>,
}

impl EntityTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity_type: &str, spec: EntityTypeSpec) -> &mut Self {
        self.types.insert(entity_type.to_string(), spec);
        self
    }

    pub fn get(&self, entity_type: &str) -> Result<&EntityTypeSpec, ApiError> {
        self.types
            .get(entity_type)
            .ok_or_else(|| ApiError::UnknownEntityType(entity_type.to_string()))
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Registries with the bundled entity types installed.
pub fn default_registries() -> (EntityTypeRegistry, MethodRegistry) {
    let mut types = EntityTypeRegistry::new();
    let mut methods = MethodRegistry::new();
    board::register(&mut types, &mut methods);
    (types, methods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_errors() {
        let (types, methods) = default_registries();
        assert!(types.get("board").is_ok());
        assert!(matches!(
            types.get("chess"),
            Err(ApiError::UnknownEntityType(_))
        ));
        assert!(matches!(
            methods.get("board", "teleport"),
            Err(ApiError::UnknownMethod { .. })
        ));
        assert_eq!(
            methods.methods_for("board"),
            vec!["advance_turn", "get_board", "place_token"]
        );
    }

    #[test]
    fn test_context_arg() {
        let key = EntityKey::new("board", "g1");
        let state = json!({});
        let args = json!({"column": 3, "player": 7});
        let ctx = MethodContext {
            key: &key,
            state: &state,
            args: &args,
            user_id: None,
        };
        assert_eq!(ctx.arg::<usize>("column").unwrap(), 3);
        assert!(matches!(
            ctx.arg::<String>("player"),
            Err(ApiError::InvalidArguments(_))
        ));
        assert!(matches!(
            ctx.arg::<String>("nope"),
            Err(ApiError::InvalidArguments(_))
        ));
    }
}
