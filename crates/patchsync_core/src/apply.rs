//! Patch interpreter.
//!
//! Executes a single [`Patch`] against an entity graph held as a
//! [`serde_json::Value`]. One match arm per [`PatchOperation`]; path walking
//! creates missing containers on the way down (an object for a key segment, a
//! list for an index segment).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PatchSyncError, Result};
use crate::patch::{Patch, PatchOperation, PathSegment, parse_field_path};

/// How far past the end of a list an index segment may reach. Slots in
/// between are padded with null.
pub const MAX_LIST_PADDING: usize = 1024;

/// What to do when a path segment meets a value of the wrong container type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathPolicy {
    /// Replace the value with the container the segment implies.
    ///
    /// An index segment on an existing object is used as a string key instead,
    /// so maps keyed by numeric ids survive.
    #[default]
    Lenient,
    /// Reject the patch with [`PatchSyncError::PathConflict`].
    Strict,
}

/// Human-readable JSON type name, used in conflict errors and logs.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Apply one patch to `root`.
///
/// On error `root` may hold containers created while walking the path, but the
/// operation itself has not been performed.
pub fn apply_patch(root: &mut Value, patch: &Patch, policy: PathPolicy) -> Result<()> {
    let path = patch.field_path.as_str();
    let segments = parse_field_path(path)?;

    match patch.operation {
        PatchOperation::Set => {
            let value = patch.value.clone().unwrap_or(Value::Null);
            let slot = descend(root, &segments, policy, path)?;
            *slot = value;
        }
        PatchOperation::InsertList => {
            let value = patch.value.clone().unwrap_or(Value::Null);
            let list = as_list(descend(root, &segments, policy, path)?, policy, path)?;
            match patch.index {
                Some(index) => list.insert(index.min(list.len()), value),
                None => list.push(value),
            }
        }
        PatchOperation::RemoveList => {
            let index = require(patch.index, patch, "index")?;
            let list = as_list(descend(root, &segments, policy, path)?, policy, path)?;
            if index < list.len() {
                list.remove(index);
            } else {
                log::debug!(
                    "[apply] REMOVE_LIST index {} out of range at '{}' (len {})",
                    index,
                    path,
                    list.len()
                );
            }
        }
        PatchOperation::MoveList => {
            let old_index = require(patch.old_index, patch, "oldIndex")?;
            let index = require(patch.index, patch, "index")?;
            let list = as_list(descend(root, &segments, policy, path)?, policy, path)?;
            if old_index < list.len() {
                let item = list.remove(old_index);
                list.insert(index.min(list.len()), item);
            } else {
                log::debug!(
                    "[apply] MOVE_LIST source {} out of range at '{}' (len {})",
                    old_index,
                    path,
                    list.len()
                );
            }
        }
        PatchOperation::InsertMap => {
            let key = require(patch.key.clone(), patch, "key")?;
            let value = patch.value.clone().unwrap_or(Value::Null);
            let map = as_map(descend(root, &segments, policy, path)?, policy, path)?;
            map.insert(key, value);
        }
        PatchOperation::RemoveMap => {
            let key = require(patch.key.as_deref(), patch, "key")?;
            let map = as_map(descend(root, &segments, policy, path)?, policy, path)?;
            map.remove(key);
        }
        PatchOperation::ClearList => {
            as_list(descend(root, &segments, policy, path)?, policy, path)?.clear();
        }
        PatchOperation::ClearMap => {
            as_map(descend(root, &segments, policy, path)?, policy, path)?.clear();
        }
    }

    Ok(())
}

fn require<T>(arg: Option<T>, patch: &Patch, argument: &'static str) -> Result<T> {
    arg.ok_or_else(|| PatchSyncError::MissingArgument {
        operation: patch.operation.to_string(),
        path: patch.field_path.clone(),
        argument,
    })
}

fn conflict(path: &str, expected: &'static str, found: &Value) -> PatchSyncError {
    PatchSyncError::PathConflict {
        path: path.to_string(),
        expected,
        found: value_kind(found),
    }
}

/// Walk `segments` from `node`, creating whatever is missing, and return the
/// slot the last segment addresses.
fn descend<'a>(
    mut node: &'a mut Value,
    segments: &[PathSegment],
    policy: PathPolicy,
    path: &str,
) -> Result<&'a mut Value> {
    for segment in segments {
        node = child_mut(node, segment, policy, path)?;
    }
    Ok(node)
}

fn child_mut<'a>(
    node: &'a mut Value,
    segment: &PathSegment,
    policy: PathPolicy,
    path: &str,
) -> Result<&'a mut Value> {
    match segment {
        PathSegment::Key(key) => {
            let map = as_map(node, policy, path)?;
            Ok(map.entry(key.clone()).or_insert(Value::Null))
        }
        PathSegment::Index(index) => match node {
            Value::Object(_) if policy == PathPolicy::Strict => {
                Err(PatchSyncError::PathConflict {
                    path: path.to_string(),
                    expected: "array",
                    found: "object",
                })
            }
            Value::Object(map) => Ok(map.entry(index.to_string()).or_insert(Value::Null)),
            _ => {
                let list = as_list(node, policy, path)?;
                if list.len() <= *index {
                    let len = index
                        .checked_add(1)
                        .filter(|len| *len - list.len() <= MAX_LIST_PADDING)
                        .ok_or_else(|| PatchSyncError::InvalidPath {
                            path: path.to_string(),
                            reason: format!(
                                "index {} is too far past the end of a list of {}",
                                index,
                                list.len()
                            ),
                        })?;
                    list.resize(len, Value::Null);
                }
                Ok(&mut list[*index])
            }
        },
    }
}

fn as_map<'a>(
    node: &'a mut Value,
    policy: PathPolicy,
    path: &str,
) -> Result<&'a mut Map<String, Value>> {
    if !node.is_object() {
        reshape(node, Value::Object(Map::new()), "object", policy, path)?;
    }
    match node {
        Value::Object(map) => Ok(map),
        other => Err(conflict(path, "object", other)),
    }
}

fn as_list<'a>(node: &'a mut Value, policy: PathPolicy, path: &str) -> Result<&'a mut Vec<Value>> {
    if !node.is_array() {
        reshape(node, Value::Array(Vec::new()), "array", policy, path)?;
    }
    match node {
        Value::Array(list) => Ok(list),
        other => Err(conflict(path, "array", other)),
    }
}

/// Replace a missing (null) or, under the lenient policy, mismatched value with
/// an empty container.
fn reshape(
    node: &mut Value,
    empty: Value,
    expected: &'static str,
    policy: PathPolicy,
    path: &str,
) -> Result<()> {
    if !node.is_null() {
        if policy == PathPolicy::Strict {
            return Err(conflict(path, expected, node));
        }
        log::debug!(
            "[apply] replacing {} with {} at '{}'",
            value_kind(node),
            expected,
            path
        );
    }
    *node = empty;
    Ok(())
}
