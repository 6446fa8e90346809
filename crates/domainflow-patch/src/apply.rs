//! Pure application of a single patch operation to a JSON document.
//!
//! The input document is never mutated: every operation clones it first and
//! returns the updated copy. Failures are per-operation — a failed op inside a
//! patch is logged and skipped, and the remaining ops are still applied.

use domainflow_types::{DifferentialPatch, DomainflowError, PatchOp, Result};
use serde_json::{Map, Value};

/// Apply one operation to `target`, returning a new document.
///
/// Path segments are dot-separated; numeric segments index into arrays.
/// Traversing through a non-container value is an error. `Set` creates
/// intermediate objects as needed; `Delete` is a no-op on absent paths.
pub fn apply_op(target: &Value, op: &PatchOp) -> Result<Value> {
    let mut doc = target.clone();
    let path = op.path();
    let segments: Vec<&str> = if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').collect()
    };

    match op {
        PatchOp::Set { value, .. } => set_at(&mut doc, path, &segments, value.clone())?,
        PatchOp::Merge { value, .. } => merge_at(&mut doc, path, &segments, value.clone())?,
        PatchOp::Delete { .. } => delete_at(&mut doc, path, &segments)?,
    }
    Ok(doc)
}

/// Apply every operation of `patch` in order, skipping (and logging) ops that
/// fail. Later ops win on conflicting paths.
pub fn apply_patch(target: &Value, patch: &DifferentialPatch) -> Value {
    let mut doc = target.clone();
    for op in &patch.changes {
        match apply_op(&doc, op) {
            Ok(next) => doc = next,
            Err(err) => {
                tracing::warn!(path = op.path(), %err, "skipping unapplicable patch op");
            }
        }
    }
    doc
}

/// Descend one segment, creating an intermediate object when the key is
/// missing. Array segments must parse as in-bounds indices.
fn descend_or_create<'a>(cur: &'a mut Value, path: &str, seg: &str) -> Result<&'a mut Value> {
    match cur {
        Value::Object(map) => Ok(map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(arr) => {
            let index: usize = seg.parse().map_err(|_| DomainflowError::PatchPath {
                path: path.to_string(),
                segment: seg.to_string(),
            })?;
            arr.get_mut(index).ok_or(DomainflowError::PatchIndex {
                path: path.to_string(),
                index,
            })
        }
        _ => Err(DomainflowError::PatchPath {
            path: path.to_string(),
            segment: seg.to_string(),
        }),
    }
}

/// Descend one segment without creating anything. `Ok(None)` means the path
/// is absent; an error means traversal hit a non-container.
fn descend<'a>(cur: &'a mut Value, path: &str, seg: &str) -> Result<Option<&'a mut Value>> {
    match cur {
        Value::Object(map) => Ok(map.get_mut(seg)),
        Value::Array(arr) => match seg.parse::<usize>() {
            Ok(index) => Ok(arr.get_mut(index)),
            Err(_) => Ok(None),
        },
        _ => Err(DomainflowError::PatchPath {
            path: path.to_string(),
            segment: seg.to_string(),
        }),
    }
}

fn set_at(doc: &mut Value, path: &str, segments: &[&str], value: Value) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        *doc = value;
        return Ok(());
    };
    let mut cur = doc;
    for seg in parents {
        cur = descend_or_create(cur, path, seg)?;
    }
    match cur {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(arr) => {
            let index: usize = last.parse().map_err(|_| DomainflowError::PatchPath {
                path: path.to_string(),
                segment: last.to_string(),
            })?;
            if index < arr.len() {
                arr[index] = value;
                Ok(())
            } else if index == arr.len() {
                arr.push(value);
                Ok(())
            } else {
                Err(DomainflowError::PatchIndex {
                    path: path.to_string(),
                    index,
                })
            }
        }
        _ => Err(DomainflowError::PatchPath {
            path: path.to_string(),
            segment: last.to_string(),
        }),
    }
}

fn merge_at(doc: &mut Value, path: &str, segments: &[&str], value: Value) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        shallow_merge(doc, value);
        return Ok(());
    };
    let mut cur = doc;
    for seg in parents {
        cur = descend_or_create(cur, path, seg)?;
    }
    match cur {
        Value::Object(map) => {
            match map.get_mut(*last) {
                Some(existing) if existing.is_object() && value.is_object() => {
                    shallow_merge(existing, value);
                }
                _ => {
                    map.insert(last.to_string(), value);
                }
            }
            Ok(())
        }
        Value::Array(_) => {
            // Merging into an array slot degrades to a set of that slot.
            set_at_slot_in_array(cur, path, last, value)
        }
        _ => Err(DomainflowError::PatchPath {
            path: path.to_string(),
            segment: last.to_string(),
        }),
    }
}

fn set_at_slot_in_array(cur: &mut Value, path: &str, last: &str, value: Value) -> Result<()> {
    let Value::Array(arr) = cur else {
        unreachable!("caller checked for array");
    };
    let index: usize = last.parse().map_err(|_| DomainflowError::PatchPath {
        path: path.to_string(),
        segment: last.to_string(),
    })?;
    if index >= arr.len() {
        return Err(DomainflowError::PatchIndex {
            path: path.to_string(),
            index,
        });
    }
    match (&mut arr[index], &value) {
        (existing @ Value::Object(_), Value::Object(_)) => shallow_merge(existing, value),
        (slot, _) => *slot = value,
    }
    Ok(())
}

/// Shallow merge: top-level keys of `incoming` overwrite keys of `existing`.
fn shallow_merge(existing: &mut Value, incoming: Value) {
    match (existing, incoming) {
        (Value::Object(dst), Value::Object(src)) => {
            for (k, v) in src {
                dst.insert(k, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

fn delete_at(doc: &mut Value, path: &str, segments: &[&str]) -> Result<()> {
    let Some((last, parents)) = segments.split_last() else {
        return Ok(());
    };
    let mut cur = doc;
    for seg in parents {
        match descend(cur, path, seg)? {
            Some(next) => cur = next,
            None => return Ok(()),
        }
    }
    match cur {
        Value::Object(map) => {
            map.remove(*last);
            Ok(())
        }
        Value::Array(arr) => {
            if let Ok(index) = last.parse::<usize>() {
                if index < arr.len() {
                    arr.remove(index);
                }
            }
            Ok(())
        }
        _ => Err(DomainflowError::PatchPath {
            path: path.to_string(),
            segment: last.to_string(),
        }),
    }
}
