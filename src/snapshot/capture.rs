// Capture and resolution of snapshot content.
//
// Full content is a deep copy. Incremental content keeps only items whose
// checksum differs from the base. Differential content keeps field-level
// JSON diffs against a reference. Resolution applies content on top of the
// resolved base to get back the exact item list.

use super::types::{DependencySummary, FieldDiff, ItemFieldDiff, SnapshotContent};
use crate::core::{OperationItem, Result, TxError, item_checksum};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

pub(crate) fn item_checksums(items: &[OperationItem]) -> Result<BTreeMap<String, u64>> {
    let mut checksums = BTreeMap::new();
    for item in items {
        if checksums
            .insert(item.id.clone(), item_checksum(item)?)
            .is_some()
        {
            return Err(TxError::Validation(format!(
                "duplicate item id '{}' in snapshot capture",
                item.id
            )));
        }
    }
    Ok(checksums)
}

pub(crate) fn summarize_dependencies(items: &[OperationItem]) -> DependencySummary {
    let ids: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
    let mut summary = DependencySummary::default();
    let mut external = HashSet::new();
    for item in items {
        if item.dependencies.is_empty() {
            continue;
        }
        summary
            .edges
            .insert(item.id.clone(), item.dependencies.clone());
        for dependency in &item.dependencies {
            if !ids.contains(dependency.as_str()) && external.insert(dependency.clone()) {
                summary.external.push(dependency.clone());
            }
        }
    }
    summary.external.sort();
    summary
}

pub(crate) fn full_content(items: &[OperationItem]) -> SnapshotContent {
    SnapshotContent::Full {
        items: items.to_vec(),
    }
}

pub(crate) fn incremental_content(
    base_checksums: &BTreeMap<String, u64>,
    items: &[OperationItem],
    checksums: &BTreeMap<String, u64>,
) -> SnapshotContent {
    let mut added = Vec::new();
    let mut modified = Vec::new();
    for item in items {
        match base_checksums.get(&item.id) {
            None => added.push(item.clone()),
            Some(previous) if checksums.get(&item.id) != Some(previous) => {
                modified.push(item.clone())
            }
            Some(_) => {}
        }
    }
    let removed = base_checksums
        .keys()
        .filter(|id| !checksums.contains_key(*id))
        .cloned()
        .collect();

    SnapshotContent::Incremental {
        order: items.iter().map(|item| item.id.clone()).collect(),
        added,
        modified,
        removed,
    }
}

pub(crate) fn differential_content(
    reference: &[OperationItem],
    items: &[OperationItem],
) -> Result<SnapshotContent> {
    let reference_by_id: HashMap<&str, &OperationItem> = reference
        .iter()
        .map(|item| (item.id.as_str(), item))
        .collect();
    let current_ids: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();

    let mut added = Vec::new();
    let mut diffs = Vec::new();
    for item in items {
        let Some(previous) = reference_by_id.get(item.id.as_str()) else {
            added.push(item.clone());
            continue;
        };
        let before = to_json(previous)?;
        let after = to_json(item)?;
        let mut changes = Vec::new();
        diff_values(&mut Vec::new(), Some(&before), Some(&after), &mut changes);
        if !changes.is_empty() {
            diffs.push(ItemFieldDiff {
                item_id: item.id.clone(),
                changes,
            });
        }
    }
    let removed = reference
        .iter()
        .filter(|item| !current_ids.contains(item.id.as_str()))
        .map(|item| item.id.clone())
        .collect();

    Ok(SnapshotContent::Differential {
        order: items.iter().map(|item| item.id.clone()).collect(),
        added,
        removed,
        diffs,
    })
}

/// Rebuilds the item list described by `content`.
///
/// `base` is the resolved state of the base snapshot and is required for
/// incremental and differential content.
pub(crate) fn resolve_content(
    content: &SnapshotContent,
    base: Option<Vec<OperationItem>>,
) -> Result<Vec<OperationItem>> {
    match content {
        SnapshotContent::Full { items } => Ok(items.clone()),
        SnapshotContent::Incremental {
            order,
            added,
            modified,
            removed,
        } => {
            let mut by_id = base_map(base)?;
            for id in removed {
                by_id.remove(id);
            }
            for item in added.iter().chain(modified.iter()) {
                by_id.insert(item.id.clone(), item.clone());
            }
            collect_in_order(order, by_id)
        }
        SnapshotContent::Differential {
            order,
            added,
            removed,
            diffs,
        } => {
            let mut by_id = base_map(base)?;
            for id in removed {
                by_id.remove(id);
            }
            for diff in diffs {
                let item = by_id.get(&diff.item_id).ok_or_else(|| {
                    TxError::Validation(format!(
                        "differential diff references unknown item '{}'",
                        diff.item_id
                    ))
                })?;
                let mut value = to_json(item)?;
                for change in &diff.changes {
                    apply_field_diff(&mut value, change)?;
                }
                let patched: OperationItem = serde_json::from_value(value).map_err(|err| {
                    TxError::Serialization(format!("rebuild item '{}': {}", diff.item_id, err))
                })?;
                by_id.insert(diff.item_id.clone(), patched);
            }
            for item in added {
                by_id.insert(item.id.clone(), item.clone());
            }
            collect_in_order(order, by_id)
        }
    }
}

fn base_map(base: Option<Vec<OperationItem>>) -> Result<HashMap<String, OperationItem>> {
    let base = base.ok_or_else(|| {
        TxError::Validation("derived snapshot content requires a resolved base".to_string())
    })?;
    Ok(base.into_iter().map(|item| (item.id.clone(), item)).collect())
}

fn collect_in_order(
    order: &[String],
    mut by_id: HashMap<String, OperationItem>,
) -> Result<Vec<OperationItem>> {
    order
        .iter()
        .map(|id| {
            by_id.remove(id).ok_or_else(|| {
                TxError::Validation(format!("snapshot chain is missing item '{}'", id))
            })
        })
        .collect()
}

fn to_json(item: &OperationItem) -> Result<Value> {
    serde_json::to_value(item)
        .map_err(|err| TxError::Serialization(format!("encode item '{}': {}", item.id, err)))
}

fn diff_values(
    path: &mut Vec<String>,
    before: Option<&Value>,
    after: Option<&Value>,
    out: &mut Vec<FieldDiff>,
) {
    match (before, after) {
        (Some(Value::Object(left)), Some(Value::Object(right))) => {
            let mut keys: Vec<&String> = left.keys().chain(right.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                path.push(key.clone());
                diff_values(path, left.get(key), right.get(key), out);
                path.pop();
            }
        }
        (left, right) if left != right => out.push(FieldDiff {
            path: path.clone(),
            before: left.cloned(),
            after: right.cloned(),
        }),
        _ => {}
    }
}

fn apply_field_diff(root: &mut Value, diff: &FieldDiff) -> Result<()> {
    let Some((last, parents)) = diff.path.split_last() else {
        if let Some(after) = &diff.after {
            *root = after.clone();
        }
        return Ok(());
    };

    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .map(|map| map.entry(segment.clone()).or_insert(Value::Null))
            .ok_or_else(|| TxError::Validation(format!("cannot descend into '{}'", segment)))?;
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        match &diff.after {
            Some(after) => {
                map.insert(last.clone(), after.clone());
            }
            None => {
                map.remove(last);
            }
        }
    }
    Ok(())
}
