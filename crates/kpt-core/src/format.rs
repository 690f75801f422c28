//! Canonical field ordering for generated and modified resources

use serde_yaml::{Mapping, Value};

use crate::resource::Resource;

const TOP_LEVEL_ORDER: &[&str] = &["apiVersion", "kind", "metadata", "spec", "data"];
const METADATA_ORDER: &[&str] = &["name", "generateName", "namespace", "labels", "annotations"];
const CONTAINER_ORDER: &[&str] = &[
    "name",
    "image",
    "command",
    "args",
    "workingDir",
    "ports",
    "env",
    "envFrom",
    "resources",
    "volumeMounts",
];
const CONTAINER_LISTS: &[&str] = &["containers", "initContainers", "ephemeralContainers"];

/// Reorder well-known fields of a modified resource
///
/// Unmodified resources keep their bytes, so they are left alone. Returns
/// whether the resource was considered.
pub fn format_resource(resource: &mut Resource) -> bool {
    if !resource.is_modified() {
        return false;
    }
    format_value(resource.value_mut());
    true
}

/// Reorder well-known fields of a document tree
pub fn format_value(value: &mut Value) {
    if let Value::Mapping(map) = value {
        reorder(map, TOP_LEVEL_ORDER);
        if let Some(Value::Mapping(metadata)) = map.get_mut("metadata") {
            reorder(metadata, METADATA_ORDER);
        }
        walk(value);
    }
}

fn walk(value: &mut Value) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map.iter_mut() {
                if key.as_str().is_some_and(|k| CONTAINER_LISTS.contains(&k)) {
                    if let Value::Sequence(items) = child {
                        for item in items.iter_mut() {
                            if let Value::Mapping(container) = item {
                                reorder(container, CONTAINER_ORDER);
                            }
                        }
                    }
                }
                walk(child);
            }
        }
        Value::Sequence(items) => items.iter_mut().for_each(walk),
        _ => {}
    }
}

/// Move the keys named in `order` to the front, keeping the relative order
/// of everything else
fn reorder(map: &mut Mapping, order: &[&str]) {
    let already_ordered = {
        let positions: Vec<usize> = order
            .iter()
            .filter_map(|k| map.keys().position(|key| key.as_str() == Some(k)))
            .collect();
        positions.iter().enumerate().all(|(i, p)| *p == i)
    };
    if already_ordered {
        return;
    }

    let mut entries: Vec<Option<(Value, Value)>> =
        std::mem::take(map).into_iter().map(Some).collect();
    for key in order {
        let found = entries
            .iter_mut()
            .find(|e| e.as_ref().is_some_and(|(k, _)| k.as_str() == Some(key)));
        if let Some((k, v)) = found.and_then(Option::take) {
            map.insert(k, v);
        }
    }
    for (k, v) in entries.into_iter().flatten() {
        map.insert(k, v);
    }
}
