//! Three-way merge of resource lists
//!
//! Reconciles the `original` upstream revision, the `local` copy and the
//! `updated` upstream revision. Resources are matched by
//! `(group, kind, namespace, name)`; fields are merged recursively, with
//! associative lists merged element by element. Double modifications take
//! the updated value and are reported as [`Conflict`]s.

use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fmt;

use crate::comments::CommentMap;
use crate::resource::{FieldPath, Resource, ResourceId, associative_key, scalar_string};

/// What a conflict is about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictSubject {
    Resource(ResourceId),
    /// Non-resource file, by package-relative path
    File(String),
}

impl fmt::Display for ConflictSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictSubject::Resource(id) => write!(f, "{}", id),
            ConflictSubject::File(path) => write!(f, "file {}", path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Both sides changed the value differently; the updated value won
    BothModified,
    /// Removed locally but changed upstream; the removal was kept
    DeletedLocally,
    /// Removed upstream but changed locally; the local copy was kept
    DeletedUpstream,
    /// Plain file changed on both sides; the local copy was kept
    FileModified,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictKind::BothModified => "modified locally and upstream, took upstream",
            ConflictKind::DeletedLocally => "deleted locally but modified upstream, kept deletion",
            ConflictKind::DeletedUpstream => "deleted upstream but modified locally, kept local",
            ConflictKind::FileModified => "modified locally and upstream, kept local",
        };
        f.write_str(s)
    }
}

/// A field both sides changed
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub subject: ConflictSubject,
    /// Field inside the resource (root for whole resources and files)
    pub field: FieldPath,
    pub kind: ConflictKind,
    pub local: Option<Value>,
    pub updated: Option<Value>,
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_root() {
            write!(f, "{}: {}", self.subject, self.kind)
        } else {
            write!(f, "{} {}: {}", self.subject, self.field, self.kind)
        }
    }
}

/// Merged resources and the conflicts met on the way
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub resources: Vec<Resource>,
    pub conflicts: Vec<Conflict>,
}

type Key = (ResourceId, usize);

/// Index resources by identity; duplicates get increasing ordinals
fn keyed(resources: &[Resource]) -> IndexMap<Key, &Resource> {
    let mut seen: HashMap<ResourceId, usize> = HashMap::new();
    let mut out = IndexMap::new();
    for resource in resources {
        let id = resource.id();
        let ordinal = seen.entry(id.clone()).or_insert(0);
        out.insert((id, *ordinal), resource);
        *ordinal += 1;
    }
    out
}

/// Value without engine annotations, for comparisons
fn content(resource: &Resource) -> Value {
    let mut copy = resource.clone();
    copy.strip_internal_annotations();
    copy.into_value()
}

/// Merge three versions of a resource list
pub fn three_way_merge(
    original: &[Resource],
    local: &[Resource],
    updated: &[Resource],
) -> MergeResult {
    let original = keyed(original);
    let local = keyed(local);
    let updated = keyed(updated);

    let mut result = MergeResult::default();

    for (key, l) in &local {
        let o = original.get(key).copied();
        let u = updated.get(key).copied();
        match (o, u) {
            (Some(o), Some(u)) => {
                let (lc, oc, uc) = (content(l), content(o), content(u));
                if lc == oc {
                    result.resources.push(u.clone());
                } else if uc == oc || uc == lc {
                    result.resources.push((*l).clone());
                } else {
                    let merged = merge_resource(&key.0, Some(o), l, u, &mut result.conflicts);
                    result.resources.push(merged);
                }
            }
            (Some(o), None) => {
                if content(l) != content(o) {
                    result.conflicts.push(Conflict {
                        subject: ConflictSubject::Resource(key.0.clone()),
                        field: FieldPath::root(),
                        kind: ConflictKind::DeletedUpstream,
                        local: Some(content(l)),
                        updated: None,
                    });
                    result.resources.push((*l).clone());
                }
            }
            (None, Some(u)) => {
                if content(l) == content(u) {
                    result.resources.push((*l).clone());
                } else {
                    let merged = merge_resource(&key.0, None, l, u, &mut result.conflicts);
                    result.resources.push(merged);
                }
            }
            (None, None) => result.resources.push((*l).clone()),
        }
    }

    // upstream additions; resources deleted locally stay deleted
    for (key, u) in &updated {
        if !local.contains_key(key) && !original.contains_key(key) {
            result.resources.push((*u).clone());
        }
    }

    result
}

fn merge_resource(
    id: &ResourceId,
    original: Option<&Resource>,
    local: &Resource,
    updated: &Resource,
    conflicts: &mut Vec<Conflict>,
) -> Resource {
    let o = original.map(|r| r.value().clone());
    let mut merger = FieldMerger { id, conflicts };
    let merged = merger
        .merge(o.as_ref(), Some(local.value()), Some(updated.value()), &FieldPath::root())
        .unwrap_or(Value::Null);

    let empty = CommentMap::new();
    let original_comments = original.map(|r| r.comments()).unwrap_or(&empty);
    let comments = CommentMap::select(
        &merged,
        &[updated.comments(), local.comments(), original_comments],
    );
    Resource::with_comments(merged, comments)
}

struct FieldMerger<'a> {
    id: &'a ResourceId,
    conflicts: &'a mut Vec<Conflict>,
}

impl FieldMerger<'_> {
    fn conflict(&mut self, path: &FieldPath, kind: ConflictKind, l: Option<&Value>, u: Option<&Value>) {
        self.conflicts.push(Conflict {
            subject: ConflictSubject::Resource(self.id.clone()),
            field: path.clone(),
            kind,
            local: l.cloned(),
            updated: u.cloned(),
        });
    }

    fn merge(
        &mut self,
        o: Option<&Value>,
        l: Option<&Value>,
        u: Option<&Value>,
        path: &FieldPath,
    ) -> Option<Value> {
        if l == u || u == o {
            return l.cloned();
        }
        if l == o {
            return u.cloned();
        }

        match (l, u) {
            (None, Some(_)) => {
                self.conflict(path, ConflictKind::DeletedLocally, l, u);
                None
            }
            (Some(l), None) => Some(l.clone()),
            (Some(Value::Mapping(lm)), Some(Value::Mapping(um))) => {
                let om = o.and_then(Value::as_mapping);
                Some(Value::Mapping(self.merge_mappings(om, lm, um, path)))
            }
            (Some(Value::Sequence(ls)), Some(Value::Sequence(us))) => {
                let os = o.and_then(Value::as_sequence).map(Vec::as_slice).unwrap_or(&[]);
                match associative_key(&[os, ls, us]) {
                    Some(key) if all_keyed(key, &[os, ls, us]) => {
                        Some(Value::Sequence(self.merge_associative(key, os, ls, us, path)))
                    }
                    _ => {
                        self.conflict(path, ConflictKind::BothModified, l, u);
                        u.cloned()
                    }
                }
            }
            (Some(_), Some(_)) => {
                self.conflict(path, ConflictKind::BothModified, l, u);
                u.cloned()
            }
            (None, None) => None,
        }
    }

    fn merge_mappings(
        &mut self,
        om: Option<&Mapping>,
        lm: &Mapping,
        um: &Mapping,
        path: &FieldPath,
    ) -> Mapping {
        let mut out = Mapping::new();
        let keys = lm.keys().chain(um.keys().filter(|k| !lm.contains_key(*k)));
        for key in keys {
            let child = path.child(scalar_string(key).unwrap_or_default());
            let merged = self.merge(om.and_then(|m| m.get(key)), lm.get(key), um.get(key), &child);
            if let Some(value) = merged {
                out.insert(key.clone(), value);
            }
        }
        out
    }

    fn merge_associative(
        &mut self,
        key: &str,
        os: &[Value],
        ls: &[Value],
        us: &[Value],
        path: &FieldPath,
    ) -> Vec<Value> {
        let index = |list: &[Value]| -> IndexMap<String, Value> {
            list.iter()
                .filter_map(|e| element_key(e, key).map(|k| (k, e.clone())))
                .collect()
        };
        let (oi, li, ui) = (index(os), index(ls), index(us));

        let mut out = Vec::new();
        let names = li.keys().chain(ui.keys().filter(|k| !li.contains_key(*k)));
        for name in names {
            let child = path.element(key, name.as_str());
            if let Some(value) = self.merge(oi.get(name), li.get(name), ui.get(name), &child) {
                out.push(value);
            }
        }
        out
    }
}

fn element_key(element: &Value, key: &str) -> Option<String> {
    element.get(key).and_then(scalar_string)
}

fn all_keyed(key: &str, lists: &[&[Value]]) -> bool {
    lists
        .iter()
        .flat_map(|l| l.iter())
        .all(|e| element_key(e, key).is_some())
}

/// Merge a non-resource file; `None` means absent
///
/// Returns the bytes to keep and whether both sides changed the file.
pub fn merge_file<'a>(
    original: Option<&'a [u8]>,
    local: Option<&'a [u8]>,
    updated: Option<&'a [u8]>,
) -> (Option<&'a [u8]>, bool) {
    if local == updated || updated == original {
        (local, false)
    } else if local == original {
        (updated, false)
    } else {
        (local, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_documents;

    fn parse(yaml: &str) -> Vec<Resource> {
        parse_documents(yaml, "test.yaml").unwrap()
    }

    const ORIGINAL: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
spec:
  replicas: 1
  template:
    spec:
      containers:
      - name: app
        image: app:1
      - name: proxy
        image: proxy:1
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: dev
"#;

    #[test]
    fn test_unchanged_local_takes_updated() {
        let original = parse(ORIGINAL);
        let updated = parse(&ORIGINAL.replace("app:1", "app:2"));
        let result = three_way_merge(&original, &original, &updated);
        assert!(result.conflicts.is_empty());
        assert_eq!(result.resources.len(), 2);
        assert_eq!(result.resources[0].value(), updated[0].value());
    }

    #[test]
    fn test_unchanged_upstream_keeps_local() {
        let original = parse(ORIGINAL);
        let local = parse(&ORIGINAL.replace("replicas: 1", "replicas: 5"));
        let result = three_way_merge(&original, &local, &original);
        assert!(result.conflicts.is_empty());
        assert_eq!(result.resources[0].value(), local[0].value());
        assert!(!result.resources[0].is_modified());
    }

    #[test]
    fn test_disjoint_field_changes_merge() {
        let original = parse(ORIGINAL);
        let local = parse(&ORIGINAL.replace("replicas: 1", "replicas: 5"));
        let updated = parse(&ORIGINAL.replace("image: proxy:1", "image: proxy:2"));

        let result = three_way_merge(&original, &local, &updated);
        assert!(result.conflicts.is_empty());
        let merged = &result.resources[0];
        assert_eq!(merged.lookup(&FieldPath::parse("spec.replicas")).unwrap().as_u64(), Some(5));
        assert_eq!(
            merged
                .lookup(&FieldPath::parse("spec.template.spec.containers[1].image"))
                .unwrap()
                .as_str(),
            Some("proxy:2")
        );
    }

    #[test]
    fn test_double_modification_conflicts() {
        let original = parse(ORIGINAL);
        let local = parse(&ORIGINAL.replace("mode: dev", "mode: local"));
        let updated = parse(&ORIGINAL.replace("mode: dev", "mode: prod"));

        let result = three_way_merge(&original, &local, &updated);
        assert_eq!(result.conflicts.len(), 1);
        let conflict = &result.conflicts[0];
        assert_eq!(conflict.field.to_string(), "data.mode");
        assert_eq!(conflict.kind, ConflictKind::BothModified);
        assert_eq!(conflict.local, Some(Value::from("local")));
        assert_eq!(
            result.resources[1].lookup(&FieldPath::parse("data.mode")).unwrap().as_str(),
            Some("prod")
        );
    }

    #[test]
    fn test_associative_list_merges_by_name() {
        let original = parse(ORIGINAL);
        // local adds a container, upstream changes an existing one
        let local = parse(&ORIGINAL.replace(
            "      - name: proxy\n        image: proxy:1\n",
            "      - name: proxy\n        image: proxy:1\n      - name: debug\n        image: busybox\n",
        ));
        let updated = parse(&ORIGINAL.replace("image: app:1", "image: app:2"));

        let result = three_way_merge(&original, &local, &updated);
        assert!(result.conflicts.is_empty());
        let containers = result.resources[0]
            .lookup(&FieldPath::parse("spec.template.spec.containers"))
            .unwrap()
            .as_sequence()
            .unwrap()
            .clone();
        let names: Vec<&str> = containers.iter().map(|c| c["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["app", "proxy", "debug"]);
        assert_eq!(containers[0]["image"].as_str(), Some("app:2"));
    }

    #[test]
    fn test_scalar_list_double_change_takes_updated() {
        let base = "apiVersion: v1\nkind: A\nmetadata:\n  name: a\nargs:\n- a\n";
        let original = parse(base);
        let local = parse(&base.replace("- a\n", "- a\n- b\n"));
        let updated = parse(&base.replace("- a\n", "- a\n- c\n"));
        let result = three_way_merge(&original, &local, &updated);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].field.to_string(), "args");
        assert_eq!(result.resources[0].value()["args"][1].as_str(), Some("c"));
    }

    #[test]
    fn test_deletions() {
        let original = parse(ORIGINAL);
        let deployment_only = parse(ORIGINAL.split("---\n").next().unwrap());

        // deleted upstream, untouched locally: removed
        let result = three_way_merge(&original, &original, &deployment_only);
        assert_eq!(result.resources.len(), 1);

        // deleted upstream, modified locally: kept with a conflict
        let local = parse(&ORIGINAL.replace("mode: dev", "mode: local"));
        let result = three_way_merge(&original, &local, &deployment_only);
        assert_eq!(result.resources.len(), 2);
        assert_eq!(result.conflicts[0].kind, ConflictKind::DeletedUpstream);

        // deleted locally: stays deleted even if upstream changed it
        let updated = parse(&ORIGINAL.replace("mode: dev", "mode: prod"));
        let result = three_way_merge(&original, &deployment_only, &updated);
        assert_eq!(result.resources.len(), 1);
    }

    #[test]
    fn test_locally_deleted_field_changed_upstream() {
        let original = parse(ORIGINAL);
        let local = parse(&ORIGINAL.replace("  replicas: 1\n", ""));
        let updated = parse(&ORIGINAL.replace("replicas: 1", "replicas: 3"));
        let result = three_way_merge(&original, &local, &updated);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].kind, ConflictKind::DeletedLocally);
        assert!(result.resources[0].lookup(&FieldPath::parse("spec.replicas")).is_none());
    }

    #[test]
    fn test_additions_on_both_sides() {
        let original = parse(ORIGINAL);
        let extra = "---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: s\n";
        let local = parse(&format!("{}{}", ORIGINAL, extra));
        let updated = parse(&format!(
            "{}{}",
            ORIGINAL,
            "---\napiVersion: v1\nkind: Service\nmetadata:\n  name: svc\n"
        ));
        let result = three_way_merge(&original, &local, &updated);
        let kinds: Vec<_> = result.resources.iter().filter_map(|r| r.kind()).collect();
        assert_eq!(kinds, vec!["Deployment", "ConfigMap", "Secret", "Service"]);
    }

    #[test]
    fn test_comments_prefer_updated() {
        let original = parse(ORIGINAL);
        let local = parse(&ORIGINAL.replace("replicas: 1", "replicas: 5 # scaled"));
        let updated = parse(&ORIGINAL.replace("image: app:1", "image: app:2 # bumped"));
        let result = three_way_merge(&original, &local, &updated);
        let out = result.resources[0].to_yaml();
        assert!(out.contains("replicas: 5 # scaled"));
        assert!(out.contains("image: app:2 # bumped"));
    }

    #[test]
    fn test_merge_file() {
        let (o, l, u) = (Some(&b"a"[..]), Some(&b"b"[..]), Some(&b"c"[..]));
        assert_eq!(merge_file(o, o, u), (u, false));
        assert_eq!(merge_file(o, l, o), (l, false));
        assert_eq!(merge_file(o, l, u), (l, true));
        assert_eq!(merge_file(None, None, u), (u, false));
        assert_eq!(merge_file(o, None, o), (None, false));
    }
}
