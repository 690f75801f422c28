//! In-memory resource model
//!
//! A [`Resource`] is one YAML document: an insertion-ordered value tree, the
//! comments and scalar styles found in its source, and (when it was read from
//! disk) the raw text it came from. An unmodified resource is written back
//! byte-for-byte from that raw text.

use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::comments::CommentMap;
use crate::error::{CoreError, Result};

/// Relative file path of a resource inside its package
pub const PATH_ANNOTATION: &str = "internal.config.kubernetes.io/path";
/// Position of a resource inside its file
pub const INDEX_ANNOTATION: &str = "internal.config.kubernetes.io/index";
/// Path annotation understood by older functions
pub const LEGACY_PATH_ANNOTATION: &str = "config.kubernetes.io/path";
/// Index annotation understood by older functions
pub const LEGACY_INDEX_ANNOTATION: &str = "config.kubernetes.io/index";
pub const LEGACY_ID_ANNOTATION: &str = "config.k8s.io/id";
/// Marks a resource as local configuration (never applied to a cluster)
pub const LOCAL_CONFIG_ANNOTATION: &str = "config.kubernetes.io/local-config";
/// Prefix of annotations owned by the engine, stripped before write
pub const INTERNAL_PREFIX: &str = "internal.config.kubernetes.io/";

/// Field names that identify elements of an associative list, in priority order
pub const ASSOCIATIVE_KEYS: &[&str] = &[
    "name",
    "mountPath",
    "devicePath",
    "containerPort",
    "port",
    "topologyKey",
    "ip",
    "hostname",
    "key",
    "type",
];

/// One step of a [`FieldPath`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathSegment {
    /// Mapping field
    Field(String),
    /// Sequence position
    Index(usize),
    /// Associative list element identified by `key == value`
    Element { key: String, value: String },
}

/// Path from the document root to a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path of plain field names
    pub fn fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(|n| PathSegment::Field(n.into())).collect())
    }

    /// Parse a dotted path such as `spec.template.spec.containers[0].image`
    pub fn parse(s: &str) -> Self {
        let mut segments = Vec::new();
        for part in s.split('.').filter(|p| !p.is_empty()) {
            let mut rest = part;
            if let Some(bracket) = rest.find('[') {
                if bracket > 0 {
                    segments.push(PathSegment::Field(rest[..bracket].to_string()));
                }
                rest = &rest[bracket..];
                while let Some(stripped) = rest.strip_prefix('[') {
                    let Some(end) = stripped.find(']') else {
                        break;
                    };
                    let inner = &stripped[..end];
                    match inner.split_once('=') {
                        Some((key, value)) => segments.push(PathSegment::Element {
                            key: key.to_string(),
                            value: value.to_string(),
                        }),
                        None => match inner.parse::<usize>() {
                            Ok(i) => segments.push(PathSegment::Index(i)),
                            Err(_) => segments.push(PathSegment::Field(inner.to_string())),
                        },
                    }
                    rest = &stripped[end + 1..];
                }
            } else {
                segments.push(PathSegment::Field(rest.to_string()));
            }
        }
        Self(segments)
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Field(name.into()));
        Self(segments)
    }

    pub fn index(&self, i: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(i));
        Self(segments)
    }

    pub fn element(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Element {
            key: key.into(),
            value: value.into(),
        });
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Remove `prefix` from the front of this path
    pub fn strip_prefix(&self, prefix: &FieldPath) -> Option<FieldPath> {
        self.0
            .strip_prefix(prefix.0.as_slice())
            .map(|rest| FieldPath(rest.to_vec()))
    }

    /// Prepend `prefix` to this path
    pub fn prefixed(&self, prefix: &FieldPath) -> FieldPath {
        let mut segments = prefix.0.clone();
        segments.extend(self.0.iter().cloned());
        FieldPath(segments)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) => {
                    if i > 0 {
                        f.write_str(".")?;
                    }
                    f.write_str(name)?;
                }
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
                PathSegment::Element { key, value } => write!(f, "[{}={}]", key, value)?,
            }
        }
        Ok(())
    }
}

/// Identity of a resource: `(group, kind, namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)?;
        } else {
            write!(f, "{}/{}", self.group, self.kind)?;
        }
        if self.namespace.is_empty() {
            write!(f, " {}", self.name)
        } else {
            write!(f, " {}/{}", self.namespace, self.name)
        }
    }
}

/// Text a resource was parsed from
#[derive(Debug, Clone)]
pub(crate) struct Source {
    /// Exact bytes of the document, including its separator line and any
    /// empty documents absorbed next to it
    pub(crate) raw: String,
    /// Value as parsed, before any annotation was added
    pub(crate) pristine: Value,
    /// Whether this was the first document of its file
    pub(crate) first_in_file: bool,
}

/// A single structured document
#[derive(Debug, Clone)]
pub struct Resource {
    value: Value,
    comments: CommentMap,
    source: Option<Source>,
}

impl Resource {
    /// Create a resource from a value tree, without comments or source text
    pub fn new(value: Value) -> Self {
        Self {
            value,
            comments: CommentMap::default(),
            source: None,
        }
    }

    pub fn with_comments(value: Value, comments: CommentMap) -> Self {
        Self {
            value,
            comments,
            source: None,
        }
    }

    pub(crate) fn from_source(
        value: Value,
        comments: CommentMap,
        raw: String,
        first_in_file: bool,
    ) -> Self {
        let pristine = value.clone();
        Self {
            value,
            comments,
            source: Some(Source {
                raw,
                pristine,
                first_in_file,
            }),
        }
    }

    /// Parse a single YAML document
    pub fn parse(yaml: &str) -> Result<Self> {
        let mut docs = crate::document::parse_documents(yaml, "<inline>")?;
        match docs.len() {
            1 => Ok(docs.remove(0)),
            n => Err(CoreError::InvalidResource {
                path: "<inline>".to_string(),
                index: 0,
                message: format!("expected exactly one document, found {}", n),
            }),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn comments(&self) -> &CommentMap {
        &self.comments
    }

    pub fn comments_mut(&mut self) -> &mut CommentMap {
        &mut self.comments
    }

    /// Serialize with comments re-attached (never uses the raw source text)
    pub fn to_yaml(&self) -> String {
        crate::emit::emit_document(&self.value, &self.comments)
    }

    // ---------------------------------------------------------------------
    // Identity
    // ---------------------------------------------------------------------

    pub fn api_version(&self) -> Option<&str> {
        self.value.get("apiVersion").and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.value.get("kind").and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata_str("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata_str("namespace")
    }

    /// API group (empty for the core group)
    pub fn group(&self) -> &str {
        match self.api_version() {
            Some(av) => av.rsplit_once('/').map(|(g, _)| g).unwrap_or(""),
            None => "",
        }
    }

    /// Whether this document carries both `apiVersion` and `kind`
    pub fn is_resource(&self) -> bool {
        self.value.is_mapping()
            && self.api_version().is_some_and(|s| !s.is_empty())
            && self.kind().is_some_and(|s| !s.is_empty())
    }

    pub fn id(&self) -> ResourceId {
        ResourceId {
            group: self.group().to_string(),
            kind: self.kind().unwrap_or_default().to_string(),
            namespace: self.namespace().unwrap_or_default().to_string(),
            name: self.name().unwrap_or_default().to_string(),
        }
    }

    fn metadata_str(&self, field: &str) -> Option<&str> {
        self.value.get("metadata")?.get(field)?.as_str()
    }

    // ---------------------------------------------------------------------
    // Annotations and labels
    // ---------------------------------------------------------------------

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.value.get("metadata")?.get("annotations")?.get(key)?.as_str()
    }

    /// All annotations with string values
    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map(self.value.get("metadata").and_then(|m| m.get("annotations")))
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        let annotations = self.metadata_child_mut("annotations")?;
        annotations.insert(Value::from(key), Value::from(value.into()));
        Ok(())
    }

    /// Remove an annotation, dropping the `annotations` field once empty
    pub fn remove_annotation(&mut self, key: &str) -> Option<String> {
        remove_annotation_from(&mut self.value, key)
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.value.get("metadata").and_then(|m| m.get("labels")))
    }

    pub fn set_label(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        let labels = self.metadata_child_mut("labels")?;
        labels.insert(Value::from(key), Value::from(value.into()));
        Ok(())
    }

    fn metadata_child_mut(&mut self, field: &str) -> Result<&mut Mapping> {
        let root = self.value.as_mapping_mut().ok_or_else(|| CoreError::InvalidPath {
            path: format!("metadata.{}", field),
            message: "document is not a mapping".to_string(),
        })?;
        let metadata = ensure_mapping(root, "metadata")?;
        ensure_mapping(metadata, field)
    }

    pub fn is_local_config(&self) -> bool {
        self.annotation(LOCAL_CONFIG_ANNOTATION)
            .is_some_and(|v| v != "false")
    }

    // ---------------------------------------------------------------------
    // Path and index annotations
    // ---------------------------------------------------------------------

    /// File path relative to the package root
    pub fn path(&self) -> Option<&str> {
        self.annotation(PATH_ANNOTATION)
            .or_else(|| self.annotation(LEGACY_PATH_ANNOTATION))
    }

    /// Position inside the file
    pub fn index(&self) -> Option<usize> {
        self.annotation_number(INDEX_ANNOTATION)
            .or_else(|| self.annotation_number(LEGACY_INDEX_ANNOTATION))
    }

    fn annotation_number(&self, key: &str) -> Option<usize> {
        let value = self.value.get("metadata")?.get("annotations")?.get(key)?;
        match value {
            Value::String(s) => s.trim().parse().ok(),
            Value::Number(n) => n.as_u64().map(|n| n as usize),
            _ => None,
        }
    }

    /// Set both the internal and the legacy path/index annotations
    pub fn set_path_index(&mut self, path: &str, index: usize) -> Result<()> {
        self.set_annotation(PATH_ANNOTATION, path)?;
        self.set_annotation(LEGACY_PATH_ANNOTATION, path)?;
        self.set_annotation(INDEX_ANNOTATION, index.to_string())?;
        self.set_annotation(LEGACY_INDEX_ANNOTATION, index.to_string())?;
        Ok(())
    }

    /// Path and index, failing if either is missing
    pub fn require_path_index(&self) -> Result<(String, usize)> {
        let path = self.path().ok_or_else(|| CoreError::MissingAnnotation {
            resource: self.id().to_string(),
            annotation: PATH_ANNOTATION,
        })?;
        let index = self.index().ok_or_else(|| CoreError::MissingAnnotation {
            resource: self.id().to_string(),
            annotation: INDEX_ANNOTATION,
        })?;
        Ok((path.to_string(), index))
    }

    /// Remove every engine-owned annotation
    pub fn strip_internal_annotations(&mut self) {
        strip_internal(&mut self.value);
    }

    // ---------------------------------------------------------------------
    // Source tracking
    // ---------------------------------------------------------------------

    /// Whether the value differs from what was read from disk
    ///
    /// Engine annotations are ignored. Resources without a source (created by
    /// a function or built in memory) always count as modified.
    pub fn is_modified(&self) -> bool {
        match &self.source {
            Some(source) => {
                let mut current = self.value.clone();
                strip_internal(&mut current);
                current != source.pristine
            }
            None => true,
        }
    }

    /// Original text, available only while the resource is unmodified
    pub fn original_text(&self) -> Option<&str> {
        match &self.source {
            Some(source) if !self.is_modified() => Some(source.raw.as_str()),
            _ => None,
        }
    }

    pub(crate) fn first_in_file(&self) -> bool {
        self.source.as_ref().is_some_and(|s| s.first_in_file)
    }

    /// Carry source text and comments over from the resource this one was
    /// derived from (typically the matching input of a function)
    pub fn adopt_source(&mut self, from: &Resource) {
        if self.source.is_none() {
            self.source = from.source.clone();
        }
        self.comments.fill_missing(&from.comments);
    }

    /// Forget the source text so the resource is always re-emitted
    pub fn detach_source(&mut self) {
        self.source = None;
    }

    // ---------------------------------------------------------------------
    // Field access
    // ---------------------------------------------------------------------

    pub fn lookup(&self, path: &FieldPath) -> Option<&Value> {
        lookup(&self.value, path)
    }

    pub fn lookup_mut(&mut self, path: &FieldPath) -> Option<&mut Value> {
        lookup_mut(&mut self.value, path)
    }

    /// Set a field, creating intermediate mappings as needed
    pub fn set_field(&mut self, path: &FieldPath, value: Value) -> Result<()> {
        let Some((last, parents)) = path.segments().split_last() else {
            self.value = value;
            return Ok(());
        };

        let mut current = &mut self.value;
        for segment in parents {
            current = match segment {
                PathSegment::Field(name) => {
                    if current.is_null() {
                        *current = Value::Mapping(Mapping::new());
                    }
                    let map = current.as_mapping_mut().ok_or_else(|| invalid_path(path))?;
                    if !map.contains_key(name.as_str()) {
                        map.insert(Value::from(name.as_str()), Value::Mapping(Mapping::new()));
                    }
                    map.get_mut(name.as_str()).ok_or_else(|| invalid_path(path))?
                }
                other => step_mut(current, other).ok_or_else(|| invalid_path(path))?,
            };
        }

        match last {
            PathSegment::Field(name) => {
                if current.is_null() {
                    *current = Value::Mapping(Mapping::new());
                }
                let map = current.as_mapping_mut().ok_or_else(|| invalid_path(path))?;
                map.insert(Value::from(name.as_str()), value);
            }
            other => {
                let slot = step_mut(current, other).ok_or_else(|| invalid_path(path))?;
                *slot = value;
            }
        }
        Ok(())
    }

    /// Remove a field, returning its value
    pub fn remove_field(&mut self, path: &FieldPath) -> Option<Value> {
        let (last, parents) = path.segments().split_last()?;
        let parent = lookup_mut(&mut self.value, &FieldPath(parents.to_vec()))?;
        match last {
            PathSegment::Field(name) => parent.as_mapping_mut()?.shift_remove(name.as_str()),
            PathSegment::Index(i) => {
                let seq = parent.as_sequence_mut()?;
                (*i < seq.len()).then(|| seq.remove(*i))
            }
            PathSegment::Element { key, value } => {
                let seq = parent.as_sequence_mut()?;
                let pos = seq.iter().position(|e| element_matches(e, key, value))?;
                Some(seq.remove(pos))
            }
        }
    }

    /// Visit every node with its path, parents before children
    pub fn visit(&self, mut f: impl FnMut(&FieldPath, &Value)) {
        visit_fields(&self.value, &mut f);
    }
}

fn invalid_path(path: &FieldPath) -> CoreError {
    CoreError::InvalidPath {
        path: path.to_string(),
        message: "path crosses a non-mapping node".to_string(),
    }
}

fn ensure_mapping<'a>(map: &'a mut Mapping, field: &str) -> Result<&'a mut Mapping> {
    let needs_init = !matches!(map.get(field), Some(Value::Mapping(_)));
    if needs_init {
        if let Some(existing) = map.get(field) {
            if !existing.is_null() {
                return Err(CoreError::InvalidPath {
                    path: field.to_string(),
                    message: "expected a mapping".to_string(),
                });
            }
        }
        map.insert(Value::from(field), Value::Mapping(Mapping::new()));
    }
    map.get_mut(field)
        .and_then(Value::as_mapping_mut)
        .ok_or_else(|| CoreError::InvalidPath {
            path: field.to_string(),
            message: "expected a mapping".to_string(),
        })
}

fn string_map(value: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(Value::Mapping(map)) = value {
        for (k, v) in map {
            if let (Some(k), Some(v)) = (k.as_str(), scalar_string(v)) {
                out.insert(k.to_string(), v);
            }
        }
    }
    out
}

/// String form of a scalar value
pub fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn remove_annotation_from(value: &mut Value, key: &str) -> Option<String> {
    let metadata = value.get_mut("metadata")?.as_mapping_mut()?;
    let annotations = metadata.get_mut("annotations")?.as_mapping_mut()?;
    let removed = annotations.shift_remove(key)?;
    if annotations.is_empty() {
        metadata.shift_remove("annotations");
    }
    scalar_string(&removed).or(Some(String::new()))
}

fn is_engine_annotation(key: &str) -> bool {
    key.starts_with(INTERNAL_PREFIX)
        || key == LEGACY_PATH_ANNOTATION
        || key == LEGACY_INDEX_ANNOTATION
        || key == LEGACY_ID_ANNOTATION
}

fn strip_internal(value: &mut Value) {
    let keys: Vec<String> = value
        .get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(Value::as_mapping)
        .map(|a| {
            a.keys()
                .filter_map(Value::as_str)
                .filter(|k| is_engine_annotation(k))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    for key in keys {
        remove_annotation_from(value, &key);
    }
}

fn step<'a>(value: &'a Value, segment: &PathSegment) -> Option<&'a Value> {
    match segment {
        PathSegment::Field(name) => value.as_mapping()?.get(name.as_str()),
        PathSegment::Index(i) => value.as_sequence()?.get(*i),
        PathSegment::Element { key, value: wanted } => value
            .as_sequence()?
            .iter()
            .find(|e| element_matches(e, key, wanted)),
    }
}

fn step_mut<'a>(value: &'a mut Value, segment: &PathSegment) -> Option<&'a mut Value> {
    match segment {
        PathSegment::Field(name) => value.as_mapping_mut()?.get_mut(name.as_str()),
        PathSegment::Index(i) => value.as_sequence_mut()?.get_mut(*i),
        PathSegment::Element { key, value: wanted } => value
            .as_sequence_mut()?
            .iter_mut()
            .find(|e| element_matches(e, key, wanted)),
    }
}

fn element_matches(element: &Value, key: &str, wanted: &str) -> bool {
    element
        .get(key)
        .and_then(scalar_string)
        .is_some_and(|v| v == wanted)
}

/// Look up a node by path
pub fn lookup<'a>(value: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    path.segments()
        .iter()
        .try_fold(value, |current, segment| step(current, segment))
}

/// Look up a node by path for mutation
pub fn lookup_mut<'a>(value: &'a mut Value, path: &FieldPath) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in path.segments() {
        current = step_mut(current, segment)?;
    }
    Some(current)
}

/// Visit every node of a tree with its path, parents before children
pub fn visit_fields(value: &Value, f: &mut impl FnMut(&FieldPath, &Value)) {
    fn walk(value: &Value, path: &FieldPath, f: &mut impl FnMut(&FieldPath, &Value)) {
        f(path, value);
        match value {
            Value::Mapping(map) => {
                for (k, v) in map {
                    if let Some(key) = scalar_string(k) {
                        walk(v, &path.child(key), f);
                    }
                }
            }
            Value::Sequence(seq) => {
                for (i, v) in seq.iter().enumerate() {
                    walk(v, &path.index(i), f);
                }
            }
            Value::Tagged(tagged) => walk(&tagged.value, path, f),
            _ => {}
        }
    }
    walk(value, &FieldPath::root(), f);
}

/// Key identifying elements of an associative list, if the list is one
///
/// A list is associative when any of its mapping elements carries one of
/// [`ASSOCIATIVE_KEYS`]; the first key in priority order that appears wins.
pub fn associative_key(lists: &[&[Value]]) -> Option<&'static str> {
    ASSOCIATIVE_KEYS.iter().copied().find(|key| {
        lists
            .iter()
            .flat_map(|l| l.iter())
            .any(|e| e.as_mapping().is_some_and(|m| m.contains_key(*key)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment() -> Resource {
        Resource::parse(
            r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx
  namespace: web
spec:
  replicas: 3
  template:
    spec:
      containers:
      - name: nginx
        image: nginx:1.25
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_identity() {
        let res = deployment();
        assert!(res.is_resource());
        assert_eq!(res.group(), "apps");
        assert_eq!(res.kind(), Some("Deployment"));
        assert_eq!(res.id().to_string(), "apps/Deployment web/nginx");
    }

    #[test]
    fn test_core_group_is_empty() {
        let res = Resource::parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n").unwrap();
        assert_eq!(res.group(), "");
        assert_eq!(res.id().to_string(), "ConfigMap cm");
    }

    #[test]
    fn test_annotations_roundtrip() {
        let mut res = deployment();
        assert!(!res.is_modified());

        res.set_path_index("deploy.yaml", 2).unwrap();
        assert_eq!(res.path(), Some("deploy.yaml"));
        assert_eq!(res.index(), Some(2));
        assert_eq!(res.annotation(LEGACY_PATH_ANNOTATION), Some("deploy.yaml"));
        // engine annotations do not count as modifications
        assert!(!res.is_modified());

        res.strip_internal_annotations();
        assert!(res.path().is_none());
        assert!(res.value().get("metadata").unwrap().get("annotations").is_none());
    }

    #[test]
    fn test_require_path_index() {
        let res = deployment();
        let err = res.require_path_index().unwrap_err();
        assert!(matches!(err, CoreError::MissingAnnotation { annotation, .. } if annotation == PATH_ANNOTATION));
    }

    #[test]
    fn test_lookup_and_set_field() {
        let mut res = deployment();
        let image = FieldPath::parse("spec.template.spec.containers[0].image");
        assert_eq!(res.lookup(&image).and_then(Value::as_str), Some("nginx:1.25"));

        let by_name = FieldPath::parse("spec.template.spec.containers[name=nginx].image");
        assert_eq!(res.lookup(&by_name).and_then(Value::as_str), Some("nginx:1.25"));

        res.set_field(&FieldPath::parse("spec.strategy.type"), Value::from("Recreate"))
            .unwrap();
        assert_eq!(
            res.lookup(&FieldPath::parse("spec.strategy.type")).and_then(Value::as_str),
            Some("Recreate")
        );
        assert!(res.is_modified());

        let removed = res.remove_field(&FieldPath::parse("spec.replicas"));
        assert_eq!(removed.and_then(|v| v.as_u64()), Some(3));
    }

    #[test]
    fn test_field_path_display_and_parse() {
        let path = FieldPath::parse("spec.containers[0].ports[name=http].containerPort");
        assert_eq!(path.to_string(), "spec.containers[0].ports[name=http].containerPort");
        assert_eq!(path.len(), 6);
    }

    #[test]
    fn test_visit_collects_paths() {
        let res = deployment();
        let mut paths = Vec::new();
        res.visit(|p, _| paths.push(p.to_string()));
        assert!(paths.contains(&"metadata.name".to_string()));
        assert!(paths.contains(&"spec.template.spec.containers[0].image".to_string()));
    }

    #[test]
    fn test_associative_key_detection() {
        let with_names: Vec<Value> = serde_yaml::from_str("- name: a\n- name: b\n").unwrap();
        let ports: Vec<Value> = serde_yaml::from_str("- containerPort: 80\n").unwrap();
        let scalars: Vec<Value> = serde_yaml::from_str("- a\n- b\n").unwrap();

        assert_eq!(associative_key(&[&with_names]), Some("name"));
        assert_eq!(associative_key(&[&ports]), Some("containerPort"));
        assert_eq!(associative_key(&[&scalars]), None);
    }

    #[test]
    fn test_local_config() {
        let mut res = deployment();
        assert!(!res.is_local_config());
        res.set_annotation(LOCAL_CONFIG_ANNOTATION, "true").unwrap();
        assert!(res.is_local_config());
    }
}
