//! Package manifest (`Kptfile`) and pipeline definitions

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CoreError, Result};
use crate::package::clean_relative_path;
use crate::resource::{FieldPath, LOCAL_CONFIG_ANNOTATION, Resource};

pub const KPTFILE_NAME: &str = "Kptfile";
pub const KPTFILE_API_VERSION: &str = "kpt.dev/v1";
pub const KPTFILE_KIND: &str = "Kptfile";

/// Registry prefix for function images given by short name
pub const DEFAULT_IMAGE_PREFIX: &str = "gcr.io/kpt-fn/";

/// Name of the ConfigMap built from an inline `configMap`
pub const FUNCTION_INPUT_NAME: &str = "function-input";

/// The package manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kptfile {
    /// API version (kpt.dev/v1)
    pub api_version: String,

    pub kind: String,

    #[serde(default)]
    pub metadata: KptfileMetadata,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<PackageInfo>,

    /// Where the package was fetched from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,

    /// Exact revision the package was last synced to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_lock: Option<UpstreamLock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KptfileMetadata {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Human-facing package information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

/// Kind of upstream repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    #[default]
    Git,
    Oci,
}

/// How `update` reconciles local changes with a new upstream revision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStrategy {
    /// Three-way merge of resources (default)
    #[default]
    ResourceMerge,
    /// Only update when there are no local changes
    FastForward,
    /// Replace the package with the new revision, dropping local changes
    ForceDeleteReplace,
}

impl UpdateStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStrategy::ResourceMerge => "resource-merge",
            UpdateStrategy::FastForward => "fast-forward",
            UpdateStrategy::ForceDeleteReplace => "force-delete-replace",
        }
    }
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "resource-merge" => Ok(UpdateStrategy::ResourceMerge),
            "fast-forward" => Ok(UpdateStrategy::FastForward),
            "force-delete-replace" => Ok(UpdateStrategy::ForceDeleteReplace),
            other => Err(format!(
                "unknown update strategy '{}' (expected resource-merge, fast-forward or force-delete-replace)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    #[serde(rename = "type", default)]
    pub origin_type: OriginType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitUpstream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciUpstream>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitUpstream {
    pub repo: String,

    #[serde(default = "default_directory")]
    pub directory: String,

    #[serde(rename = "ref", default)]
    pub git_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciUpstream {
    pub image: String,
}

/// Resolved upstream revision
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamLock {
    #[serde(rename = "type", default)]
    pub origin_type: OriginType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitLock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciLock>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitLock {
    pub repo: String,

    #[serde(default = "default_directory")]
    pub directory: String,

    #[serde(rename = "ref", default)]
    pub git_ref: String,

    /// Full commit SHA the ref resolved to
    pub commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLock {
    pub image: String,

    /// Manifest digest (`sha256:...`)
    pub digest: String,
}

fn default_directory() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(rename = "inventoryID", default, skip_serializing_if = "Option::is_none")]
    pub inventory_id: Option<String>,
}

/// Functions run by `render`: mutators first, then validators
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutators: Vec<Function>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Function>,
}

impl Pipeline {
    pub fn is_empty(&self) -> bool {
        self.mutators.is_empty() && self.validators.is_empty()
    }
}

/// One pipeline step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    /// Container image running the function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Local executable running the function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Package-relative file holding the function config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,

    /// Key/value config, passed as a ConfigMap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<BTreeMap<String, String>>,

    /// Inline config resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,

    /// Resources sent to the function; all of them when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<Selector>,

    /// Resources withheld from the function
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<Selector>,
}

impl Function {
    /// Image reference or command line identifying this function
    pub fn id(&self) -> String {
        match (&self.image, &self.exec) {
            (Some(image), _) => normalize_image(image),
            (None, Some(exec)) => exec.clone(),
            (None, None) => self.name.clone().unwrap_or_default(),
        }
    }

    /// Normalized image reference, if this is a container function
    pub fn image_ref(&self) -> Option<String> {
        self.image.as_deref().map(normalize_image)
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.image, &self.exec) {
            (Some(_), Some(_)) => {
                return Err(CoreError::InvalidFunction {
                    message: "must not specify both image and exec".to_string(),
                });
            }
            (None, None) => {
                return Err(CoreError::InvalidFunction {
                    message: "must specify either image or exec".to_string(),
                });
            }
            (Some(image), None) if image.trim().is_empty() => {
                return Err(CoreError::InvalidFunction {
                    message: "image must not be empty".to_string(),
                });
            }
            (None, Some(exec)) if exec.trim().is_empty() => {
                return Err(CoreError::InvalidFunction {
                    message: "exec must not be empty".to_string(),
                });
            }
            _ => {}
        }

        let modes = [
            self.config_path.is_some(),
            self.config_map.is_some(),
            self.config.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if modes > 1 {
            return Err(CoreError::InvalidFunction {
                message: format!(
                    "function {} must specify only one of configPath, configMap or config",
                    self.id()
                ),
            });
        }

        if let Some(path) = &self.config_path {
            clean_relative_path(path).map_err(|_| CoreError::InvalidFunction {
                message: format!("configPath {} must be a path inside the package", path),
            })?;
        }
        Ok(())
    }

    /// Build the `functionConfig` resource for this function
    pub fn resolve_config(&self, pkg_dir: &Path) -> Result<Option<Resource>> {
        if let Some(config_path) = &self.config_path {
            let rel = clean_relative_path(config_path).map_err(|_| CoreError::InvalidFunction {
                message: format!("configPath {} must be a path inside the package", config_path),
            })?;
            let file = pkg_dir.join(rel);
            if !file.is_file() {
                return Err(CoreError::MissingFunctionConfig {
                    path: config_path.clone(),
                });
            }
            let content = std::fs::read_to_string(&file)?;
            let mut docs = crate::document::parse_documents(&content, config_path)?;
            if docs.len() != 1 || !docs[0].is_resource() {
                return Err(CoreError::InvalidFunction {
                    message: format!(
                        "functionConfig {} must contain exactly one resource with apiVersion and kind",
                        config_path
                    ),
                });
            }
            return Ok(Some(docs.remove(0)));
        }

        if let Some(data) = &self.config_map {
            return Ok(Some(config_map_resource(data)));
        }

        if let Some(value) = &self.config {
            let resource = Resource::new(value.clone());
            if !resource.is_resource() {
                return Err(CoreError::InvalidFunction {
                    message: "inline config must have apiVersion and kind".to_string(),
                });
            }
            return Ok(Some(resource));
        }

        Ok(None)
    }
}

/// Wrap key/value data in the `function-input` ConfigMap
pub fn config_map_resource(data: &BTreeMap<String, String>) -> Resource {
    let mut annotations = Mapping::new();
    annotations.insert(Value::from(LOCAL_CONFIG_ANNOTATION), Value::from("true"));

    let mut metadata = Mapping::new();
    metadata.insert(Value::from("name"), Value::from(FUNCTION_INPUT_NAME));
    metadata.insert(Value::from("annotations"), Value::Mapping(annotations));

    let mut map = Mapping::new();
    map.insert(Value::from("apiVersion"), Value::from("v1"));
    map.insert(Value::from("kind"), Value::from("ConfigMap"));
    map.insert(Value::from("metadata"), Value::Mapping(metadata));
    let data: Mapping = data
        .iter()
        .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
        .collect();
    map.insert(Value::from("data"), Value::Mapping(data));

    Resource::new(Value::Mapping(map))
}

/// Prefix short image names with the default function registry
///
/// `set-namespace:v0.4` becomes `gcr.io/kpt-fn/set-namespace:v0.4`; any
/// reference containing a `/` is kept as is.
pub fn normalize_image(image: &str) -> String {
    let image = image.trim();
    if image.contains('/') {
        image.to_string()
    } else {
        format!("{}{}", DEFAULT_IMAGE_PREFIX, image)
    }
}

/// Resource filter used by `selectors` and `exclude`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Selector {
    /// Every field that is set must match
    pub fn matches(&self, resource: &Resource) -> bool {
        fn field(expected: &Option<String>, actual: Option<&str>) -> bool {
            expected.as_deref().is_none_or(|e| actual == Some(e))
        }

        if !field(&self.api_version, resource.api_version())
            || !field(&self.kind, resource.kind())
            || !field(&self.name, resource.name())
            || !field(&self.namespace, resource.namespace())
        {
            return false;
        }

        let labels = resource.labels();
        let annotations = resource.annotations();
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
            && self.annotations.iter().all(|(k, v)| annotations.get(k) == Some(v))
    }
}

/// Whether `resource` passes a function's `selectors` and `exclude` lists
pub fn is_selected(selectors: &[Selector], exclude: &[Selector], resource: &Resource) -> bool {
    let selected = selectors.is_empty() || selectors.iter().any(|s| s.matches(resource));
    selected && !exclude.iter().any(|s| s.matches(resource))
}

impl Kptfile {
    /// A fresh manifest for a package named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            api_version: KPTFILE_API_VERSION.to_string(),
            kind: KPTFILE_KIND.to_string(),
            metadata: KptfileMetadata {
                name: name.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load and validate `<dir>/Kptfile`
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(KPTFILE_NAME);
        if !path.is_file() {
            return Err(CoreError::ManifestNotFound {
                path: dir.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content, &path)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let kptfile: Kptfile =
            serde_yaml::from_str(content).map_err(|e| CoreError::ManifestInvalid {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        kptfile.validate(path)?;
        Ok(kptfile)
    }

    pub fn from_resource(resource: &Resource, path: &Path) -> Result<Self> {
        let kptfile: Kptfile = serde_yaml::from_value(resource.value().clone()).map_err(|e| {
            CoreError::ManifestInvalid {
                path: path.display().to_string(),
                message: e.to_string(),
            }
        })?;
        kptfile.validate(path)?;
        Ok(kptfile)
    }

    pub fn validate(&self, path: &Path) -> Result<()> {
        if self.api_version != KPTFILE_API_VERSION {
            return Err(CoreError::ManifestInvalid {
                path: path.display().to_string(),
                message: format!(
                    "unsupported apiVersion '{}' (expected {})",
                    self.api_version, KPTFILE_API_VERSION
                ),
            });
        }
        if self.kind != KPTFILE_KIND {
            return Err(CoreError::ManifestInvalid {
                path: path.display().to_string(),
                message: format!("kind must be {}, got '{}'", KPTFILE_KIND, self.kind),
            });
        }
        if let Some(pipeline) = &self.pipeline {
            for function in pipeline.mutators.iter().chain(&pipeline.validators) {
                function.validate()?;
            }
        }
        Ok(())
    }

    pub fn mutators(&self) -> &[Function] {
        self.pipeline.as_ref().map(|p| p.mutators.as_slice()).unwrap_or_default()
    }

    pub fn validators(&self) -> &[Function] {
        self.pipeline.as_ref().map(|p| p.validators.as_slice()).unwrap_or_default()
    }
}

/// A Kptfile edited through the resource model, so its comments and layout
/// survive programmatic changes
#[derive(Debug)]
pub struct KptfileDocument {
    path: PathBuf,
    resource: Resource,
}

impl KptfileDocument {
    /// Open `<dir>/Kptfile`
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(KPTFILE_NAME);
        if !path.is_file() {
            return Err(CoreError::ManifestNotFound {
                path: dir.display().to_string(),
            });
        }
        let content = std::fs::read_to_string(&path)?;
        let mut docs = crate::document::parse_documents(&content, &path.display().to_string())?;
        if docs.is_empty() {
            return Err(CoreError::ManifestInvalid {
                path: path.display().to_string(),
                message: "file is empty".to_string(),
            });
        }
        let resource = docs.remove(0);
        Kptfile::from_resource(&resource, &path)?;
        Ok(Self { path, resource })
    }

    /// Open `<dir>/Kptfile`, or start a new one named `name`
    pub fn open_or_new(dir: &Path, name: &str) -> Result<Self> {
        if dir.join(KPTFILE_NAME).is_file() {
            return Self::open(dir);
        }
        let value = serde_yaml::to_value(Kptfile::new(name))?;
        Ok(Self {
            path: dir.join(KPTFILE_NAME),
            resource: Resource::new(value),
        })
    }

    pub fn kptfile(&self) -> Result<Kptfile> {
        Kptfile::from_resource(&self.resource, &self.path)
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.resource
            .set_field(&FieldPath::fields(["metadata", "name"]), Value::from(name))
    }

    pub fn set_description(&mut self, description: &str) -> Result<()> {
        self.resource.set_field(
            &FieldPath::fields(["info", "description"]),
            Value::from(description),
        )
    }

    pub fn set_upstream(&mut self, upstream: &Upstream) -> Result<()> {
        let value = serde_yaml::to_value(upstream)?;
        self.replace_if_changed(FieldPath::fields(["upstream"]), value)
    }

    pub fn set_upstream_lock(&mut self, lock: &UpstreamLock) -> Result<()> {
        let value = serde_yaml::to_value(lock)?;
        self.replace_if_changed(FieldPath::fields(["upstreamLock"]), value)
    }

    fn replace_if_changed(&mut self, path: FieldPath, value: Value) -> Result<()> {
        if self.resource.lookup(&path) == Some(&value) {
            return Ok(());
        }
        self.resource.set_field(&path, value)
    }

    /// Write the file if anything changed
    pub fn save(&mut self) -> Result<bool> {
        if self.resource.original_text().is_some() {
            return Ok(false);
        }
        crate::format::format_value(self.resource.value_mut());
        crate::writer::write_atomic(&self.path, self.resource.to_yaml().as_bytes())?;
        Ok(true)
    }
}
