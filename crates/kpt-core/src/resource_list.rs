//! The `ResourceList` envelope exchanged with functions

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::comments::CommentMap;
use crate::emit::{as_list_item, emit_value, indent_block};
use crate::error::{CoreError, Result};
use crate::resource::{FieldPath, Resource};

pub const RESOURCE_LIST_API_VERSION: &str = "config.kubernetes.io/v1";
pub const RESOURCE_LIST_KIND: &str = "ResourceList";

/// Function input and output
#[derive(Debug, Clone, Default)]
pub struct ResourceList {
    pub items: Vec<Resource>,
    pub function_config: Option<Resource>,
    pub results: Vec<ResultItem>,
}

/// Severity of a function result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// One structured message reported by a function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub severity: Severity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<FieldRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileRef>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl fmt::Display for ResultItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.message)?;
        if let Some(r) = &self.resource_ref {
            write!(f, " in {}/{}", r.kind, r.name)?;
        }
        if let Some(field) = &self.field {
            write!(f, " field {}", field.path)?;
        }
        if let Some(file) = &self.file {
            write!(f, " file {}", file.path)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_value: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRef {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl ResourceList {
    pub fn new(items: Vec<Resource>, function_config: Option<Resource>) -> Self {
        Self {
            items,
            function_config,
            results: Vec::new(),
        }
    }

    /// Serialize with item comments preserved
    pub fn to_yaml(&self) -> String {
        let mut out = format!(
            "apiVersion: {}\nkind: {}\n",
            RESOURCE_LIST_API_VERSION, RESOURCE_LIST_KIND
        );
        if self.items.is_empty() {
            out.push_str("items: []\n");
        } else {
            out.push_str("items:\n");
            for item in &self.items {
                out.push_str(&as_list_item(&item.to_yaml()));
            }
        }
        if let Some(config) = &self.function_config {
            out.push_str("functionConfig:\n");
            out.push_str(&indent_block(&config.to_yaml(), 2));
        }
        if !self.results.is_empty() {
            if let Ok(results) = serde_yaml::to_value(&self.results) {
                out.push_str("results:\n");
                out.push_str(&emit_value(&results));
            }
        }
        out
    }

    /// Parse function output
    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(CoreError::InvalidResourceList {
                message: "function produced no output".to_string(),
            });
        }
        let value: Value = serde_yaml::from_str(text).map_err(|e| CoreError::InvalidResourceList {
            message: e.to_string(),
        })?;
        if value.get("kind").and_then(Value::as_str) != Some(RESOURCE_LIST_KIND) {
            return Err(CoreError::InvalidResourceList {
                message: format!("expected kind {}", RESOURCE_LIST_KIND),
            });
        }

        let comments = CommentMap::scan(text);
        let items_path = FieldPath::fields(["items"]);
        let items = match value.get("items") {
            Some(Value::Sequence(seq)) => seq
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    Resource::with_comments(item.clone(), comments.subtree(&items_path.index(i)))
                })
                .collect(),
            Some(Value::Null) | None => Vec::new(),
            Some(_) => {
                return Err(CoreError::InvalidResourceList {
                    message: "items must be a list".to_string(),
                });
            }
        };

        let function_config = value
            .get("functionConfig")
            .filter(|v| !v.is_null())
            .map(|v| {
                Resource::with_comments(
                    v.clone(),
                    comments.subtree(&FieldPath::fields(["functionConfig"])),
                )
            });

        let results = match value.get("results") {
            Some(v) if !v.is_null() => serde_yaml::from_value(v.clone()).map_err(|e| {
                CoreError::InvalidResourceList {
                    message: format!("invalid results: {}", e),
                }
            })?,
            _ => Vec::new(),
        };

        Ok(Self {
            items,
            function_config,
            results,
        })
    }

    /// Whether any result has error severity
    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| r.severity == Severity::Error)
    }
}
