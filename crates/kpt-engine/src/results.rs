//! Function results collected during a render or an eval

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use kpt_core::{ResultItem, Severity, write_atomic};

pub const RESULTS_API_VERSION: &str = "kpt.dev/v1";
pub const RESULTS_KIND: &str = "FunctionResultList";
pub const RESULTS_FILE_NAME: &str = "results.yaml";

/// Outcome of one function execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_path: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,

    #[serde(default)]
    pub exit_code: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ResultItem>,
}

impl FunctionResult {
    /// Image or exec command that produced this result
    pub fn id(&self) -> &str {
        self.image
            .as_deref()
            .or(self.exec_path.as_deref())
            .unwrap_or_default()
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| r.severity == Severity::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsMetadata {
    pub name: String,
}

/// All results of one invocation, persisted as `results.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionResultList {
    pub api_version: String,
    pub kind: String,
    pub metadata: ResultsMetadata,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub items: Vec<FunctionResult>,
}

impl Default for FunctionResultList {
    fn default() -> Self {
        Self {
            api_version: RESULTS_API_VERSION.to_string(),
            kind: RESULTS_KIND.to_string(),
            metadata: ResultsMetadata {
                name: "fnresults".to_string(),
            },
            exit_code: 0,
            items: Vec::new(),
        }
    }
}

impl FunctionResultList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: FunctionResult) {
        self.items.push(result);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Every result item reported by every function, in execution order
    pub fn all_results(&self) -> impl Iterator<Item = &ResultItem> {
        self.items.iter().flat_map(|r| r.results.iter())
    }

    /// Write `results.yaml` into `dir`, creating it if needed
    pub fn write_to_dir(&self, dir: &Path) -> kpt_core::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(RESULTS_FILE_NAME);
        let yaml = serde_yaml::to_string(self)?;
        write_atomic(&path, yaml.as_bytes())?;
        tracing::debug!(path = %path.display(), count = self.items.len(), "wrote function results");
        Ok(path)
    }
}
