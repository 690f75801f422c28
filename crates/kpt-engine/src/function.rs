//! One pipeline step: select inputs, exchange a `ResourceList`, reconcile
//! the output with the inputs and record the function result

use std::collections::HashMap;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use kpt_core::kptfile::is_selected;
use kpt_core::resource::{LEGACY_INDEX_ANNOTATION, LEGACY_PATH_ANNOTATION};
use kpt_core::{CoreError, Function, Resource, ResourceList};

use crate::error::{EngineError, Result};
use crate::results::{FunctionResult, FunctionResultList};
use crate::runner::{DEFAULT_STDERR_LINES, FunctionRunner, RunnerOptions, truncate_stderr};

/// Whether a function may change resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Mutator,
    Validator,
}

/// Everything a function invocation needs besides its inputs
pub(crate) struct Invocation<'a> {
    pub pkg_dir: &'a Path,
    pub options: &'a RunnerOptions,
    pub cancel: &'a CancellationToken,
    pub results: &'a mut FunctionResultList,
}

impl Invocation<'_> {
    /// Run `function` over `items` and return the resulting resources
    ///
    /// Resources not matched by the function's selectors bypass it and are
    /// appended after its output. A validator's output is discarded and the
    /// input is returned unchanged.
    pub async fn run(
        &mut self,
        function: &Function,
        stage: Stage,
        items: Vec<Resource>,
    ) -> Result<Vec<Resource>> {
        let runner = FunctionRunner::new(function, self.pkg_dir, self.options)?;
        let config = function.resolve_config(self.pkg_dir)?;
        tracing::info!(function = %runner.id(), pkg = %self.pkg_dir.display(), ?stage, "running function");

        if stage == Stage::Validator {
            let selected = items
                .iter()
                .filter(|r| is_selected(&function.selectors, &function.exclude, r))
                .cloned()
                .collect();
            self.exchange(&runner, stage, selected, config).await?;
            return Ok(items);
        }

        let (selected, bypassed): (Vec<Resource>, Vec<Resource>) = items
            .into_iter()
            .partition(|r| is_selected(&function.selectors, &function.exclude, r));
        let mut output = self.exchange(&runner, stage, selected, config).await?;
        output.extend(bypassed);
        Ok(output)
    }

    async fn exchange(
        &mut self,
        runner: &FunctionRunner,
        stage: Stage,
        items: Vec<Resource>,
        config: Option<Resource>,
    ) -> Result<Vec<Resource>> {
        let id = runner.id().to_string();
        let input = ResourceList::new(items, config);
        let process = runner
            .run(input.to_yaml().into_bytes(), self.options, self.cancel)
            .await?;

        let stderr = if self.options.truncate_output {
            truncate_stderr(&process.stderr, DEFAULT_STDERR_LINES)
        } else {
            process.stderr.trim_end().to_string()
        };
        let parsed = std::str::from_utf8(&process.stdout)
            .map_err(|e| CoreError::InvalidResourceList {
                message: format!("function output is not valid UTF-8: {}", e),
            })
            .and_then(ResourceList::parse);

        let mut record = FunctionResult {
            stderr: stderr.clone(),
            exit_code: process.exit_code,
            ..Default::default()
        };
        if runner.is_container() {
            record.image = Some(id.clone());
        } else {
            record.exec_path = Some(id.clone());
        }
        if let Ok(list) = &parsed {
            record.results = list.results.clone();
        }
        let rejected = stage == Stage::Validator && record.has_errors();
        let results = record.results.clone();
        self.results.push(record);

        if rejected {
            return Err(EngineError::ValidatorRejected { id, results });
        }
        if !process.success() {
            return Err(EngineError::FnExec {
                id,
                exit_code: process.exit_code,
                stderr,
                results,
            });
        }

        let output = parsed?;
        for result in &output.results {
            tracing::info!(function = %id, "{}", result);
        }
        reconcile_output(&input.items, output.items)
    }
}

/// Restore source text and comments of output items that match an input by
/// path and index, and give generated items a file of their own
fn reconcile_output(inputs: &[Resource], outputs: Vec<Resource>) -> Result<Vec<Resource>> {
    let by_location: HashMap<(String, usize), &Resource> = inputs
        .iter()
        .filter_map(|r| Some(((r.path()?.to_string(), r.index()?), r)))
        .collect();
    let mut next_index: HashMap<String, usize> = HashMap::new();

    let mut reconciled = Vec::with_capacity(outputs.len());
    for mut item in outputs {
        prefer_legacy_location(&mut item)?;

        match (item.path().map(str::to_string), item.index()) {
            (Some(path), Some(index)) => {
                if let Some(input) = by_location.get(&(path.clone(), index)) {
                    item.adopt_source(input);
                }
                let next = next_index.entry(path).or_default();
                *next = (*next).max(index + 1);
            }
            (path, _) => {
                let path = path.unwrap_or_else(|| default_path(&item));
                let next = next_index.entry(path.clone()).or_default();
                item.set_path_index(&path, *next)?;
                *next += 1;
            }
        }
        reconciled.push(item);
    }
    Ok(reconciled)
}

/// Functions only see the legacy annotations, so a changed legacy location
/// overrides the internal one
fn prefer_legacy_location(item: &mut Resource) -> Result<()> {
    let legacy_path = item.annotation(LEGACY_PATH_ANNOTATION).map(str::to_string);
    let legacy_index = item
        .annotation(LEGACY_INDEX_ANNOTATION)
        .and_then(|i| i.trim().parse::<usize>().ok());
    if let (Some(path), Some(index)) = (legacy_path, legacy_index) {
        if item.path() != Some(path.as_str()) || item.index() != Some(index) {
            item.set_path_index(&path, index)?;
        }
    }
    Ok(())
}

/// File for a resource generated without a location
fn default_path(item: &Resource) -> String {
    let kind = item.kind().unwrap_or("resource").to_lowercase();
    match item.name() {
        Some(name) => format!("{}_{}.yaml", kind, name),
        None => format!("{}.yaml", kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(yaml: &str) -> Resource {
        Resource::parse(yaml).unwrap()
    }

    #[test]
    fn test_generated_resources_get_default_locations() {
        let outputs = vec![
            resource("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n"),
            resource("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n"),
            resource("apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n"),
        ];
        let items = reconcile_output(&[], outputs).unwrap();
        assert_eq!(items[0].path(), Some("configmap_a.yaml"));
        assert_eq!(items[0].index(), Some(0));
        assert_eq!(items[1].index(), Some(1));
        assert_eq!(items[2].path(), Some("service_web.yaml"));
    }

    #[test]
    fn test_unchanged_items_keep_their_source() {
        let text = "# the config\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n";
        let mut input = kpt_core::parse_documents(text, "cm.yaml").unwrap().remove(0);
        input.set_path_index("cm.yaml", 0).unwrap();

        // what a function hands back: same value, no source text
        let list = ResourceList::new(vec![input.clone()], None);
        let output = ResourceList::parse(&list.to_yaml()).unwrap();

        let items = reconcile_output(&[input], output.items).unwrap();
        assert!(!items[0].is_modified());
        assert_eq!(items[0].original_text(), Some(text));
    }

    #[test]
    fn test_function_may_move_resources() {
        let mut item = resource("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n");
        item.set_path_index("cm.yaml", 0).unwrap();
        item.set_annotation(LEGACY_PATH_ANNOTATION, "moved/cm.yaml").unwrap();

        let items = reconcile_output(&[], vec![item]).unwrap();
        assert_eq!(items[0].path(), Some("moved/cm.yaml"));
        assert_eq!(items[0].index(), Some(0));
    }
}
