//! Depth-first hydration of a package tree
//!
//! Every package is a node. Subpackages are hydrated before their parent,
//! siblings in path order, and a parent's pipeline sees the hydrated output
//! of its subpackages followed by its own resources. A node reached again
//! while it is still being hydrated means the tree links back to itself.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use kpt_core::package::relative_slash_path;
use kpt_core::{CoreError, KptError, Package, Resource, clean_relative_path};

use crate::error::EngineError;
use crate::function::{Invocation, Stage};
use crate::results::FunctionResultList;
use crate::runner::RunnerOptions;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Dry,
    Hydrating,
    Wet,
}

#[derive(Debug)]
struct HydrationNode {
    state: NodeState,
    resources: Vec<Resource>,
}

/// State of one hydration, owned by a single task
#[derive(Debug)]
pub struct HydrationContext {
    root: Package,
    nodes: Vec<HydrationNode>,
    ids: HashMap<PathBuf, NodeId>,
    input_paths: BTreeSet<String>,
    results: FunctionResultList,
    options: RunnerOptions,
    cancel: CancellationToken,
}

impl HydrationContext {
    pub fn new(root: Package, options: RunnerOptions, cancel: CancellationToken) -> Self {
        Self {
            root,
            nodes: Vec::new(),
            ids: HashMap::new(),
            input_paths: BTreeSet::new(),
            results: FunctionResultList::new(),
            options,
            cancel,
        }
    }

    pub fn root(&self) -> &Package {
        &self.root
    }

    /// Files read during hydration, relative to the root
    pub fn input_paths(&self) -> &BTreeSet<String> {
        &self.input_paths
    }

    pub fn results(&self) -> &FunctionResultList {
        &self.results
    }

    pub fn results_mut(&mut self) -> &mut FunctionResultList {
        &mut self.results
    }

    /// Each executed function records exactly one result
    pub fn executed_function_count(&self) -> usize {
        self.results.len()
    }

    pub fn state(&self, unique_path: &Path) -> NodeState {
        self.ids
            .get(unique_path)
            .map(|&id| self.nodes[id].state)
            .unwrap_or(NodeState::Dry)
    }

    /// Hydrate the whole tree and return the root's output
    pub async fn hydrate(&mut self) -> Result<Vec<Resource>, KptError> {
        let root = self.root.clone();
        self.hydrate_package(root).await
    }

    fn hydrate_package(&mut self, pkg: Package) -> BoxFuture<'_, Result<Vec<Resource>, KptError>> {
        async move {
            if self.cancel.is_cancelled() {
                return Err(KptError::from(EngineError::Cancelled));
            }

            let id = match self.ids.get(pkg.unique_path()) {
                Some(&id) => match self.nodes[id].state {
                    NodeState::Hydrating => {
                        return Err(KptError::from(EngineError::CycleDetected {
                            path: pkg.path().display().to_string(),
                        })
                        .path(pkg.path()));
                    }
                    NodeState::Wet => return Ok(self.nodes[id].resources.clone()),
                    NodeState::Dry => id,
                },
                None => {
                    self.nodes.push(HydrationNode {
                        state: NodeState::Dry,
                        resources: Vec::new(),
                    });
                    let id = self.nodes.len() - 1;
                    self.ids.insert(pkg.unique_path().to_path_buf(), id);
                    id
                }
            };
            self.nodes[id].state = NodeState::Hydrating;
            tracing::debug!(pkg = %pkg.path().display(), "hydrating package");

            let scoped = |e: CoreError| KptError::from(e).path(pkg.path());

            let local = pkg.read_resources().map_err(scoped)?;
            let prefix = relative_slash_path(self.root.path(), pkg.path());
            for resource in &local {
                if let Some(path) = resource.path() {
                    self.input_paths.insert(join_slash(&prefix, path));
                }
            }

            let mut input = Vec::with_capacity(local.len());
            for sub_dir in pkg.subpackages().map_err(scoped)? {
                let sub = Package::open(&sub_dir).map_err(|e| KptError::from(e).path(&sub_dir))?;
                // Symlinks may resolve anywhere; only the resolved location counts.
                if !sub_dir.starts_with(self.root.path())
                    || !sub.unique_path().starts_with(self.root.unique_path())
                {
                    return Err(KptError::from(EngineError::OutsideRoot {
                        path: sub_dir.display().to_string(),
                        root: self.root.path().display().to_string(),
                    }));
                }
                let output = self.hydrate_package(sub).await?;
                let rel = relative_slash_path(pkg.path(), &sub_dir);
                for mut resource in output {
                    rebase(&mut resource, &rel).map_err(scoped)?;
                    input.push(resource);
                }
            }
            input.extend(local);

            let output = self
                .run_pipeline(&pkg, input)
                .await
                .map_err(|e| e.path(pkg.path()))?;

            let node = &mut self.nodes[id];
            node.state = NodeState::Wet;
            node.resources = output.clone();
            Ok(output)
        }
        .boxed()
    }

    /// Mutators in order, then validators over the mutated resources
    async fn run_pipeline(
        &mut self,
        pkg: &Package,
        input: Vec<Resource>,
    ) -> Result<Vec<Resource>, KptError> {
        ensure_well_formed(&input)?;

        let kptfile = pkg.kptfile();
        if kptfile.mutators().is_empty() && kptfile.validators().is_empty() {
            return Ok(input);
        }

        let mut invocation = Invocation {
            pkg_dir: pkg.path(),
            options: &self.options,
            cancel: &self.cancel,
            results: &mut self.results,
        };

        let mut items = input;
        for function in kptfile.mutators() {
            items = invocation
                .run(function, Stage::Mutator, items)
                .await
                .map_err(|e| KptError::from(e).function(function.id()))?;
        }
        for function in kptfile.validators() {
            items = invocation
                .run(function, Stage::Validator, items)
                .await
                .map_err(|e| KptError::from(e).function(function.id()))?;
        }
        ensure_well_formed(&items)?;
        Ok(items)
    }
}

/// Every resource has a kind, an apiVersion, a path and an index
fn ensure_well_formed(resources: &[Resource]) -> Result<(), CoreError> {
    for resource in resources {
        let (path, index) = resource.require_path_index()?;
        if !resource.is_resource() {
            return Err(CoreError::InvalidResource {
                path,
                index,
                message: "apiVersion and kind are required".to_string(),
            });
        }
    }
    Ok(())
}

/// Make a subpackage resource's path relative to the parent package
fn rebase(resource: &mut Resource, rel: &str) -> Result<(), CoreError> {
    let (path, index) = resource.require_path_index()?;
    let clean = clean_relative_path(&path)?;
    let clean = clean.to_string_lossy().replace('\\', "/");
    resource.set_path_index(&join_slash(rel, &clean), index)
}

fn join_slash(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase_composes_paths() {
        let mut resource =
            Resource::parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n").unwrap();
        resource.set_path_index("./cm.yaml", 2).unwrap();
        rebase(&mut resource, "db").unwrap();
        rebase(&mut resource, "apps").unwrap();
        assert_eq!(resource.path(), Some("apps/db/cm.yaml"));
        assert_eq!(resource.index(), Some(2));
    }

    #[test]
    fn test_rebase_rejects_escaping_paths() {
        let mut resource =
            Resource::parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n").unwrap();
        resource.set_path_index("../cm.yaml", 0).unwrap();
        assert!(matches!(
            rebase(&mut resource, "db"),
            Err(CoreError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_well_formed_requires_location() {
        let resource =
            Resource::parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm\n").unwrap();
        assert!(matches!(
            ensure_well_formed(&[resource]),
            Err(CoreError::MissingAnnotation { .. })
        ));
    }
}
