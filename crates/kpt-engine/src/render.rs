//! `render` and `fn eval` entry points and their output sinks

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio_util::sync::CancellationToken;

use kpt_core::resource::INTERNAL_PREFIX;
use kpt_core::{
    CoreError, Function, KptError, Package, PackageWriter, Resource, ResourceList, WriteSummary,
    write_unwrapped,
};

use crate::error::EngineError;
use crate::function::{Invocation, Stage};
use crate::hydrate::HydrationContext;
use crate::results::FunctionResultList;
use crate::runner::RunnerOptions;

const RENDER_OP: &str = "fn.render";
const EVAL_OP: &str = "fn.eval";

/// Where rendered resources go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputSink {
    /// Back into the package, pruning files left without resources
    #[default]
    InPlace,
    /// Into another directory, mirroring the package layout
    Directory(PathBuf),
    /// As a `ResourceList` on stdout
    Stdout,
    /// As multi-document YAML on stdout
    Unwrap,
}

impl FromStr for OutputSink {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" => Ok(OutputSink::InPlace),
            "stdout" => Ok(OutputSink::Stdout),
            "unwrap" => Ok(OutputSink::Unwrap),
            dir => Ok(OutputSink::Directory(PathBuf::from(dir))),
        }
    }
}

/// Options for [`Renderer`] and [`Evaluator`]
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub runner: RunnerOptions,
    pub output: OutputSink,
    /// Directory receiving `results.yaml`
    pub results_dir: Option<PathBuf>,
}

impl RenderOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runner(mut self, runner: RunnerOptions) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn with_results_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.results_dir = dir;
        self
    }
}

/// What a render or an eval produced
#[derive(Debug)]
pub struct RenderOutput {
    pub resources: Vec<Resource>,
    /// Files touched, for the file sinks
    pub summary: Option<WriteSummary>,
    /// Serialized output, for the stream sinks
    pub stream: Option<String>,
    pub results: FunctionResultList,
    pub results_file: Option<PathBuf>,
}

impl RenderOutput {
    pub fn executed_function_count(&self) -> usize {
        self.results.len()
    }
}

/// Hydrates a package tree and writes the result
#[derive(Debug, Clone, Default)]
pub struct Renderer {
    options: RenderOptions,
}

impl Renderer {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    /// Render the package at `pkg`
    ///
    /// Nothing is written if any function fails, but the results gathered
    /// up to the failure still go to the results directory.
    pub async fn render(
        &self,
        pkg: &Path,
        cancel: &CancellationToken,
    ) -> Result<RenderOutput, KptError> {
        let root = Package::open(pkg).map_err(|e| KptError::from(e).path(pkg).op(RENDER_OP))?;
        tracing::info!(pkg = %root.path().display(), "rendering package");

        let mut ctx = HydrationContext::new(root, self.options.runner.clone(), cancel.clone());
        let hydrated = ctx.hydrate().await;

        let results_file = persist_results(
            self.options.results_dir.as_deref(),
            ctx.results_mut(),
            hydrated.is_err(),
        )
        .map_err(|e| KptError::from(e).op(RENDER_OP))?;
        let resources = hydrated.map_err(|e| e.op(RENDER_OP))?;
        tracing::info!(
            pkg = %ctx.root().path().display(),
            functions = ctx.executed_function_count(),
            "package rendered"
        );

        let (summary, stream) = emit(
            &self.options.output,
            ctx.root().path(),
            &resources,
            ctx.input_paths(),
        )
        .map_err(|e| KptError::from(e).path(ctx.root().path()).op(RENDER_OP))?;

        Ok(RenderOutput {
            resources,
            summary,
            stream,
            results: ctx.results().clone(),
            results_file,
        })
    }
}

/// Runs a single function over a package tree, without running any
/// package pipeline
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    options: RenderOptions,
}

impl Evaluator {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    pub async fn eval(
        &self,
        pkg: &Path,
        function: &Function,
        cancel: &CancellationToken,
    ) -> Result<RenderOutput, KptError> {
        let scoped = |e: KptError| e.function(function.id()).path(pkg).op(EVAL_OP);
        function.validate().map_err(|e| scoped(e.into()))?;

        let root = Package::open(pkg).map_err(|e| scoped(e.into()))?;
        let mut input_paths = BTreeSet::new();
        let resources = read_tree(&root, &mut input_paths).map_err(scoped)?;

        let mut results = FunctionResultList::new();
        let evaluated = Invocation {
            pkg_dir: root.path(),
            options: &self.options.runner,
            cancel,
            results: &mut results,
        }
        .run(function, Stage::Mutator, resources)
        .await;

        let results_file =
            persist_results(self.options.results_dir.as_deref(), &mut results, evaluated.is_err())
                .map_err(|e| scoped(e.into()))?;
        let resources = evaluated.map_err(|e| scoped(e.into()))?;

        let (summary, stream) = emit(&self.options.output, root.path(), &resources, &input_paths)
            .map_err(|e| scoped(e.into()))?;

        Ok(RenderOutput {
            resources,
            summary,
            stream,
            results,
            results_file,
        })
    }
}

/// Resources of `root` and all nested packages, paths relative to `root`
fn read_tree(root: &Package, input_paths: &mut BTreeSet<String>) -> Result<Vec<Resource>, KptError> {
    let mut seen = BTreeSet::new();
    let mut resources = Vec::new();
    let mut queue = vec![root.clone()];

    while let Some(pkg) = queue.pop() {
        if !seen.insert(pkg.unique_path().to_path_buf()) {
            return Err(KptError::from(EngineError::CycleDetected {
                path: pkg.path().display().to_string(),
            }));
        }
        let prefix = kpt_core::package::relative_slash_path(root.path(), pkg.path());
        for mut resource in pkg.read_resources()? {
            let (path, index) = resource.require_path_index()?;
            let path = if prefix.is_empty() {
                path
            } else {
                format!("{}/{}", prefix, path)
            };
            resource.set_path_index(&path, index)?;
            input_paths.insert(path);
            resources.push(resource);
        }
        let mut subpackages = pkg.subpackages()?;
        subpackages.reverse();
        for dir in subpackages {
            queue.push(Package::open(&dir)?);
        }
    }
    Ok(resources)
}

/// Write results if a results directory is configured
fn persist_results(
    dir: Option<&Path>,
    results: &mut FunctionResultList,
    failed: bool,
) -> Result<Option<PathBuf>, CoreError> {
    if failed {
        results.exit_code = 1;
    }
    let Some(dir) = dir else {
        return Ok(None);
    };
    let path = results.write_to_dir(dir)?;
    tracing::info!(path = %path.display(), "function results written");
    Ok(Some(path))
}

/// Send resources to the configured sink
fn emit(
    sink: &OutputSink,
    root: &Path,
    resources: &[Resource],
    input_paths: &BTreeSet<String>,
) -> Result<(Option<WriteSummary>, Option<String>), CoreError> {
    match sink {
        OutputSink::InPlace => {
            let summary = PackageWriter::new(root).write(resources.to_vec(), input_paths)?;
            for pruned in &summary.pruned {
                tracing::info!(path = %pruned, "pruned file");
            }
            Ok((Some(summary), None))
        }
        OutputSink::Directory(dir) => {
            let summary = PackageWriter::new(dir)
                .prune(false)
                .write(resources.to_vec(), &BTreeSet::new())?;
            Ok((Some(summary), None))
        }
        OutputSink::Stdout => {
            let items = resources
                .iter()
                .map(|r| {
                    let mut r = r.clone();
                    for key in r.annotations().into_keys() {
                        if key.starts_with(INTERNAL_PREFIX) {
                            r.remove_annotation(&key);
                        }
                    }
                    r
                })
                .collect();
            Ok((None, Some(ResourceList::new(items, None).to_yaml())))
        }
        OutputSink::Unwrap => Ok((None, Some(write_unwrapped(resources)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DEPLOY: &str = "# web tier\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 1 # scaled by the pipeline\n";

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn kptfile(name: &str, pipeline: &str) -> String {
        format!("apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: {}\n{}", name, pipeline)
    }

    fn exec_options() -> RenderOptions {
        RenderOptions::new().with_runner(RunnerOptions::new().with_allow_exec(true))
    }

    fn flat_package() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "Kptfile",
            &kptfile("app", "pipeline:\n  mutators:\n  - exec: sh set-replicas.sh\n"),
        );
        write(dir.path(), "set-replicas.sh", "sed 's/replicas: 1/replicas: 3/'\n");
        write(dir.path(), "deploy.yaml", DEPLOY);
        dir
    }

    #[test]
    fn test_output_sink_parsing() {
        assert_eq!("stdout".parse::<OutputSink>().unwrap(), OutputSink::Stdout);
        assert_eq!("unwrap".parse::<OutputSink>().unwrap(), OutputSink::Unwrap);
        assert_eq!(
            "out/dir".parse::<OutputSink>().unwrap(),
            OutputSink::Directory(PathBuf::from("out/dir"))
        );
        assert_eq!("".parse::<OutputSink>().unwrap(), OutputSink::InPlace);
    }

    #[test]
    fn test_failed_results_carry_exit_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut results = FunctionResultList::new();
        let path = persist_results(Some(dir.path()), &mut results, true)
            .unwrap()
            .unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("exitCode: 1"));
        assert_eq!(persist_results(None, &mut results, false).unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_render_flat_package() {
        let pkg = flat_package();
        let results = TempDir::new().unwrap();
        let kptfile_before = fs::read_to_string(pkg.path().join("Kptfile")).unwrap();

        let renderer = Renderer::new(
            exec_options().with_results_dir(Some(results.path().to_path_buf())),
        );
        let output = renderer
            .render(pkg.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.executed_function_count(), 1);
        assert_eq!(output.summary.unwrap().written, vec!["deploy.yaml"]);
        assert_eq!(
            fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap(),
            "# web tier\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\nspec:\n  replicas: 3 # scaled by the pipeline\n"
        );
        assert_eq!(
            fs::read_to_string(pkg.path().join("Kptfile")).unwrap(),
            kptfile_before
        );

        let results_file = output.results_file.unwrap();
        let recorded = fs::read_to_string(results_file).unwrap();
        assert!(recorded.contains("execPath: sh set-replicas.sh"));
        assert!(recorded.contains("exitCode: 0"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_render_is_idempotent() {
        let pkg = flat_package();
        let renderer = Renderer::new(exec_options());
        renderer.render(pkg.path(), &CancellationToken::new()).await.unwrap();
        let first = fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap();

        let second = renderer.render(pkg.path(), &CancellationToken::new()).await.unwrap();
        let summary = second.summary.unwrap();
        assert!(summary.written.is_empty());
        assert!(summary.pruned.is_empty());
        assert_eq!(fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap(), first);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_render_nested_packages_children_first() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(
            root,
            "Kptfile",
            &kptfile("app", "pipeline:\n  mutators:\n  - exec: sh tier.sh\n"),
        );
        write(root, "tier.sh", "sed 's/tier: none/tier: web/'\n");
        write(
            root,
            "app.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\ndata:\n  tier: none\n",
        );
        write(
            root,
            "db/Kptfile",
            &kptfile("db", "pipeline:\n  mutators:\n  - exec: sh replicas.sh\n"),
        );
        write(root, "db/replicas.sh", "sed 's/replicas: 1/replicas: 2/'\n");
        write(
            root,
            "db/deploy.yaml",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: db\nspec:\n  replicas: 1\n  template:\n    metadata:\n      labels:\n        tier: none\n",
        );

        let output = Renderer::new(exec_options())
            .render(root, &CancellationToken::new())
            .await
            .unwrap();

        let order: Vec<&str> = output.results.items.iter().map(|r| r.id()).collect();
        assert_eq!(order, vec!["sh replicas.sh", "sh tier.sh"]);

        let db = fs::read_to_string(root.join("db/deploy.yaml")).unwrap();
        assert!(db.contains("replicas: 2"));
        assert!(db.contains("tier: web"));
        assert!(fs::read_to_string(root.join("app.yaml")).unwrap().contains("tier: web"));

        let paths: BTreeSet<&str> = output.resources.iter().filter_map(|r| r.path()).collect();
        assert!(paths.contains("db/deploy.yaml"));
        assert!(paths.contains("db/Kptfile"));

        let ordered: Vec<&str> = output.resources.iter().filter_map(|r| r.path()).collect();
        let last_db = ordered.iter().rposition(|p| p.starts_with("db/")).unwrap();
        let first_local = ordered.iter().position(|p| !p.starts_with("db/")).unwrap();
        assert!(last_db < first_local, "subpackage output must come first: {:?}", ordered);
        assert_eq!(&ordered[first_local..], &["Kptfile", "app.yaml"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_validator_rejection_writes_nothing() {
        let pkg = flat_package();
        write(
            pkg.path(),
            "Kptfile",
            &kptfile(
                "app",
                "pipeline:\n  mutators:\n  - exec: sh set-replicas.sh\n  validators:\n  - exec: sh check.sh\n",
            ),
        );
        write(
            pkg.path(),
            "check.sh",
            "cat > /dev/null\ncat <<'EOF'\napiVersion: config.kubernetes.io/v1\nkind: ResourceList\nitems: []\nresults:\n- message: replicas too high\n  severity: error\nEOF\nexit 1\n",
        );
        let results = TempDir::new().unwrap();

        let err = Renderer::new(exec_options().with_results_dir(Some(results.path().to_path_buf())))
            .render(pkg.path(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err.find::<EngineError>(),
            Some(EngineError::ValidatorRejected { .. })
        ));
        assert_eq!(err.function.as_deref(), Some("sh check.sh"));
        assert_eq!(fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap(), DEPLOY);

        let recorded: FunctionResultList = serde_yaml::from_str(
            &fs::read_to_string(results.path().join(crate::RESULTS_FILE_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(recorded.exit_code, 1);
        assert_eq!(recorded.items.len(), 2);
        assert!(recorded.items[1].has_errors());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_validator_output_is_discarded() {
        let pkg = flat_package();
        write(
            pkg.path(),
            "Kptfile",
            &kptfile(
                "app",
                "pipeline:\n  mutators:\n  - exec: sh set-replicas.sh\n  validators:\n  - exec: sh rewrite.sh\n",
            ),
        );
        write(pkg.path(), "rewrite.sh", "sed 's/replicas: 3/replicas: 99/'\n");

        let output = Renderer::new(exec_options())
            .render(pkg.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.executed_function_count(), 2);
        let order: Vec<&str> = output.results.items.iter().map(|r| r.id()).collect();
        assert_eq!(order, vec!["sh set-replicas.sh", "sh rewrite.sh"]);
        let deploy = fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap();
        assert!(deploy.contains("replicas: 3"));
        assert!(!deploy.contains("99"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_function_output_is_rejected() {
        let pkg = flat_package();
        write(pkg.path(), "set-replicas.sh", "cat\nprintf '\\377\\376\\n'\n");

        let err = Renderer::new(exec_options())
            .render(pkg.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.find::<EngineError>(),
            Some(EngineError::Core(CoreError::InvalidResourceList { .. }))
        ));
        assert_eq!(fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap(), DEPLOY);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_function_failure_names_the_function() {
        let pkg = flat_package();
        write(pkg.path(), "set-replicas.sh", "echo 'cannot scale' >&2\nexit 2\n");

        let err = Renderer::new(exec_options())
            .render(pkg.path(), &CancellationToken::new())
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.starts_with("fn.render"), "{}", message);
        assert!(message.contains("sh set-replicas.sh"), "{}", message);
        match err.find::<EngineError>() {
            Some(EngineError::FnExec { exit_code, stderr, .. }) => {
                assert_eq!(*exit_code, 2);
                assert_eq!(stderr, "cannot scale");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_subpackage_cycle() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "Kptfile", &kptfile("app", ""));
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let err = Renderer::new(RenderOptions::default())
            .render(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.find::<EngineError>(),
            Some(EngineError::CycleDetected { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subpackage_linked_from_outside_the_root() {
        let outside = TempDir::new().unwrap();
        write(outside.path(), "Kptfile", &kptfile("shared", ""));
        let cm = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: shared\ndata:\n  v: one\n";
        write(outside.path(), "cm.yaml", cm);

        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "Kptfile",
            &kptfile("app", "pipeline:\n  mutators:\n  - exec: sh bump.sh\n"),
        );
        write(dir.path(), "bump.sh", "sed 's/v: one/v: two/'\n");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("linked")).unwrap();

        let err = Renderer::new(exec_options())
            .render(dir.path(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err.find::<EngineError>(),
            Some(EngineError::OutsideRoot { .. })
        ));
        assert_eq!(fs::read_to_string(outside.path().join("cm.yaml")).unwrap(), cm);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_removed_resources_are_pruned() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "Kptfile",
            &kptfile("app", "pipeline:\n  mutators:\n  - exec: sh drop.sh\n"),
        );
        write(dir.path(), "drop.sh", "sed '/^- apiVersion: example.com\\/v1$/,$d'\n");
        write(
            dir.path(),
            "keep.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: keep\n",
        );
        write(
            dir.path(),
            "old.yaml",
            "apiVersion: example.com/v1\nkind: Old\nmetadata:\n  name: old\n",
        );

        let output = Renderer::new(exec_options())
            .render(dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.summary.unwrap().pruned, vec!["old.yaml"]);
        assert!(!dir.path().join("old.yaml").exists());
        assert!(dir.path().join("keep.yaml").exists());
        assert!(dir.path().join("drop.sh").exists());
    }

    #[tokio::test]
    async fn test_stream_and_directory_sinks_leave_package_alone() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "Kptfile", &kptfile("app", ""));
        write(dir.path(), "deploy.yaml", DEPLOY);

        let output = Renderer::new(RenderOptions::new().with_output(OutputSink::Unwrap))
            .render(dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        let stream = output.stream.unwrap();
        assert!(stream.contains("config.kubernetes.io/path: deploy.yaml"));
        assert!(!stream.contains("internal.config.kubernetes.io"));

        let listed = Renderer::new(RenderOptions::new().with_output(OutputSink::Stdout))
            .render(dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        let list = ResourceList::parse(&listed.stream.unwrap()).unwrap();
        assert_eq!(list.items.len(), 2);

        let out = TempDir::new().unwrap();
        Renderer::new(
            RenderOptions::new().with_output(OutputSink::Directory(out.path().to_path_buf())),
        )
        .render(dir.path(), &CancellationToken::new())
        .await
        .unwrap();
        assert_eq!(fs::read_to_string(out.path().join("deploy.yaml")).unwrap(), DEPLOY);
        assert_eq!(fs::read_to_string(dir.path().join("deploy.yaml")).unwrap(), DEPLOY);
    }

    #[tokio::test]
    async fn test_cancelled_render() {
        let pkg = flat_package();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Renderer::new(exec_options())
            .render(pkg.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err.find::<EngineError>(), Some(EngineError::Cancelled)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_eval_runs_one_function_over_the_tree() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "Kptfile", &kptfile("app", ""));
        write(dir.path(), "deploy.yaml", DEPLOY);
        write(dir.path(), "db/Kptfile", &kptfile("db", ""));
        write(
            dir.path(),
            "db/deploy.yaml",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: db\nspec:\n  replicas: 1\n",
        );
        write(dir.path(), "scale.sh", "sed 's/replicas: 1/replicas: 5/'\n");

        let function = Function {
            exec: Some("sh scale.sh".to_string()),
            ..Default::default()
        };
        let output = Evaluator::new(exec_options())
            .eval(dir.path(), &function, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(output.executed_function_count(), 1);
        assert!(fs::read_to_string(dir.path().join("deploy.yaml")).unwrap().contains("replicas: 5"));
        assert!(fs::read_to_string(dir.path().join("db/deploy.yaml")).unwrap().contains("replicas: 5"));
    }
}
