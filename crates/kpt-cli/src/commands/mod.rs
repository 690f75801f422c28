//! CLI commands

use clap::{ArgAction, Args};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use kpt_engine::{ContainerRuntime, ImagePullPolicy, OutputSink, RenderOptions, RenderOutput, RunnerOptions};
use kpt_repo::RepoCache;

use crate::display::{Reporter, pluralize};
use crate::error::{CliError, Result};

pub mod fn_eval;
pub mod get;
pub mod init;
pub mod render;
pub mod update;

/// Flags shared by `render` and `fn eval`
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Directory receiving results.yaml
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Where to write the output: stdout, unwrap, or a directory (default: in place)
    #[arg(short, long)]
    pub output: Option<OutputSink>,

    /// Image pull policy: always, ifNotPresent or never
    #[arg(long, default_value = "ifNotPresent")]
    pub image_pull_policy: ImagePullPolicy,

    /// Container runtime running image functions
    #[arg(long, env = ContainerRuntime::ENV, default_value = "docker")]
    pub runtime: ContainerRuntime,

    /// Allow functions declared with `exec`
    #[arg(long)]
    pub allow_exec: bool,

    /// Truncate function stderr in error messages
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub truncate_output: bool,
}

impl RunArgs {
    pub fn render_options(&self) -> RenderOptions {
        let runner = RunnerOptions::new()
            .with_runtime(self.runtime)
            .with_image_pull_policy(self.image_pull_policy)
            .with_allow_exec(self.allow_exec)
            .with_truncate_output(self.truncate_output);
        RenderOptions::new()
            .with_runner(runner)
            .with_output(self.output.clone().unwrap_or_default())
            .with_results_dir(self.results_dir.clone())
    }
}

/// Cache for upstream repositories, `--cache-dir` first
pub fn repo_cache(cache_dir: Option<&Path>) -> Result<RepoCache> {
    match cache_dir {
        Some(dir) => Ok(RepoCache::new(dir)),
        None => RepoCache::from_env().map_err(|e| CliError::from(kpt_core::KptError::from(e))),
    }
}

/// Print what a render or an eval did; streams go to stdout
pub(crate) fn report_output(
    reporter: &mut Reporter,
    pkg: &Path,
    output: &RenderOutput,
) -> Result<()> {
    reporter.function_results(&output.results)?;
    if let Some(summary) = &output.summary {
        reporter.write_summary(summary)?;
    }
    if let Some(file) = &output.results_file {
        reporter.success(format!("Results written to {}", file.display()))?;
    }
    reporter.success(format!(
        "Executed {} in {}",
        pluralize(output.executed_function_count(), "function", "functions"),
        pkg.display()
    ))?;

    if let Some(stream) = &output.stream {
        let mut stdout = io::stdout().lock();
        stdout.write_all(stream.as_bytes())?;
        stdout.flush()?;
    }
    Ok(())
}
