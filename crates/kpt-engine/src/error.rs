//! Engine error types

use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

use kpt_core::{Class, Classify, CoreError, KptError, ResultItem};

/// Main engine error type
#[derive(Error, Debug, Diagnostic)]
pub enum EngineError {
    #[error("cycle detected in package dependencies at {path}")]
    #[diagnostic(
        code(kpt::render::cycle),
        help("a subpackage links back to one of its ancestors, check for symlinked directories")
    )]
    CycleDetected { path: String },

    #[error("subpackage {path} is not inside the root package {root}")]
    #[diagnostic(code(kpt::render::outside_root))]
    OutsideRoot { path: String, root: String },

    #[error("function {id} failed with exit code {exit_code}{}", stderr_suffix(.stderr))]
    #[diagnostic(code(kpt::function::failed))]
    FnExec {
        id: String,
        exit_code: i32,
        stderr: String,
        results: Vec<ResultItem>,
    },

    #[error("failed to pull image {image}: {message}")]
    #[diagnostic(
        code(kpt::function::image),
        help("check the image name, or retry with --image-pull-policy always")
    )]
    ContainerImage { image: String, message: String },

    #[error("validator {id} rejected the package with {} error(s)", error_count(.results))]
    #[diagnostic(code(kpt::function::validation))]
    ValidatorRejected { id: String, results: Vec<ResultItem> },

    #[error("exec function {exec} is not allowed")]
    #[diagnostic(code(kpt::function::exec), help("pass --allow-exec to run exec functions"))]
    ExecNotAllowed { exec: String },

    #[error("failed to start function {id}: {source}")]
    #[diagnostic(
        code(kpt::function::spawn),
        help("make sure the container runtime (KPT_FN_RUNTIME) or the exec binary is installed")
    )]
    Spawn {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("function {id} timed out after {timeout:?}")]
    #[diagnostic(code(kpt::function::timeout))]
    Timeout { id: String, timeout: Duration },

    #[error("operation cancelled")]
    #[diagnostic(code(kpt::cancelled))]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(code(kpt::core))]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    #[diagnostic(code(kpt::io))]
    Io(#[from] std::io::Error),
}

impl Classify for EngineError {
    fn class(&self) -> Class {
        match self {
            EngineError::CycleDetected { .. } => Class::InvalidParam,
            EngineError::OutsideRoot { .. } => Class::InvalidParam,
            EngineError::ExecNotAllowed { .. } => Class::InvalidParam,
            EngineError::FnExec { .. }
            | EngineError::ContainerImage { .. }
            | EngineError::ValidatorRejected { .. }
            | EngineError::Spawn { .. }
            | EngineError::Timeout { .. } => Class::Other,
            EngineError::Cancelled => Class::Cancelled,
            EngineError::Core(e) => e.class(),
            EngineError::Io(_) => Class::Io,
        }
    }
}

impl From<EngineError> for KptError {
    fn from(err: EngineError) -> Self {
        KptError::new(err)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        return String::new();
    }
    let mut out = String::from("\n  stderr:");
    for line in stderr.trim_end().lines() {
        out.push_str("\n    ");
        out.push_str(line);
    }
    out
}

fn error_count(results: &[ResultItem]) -> usize {
    results
        .iter()
        .filter(|r| r.severity == kpt_core::Severity::Error)
        .count()
}
