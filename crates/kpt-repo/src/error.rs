//! Error types for upstream operations

use miette::Diagnostic;
use thiserror::Error;

use kpt_core::{Class, Classify, CoreError, KptError};

/// Upstream operation errors
#[derive(Debug, Error, Diagnostic)]
pub enum RepoError {
    // ============ Parameter Errors ============
    #[error("invalid upstream '{arg}': {reason}")]
    #[diagnostic(
        code(kpt::upstream::invalid),
        help("use REPO_URL[.git]/DIR[@REF] for git or oci://IMAGE for OCI")
    )]
    InvalidUpstream { arg: String, reason: String },

    #[error("destination {path} already exists")]
    #[diagnostic(code(kpt::get::exist), help("choose another destination or remove the directory"))]
    Exist { path: String },

    #[error("package {path} has no upstream")]
    #[diagnostic(code(kpt::update::no_upstream), help("packages are given an upstream by `kpt get`"))]
    NoUpstream { path: String },

    // ============ Git Errors ============
    #[error("git {args} failed: {stderr}")]
    #[diagnostic(code(kpt::git::command))]
    Git { args: String, stderr: String },

    #[error("reference {git_ref} not found in {repo}")]
    #[diagnostic(code(kpt::git::reference), help("check the branch, tag or commit name"))]
    RefNotFound { repo: String, git_ref: String },

    #[error("directory {directory} not found in {repo} at {git_ref}")]
    #[diagnostic(code(kpt::git::directory))]
    DirectoryNotFound {
        repo: String,
        directory: String,
        git_ref: String,
    },

    // ============ OCI Errors ============
    #[error("OCI registry error for {image}: {message}")]
    #[diagnostic(code(kpt::oci::registry))]
    Oci { image: String, message: String },

    // ============ Update Errors ============
    #[error("local package {path} differs from its upstream")]
    #[diagnostic(
        code(kpt::update::diverged),
        help("the fast-forward strategy needs an unmodified package, use resource-merge instead")
    )]
    LocalDiverged { path: String, diff: String },

    #[error("update of {path} stopped on {count} conflict(s)")]
    #[diagnostic(code(kpt::update::conflict))]
    MergeConflict { path: String, count: usize },

    // ============ Other ============
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

impl Classify for RepoError {
    fn class(&self) -> Class {
        match self {
            RepoError::InvalidUpstream { .. } => Class::InvalidParam,
            RepoError::Exist { .. } => Class::Exist,
            RepoError::NoUpstream { .. } => Class::MissingParam,
            RepoError::Git { .. }
            | RepoError::RefNotFound { .. }
            | RepoError::DirectoryNotFound { .. } => Class::Git,
            RepoError::Oci { .. } => Class::Oci,
            RepoError::LocalDiverged { .. } | RepoError::MergeConflict { .. } => Class::Other,
            RepoError::Cancelled => Class::Cancelled,
            RepoError::Core(e) => e.class(),
            RepoError::Io(_) => Class::Io,
        }
    }
}

impl From<RepoError> for KptError {
    fn from(err: RepoError) -> Self {
        KptError::new(err)
    }
}

impl From<serde_yaml::Error> for RepoError {
    fn from(e: serde_yaml::Error) -> Self {
        RepoError::Core(CoreError::Yaml(e))
    }
}

impl From<walkdir::Error> for RepoError {
    fn from(e: walkdir::Error) -> Self {
        RepoError::Io(e.into())
    }
}

/// Result type for upstream operations
pub type Result<T> = std::result::Result<T, RepoError>;
