//! Core error types and the operation-scoped error wrapper
//!
//! Each crate has its own `thiserror` enum for the failures it produces.
//! Errors crossing a public operation boundary (`render`, `get`, `update`)
//! are wrapped in a [`KptError`] that records which operation, package,
//! function and repository they belong to, plus a coarse [`Class`].

use std::error::Error as StdError;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Boxed error used as the inner cause of a [`KptError`]
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Other,
    Exist,
    Internal,
    InvalidParam,
    MissingParam,
    Git,
    Io,
    Yaml,
    Oci,
    Cancelled,
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Class::Other => "other",
            Class::Exist => "exist",
            Class::Internal => "internal",
            Class::InvalidParam => "invalid parameter",
            Class::MissingParam => "missing parameter",
            Class::Git => "git",
            Class::Io => "io",
            Class::Yaml => "yaml",
            Class::Oci => "oci",
            Class::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Errors that know their own [`Class`]
pub trait Classify {
    fn class(&self) -> Class;
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Kptfile not found in {path}")]
    ManifestNotFound { path: String },

    #[error("invalid Kptfile {path}: {message}")]
    ManifestInvalid { path: String, message: String },

    #[error("invalid function spec: {message}")]
    InvalidFunction { message: String },

    #[error("function config file {path} not found")]
    MissingFunctionConfig { path: String },

    #[error("invalid resource in {path} (document {index}): {message}")]
    InvalidResource {
        path: String,
        index: usize,
        message: String,
    },

    #[error("resource {resource} is missing the {annotation} annotation")]
    MissingAnnotation {
        resource: String,
        annotation: &'static str,
    },

    #[error("invalid ResourceList: {message}")]
    InvalidResourceList { message: String },

    #[error("invalid resource path {path}: {message}")]
    InvalidPath { path: String, message: String },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for CoreError {
    fn class(&self) -> Class {
        match self {
            CoreError::ManifestNotFound { .. } => Class::MissingParam,
            CoreError::ManifestInvalid { .. } => Class::InvalidParam,
            CoreError::InvalidFunction { .. } => Class::InvalidParam,
            CoreError::MissingFunctionConfig { .. } => Class::MissingParam,
            CoreError::InvalidResource { .. } => Class::Yaml,
            CoreError::MissingAnnotation { .. } => Class::Internal,
            CoreError::InvalidResourceList { .. } => Class::Yaml,
            CoreError::InvalidPath { .. } => Class::InvalidParam,
            CoreError::Parse { .. } | CoreError::Yaml(_) => Class::Yaml,
            CoreError::Pattern(_) => Class::InvalidParam,
            CoreError::Io(_) => Class::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error enriched with the operation context it occurred in
///
/// Setting a field on a wrapper clears the same field on a directly wrapped
/// `KptError`, so the rendered message mentions each package, function and
/// repository only once.
#[derive(Debug)]
pub struct KptError {
    pub op: Option<String>,
    pub path: Option<PathBuf>,
    pub function: Option<String>,
    pub repo: Option<String>,
    pub class: Class,
    source: BoxError,
}

impl KptError {
    /// Wrap an error that knows its class
    pub fn new<E>(err: E) -> Self
    where
        E: Classify + StdError + Send + Sync + 'static,
    {
        let class = err.class();
        Self::with_class(class, err)
    }

    /// Wrap any error under an explicit class
    pub fn with_class(class: Class, err: impl Into<BoxError>) -> Self {
        Self {
            op: None,
            path: None,
            function: None,
            repo: None,
            class,
            source: err.into(),
        }
    }

    pub fn op(mut self, op: impl Into<String>) -> Self {
        let op = op.into();
        if let Some(inner) = self.inner_mut() {
            if inner.op.as_deref() == Some(op.as_str()) {
                inner.op = None;
            }
        }
        self.op = Some(op);
        self
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        if let Some(inner) = self.inner_mut() {
            if inner.path.as_ref() == Some(&path) {
                inner.path = None;
            }
        }
        self.path = Some(path);
        self
    }

    pub fn function(mut self, function: impl Into<String>) -> Self {
        let function = function.into();
        if let Some(inner) = self.inner_mut() {
            if inner.function.as_deref() == Some(function.as_str()) {
                inner.function = None;
            }
        }
        self.function = Some(function);
        self
    }

    pub fn repo(mut self, repo: impl Into<String>) -> Self {
        let repo = repo.into();
        if let Some(inner) = self.inner_mut() {
            if inner.repo.as_deref() == Some(repo.as_str()) {
                inner.repo = None;
            }
        }
        self.repo = Some(repo);
        self
    }

    /// The wrapped error
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// Find the first error of type `T` in the cause chain, this error included
    pub fn find<T: StdError + 'static>(&self) -> Option<&T> {
        find_in_chain::<T>(self)
    }

    /// Class of the innermost `KptError` that carries one other than `Other`
    pub fn root_class(&self) -> Class {
        match self.source.downcast_ref::<KptError>() {
            Some(inner) if inner.root_class() != Class::Other => inner.root_class(),
            _ => self.class,
        }
    }

    fn inner_mut(&mut self) -> Option<&mut KptError> {
        self.source.downcast_mut::<KptError>()
    }
}

impl fmt::Display for KptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut prefix = Vec::new();
        if let Some(op) = &self.op {
            prefix.push(op.clone());
        }
        if let Some(path) = &self.path {
            prefix.push(format!("pkg {}", path.display()));
        }
        if let Some(function) = &self.function {
            prefix.push(format!("fn {}", function));
        }
        if let Some(repo) = &self.repo {
            prefix.push(format!("repo {}", repo));
        }

        if prefix.is_empty() {
            write!(f, "{}", self.source)
        } else {
            write!(f, "{}: {}", prefix.join(" "), self.source)
        }
    }
}

impl StdError for KptError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl Classify for KptError {
    fn class(&self) -> Class {
        self.class
    }
}

impl From<CoreError> for KptError {
    fn from(err: CoreError) -> Self {
        KptError::new(err)
    }
}

/// Walk `err` and its sources looking for a `T`
pub fn find_in_chain<'a, T: StdError + 'static>(
    err: &'a (dyn StdError + 'static),
) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}
