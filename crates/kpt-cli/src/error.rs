//! CLI error types with exit code handling
//!
//! Library errors reach the CLI as `KptError`s. A chain of resolvers
//! inspects each one and turns it into a `CliError` carrying the exit code
//! and a remediation hint; the first resolver that recognizes the error
//! wins.

use miette::Diagnostic;
use thiserror::Error;

use kpt_core::{Class, CoreError, KptError, Severity, find_in_chain};
use kpt_engine::EngineError;
use kpt_repo::RepoError;

use crate::exit_codes;

/// CLI-specific error type that includes exit code information
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// A validator rejected the package
    #[error("{message}")]
    #[diagnostic(code(kpt::cli::validation))]
    Validation {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Interrupted by the user
    #[error("{message}")]
    #[diagnostic(code(kpt::cli::cancelled))]
    Cancelled { message: String },

    /// Invalid command line input
    #[error("{message}")]
    #[diagnostic(code(kpt::cli::input))]
    Input {
        message: String,
        #[help]
        help: Option<String>,
    },

    /// Any other failure
    #[error("{message}")]
    #[diagnostic(code(kpt::cli::error))]
    Failed {
        message: String,
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Validation { .. } => exit_codes::VALIDATION_ERROR,
            CliError::Cancelled { .. } => exit_codes::CANCELLED,
            CliError::Input { .. } | CliError::Failed { .. } => exit_codes::ERROR,
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
            help: None,
        }
    }

    pub fn input_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    fn failed(err: &KptError, help: impl Into<String>) -> Self {
        Self::Failed {
            message: err.to_string(),
            help: Some(help.into()),
        }
    }
}

impl From<KptError> for CliError {
    fn from(err: KptError) -> Self {
        resolve(&err)
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Failed {
            message: format!("IO error: {}", err),
            help: None,
        }
    }
}

/// Result type for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

type Resolver = fn(&KptError) -> Option<CliError>;

const RESOLVERS: &[Resolver] = &[
    resolve_cancelled,
    resolve_validator,
    resolve_function_failure,
    resolve_engine,
    resolve_repo,
    resolve_core,
];

/// Turn a library error into a CLI error
pub fn resolve(err: &KptError) -> CliError {
    RESOLVERS
        .iter()
        .find_map(|resolver| resolver(err))
        .unwrap_or_else(|| CliError::Failed {
            message: err.to_string(),
            help: class_help(err.root_class()).map(str::to_string),
        })
}

fn engine_error(err: &KptError) -> Option<&EngineError> {
    find_in_chain::<EngineError>(err)
}

fn repo_error(err: &KptError) -> Option<&RepoError> {
    find_in_chain::<RepoError>(err)
}

/// Core errors sit behind the crate errors' transparent variants
fn core_error(err: &KptError) -> Option<&CoreError> {
    match (engine_error(err), repo_error(err)) {
        (Some(EngineError::Core(core)), _) | (_, Some(RepoError::Core(core))) => Some(core),
        _ => find_in_chain::<CoreError>(err),
    }
}

fn resolve_cancelled(err: &KptError) -> Option<CliError> {
    (err.root_class() == Class::Cancelled).then(|| CliError::Cancelled {
        message: err.to_string(),
    })
}

fn resolve_validator(err: &KptError) -> Option<CliError> {
    match engine_error(err)? {
        EngineError::ValidatorRejected { results, .. } => {
            let mut help = String::new();
            for item in results.iter().filter(|r| r.severity == Severity::Error) {
                if !help.is_empty() {
                    help.push('\n');
                }
                help.push_str(&item.to_string());
            }
            Some(CliError::Validation {
                message: err.to_string(),
                help: (!help.is_empty()).then_some(help),
            })
        }
        _ => None,
    }
}

fn resolve_function_failure(err: &KptError) -> Option<CliError> {
    match engine_error(err)? {
        EngineError::FnExec { exit_code, .. } => Some(CliError::failed(
            err,
            format!(
                "the function exited with code {}; pass --results-dir to keep its structured results",
                exit_code
            ),
        )),
        EngineError::ContainerImage { image, .. } => Some(CliError::failed(
            err,
            format!(
                "check that {} exists and is reachable, or set --image-pull-policy",
                image
            ),
        )),
        EngineError::Spawn { .. } => Some(CliError::failed(
            err,
            "make sure the container runtime is installed, or choose one with KPT_FN_RUNTIME",
        )),
        EngineError::Timeout { .. } => Some(CliError::failed(
            err,
            "the function did not finish in time",
        )),
        _ => None,
    }
}

fn resolve_engine(err: &KptError) -> Option<CliError> {
    match engine_error(err)? {
        EngineError::ExecNotAllowed { .. } => Some(CliError::Input {
            message: err.to_string(),
            help: Some("pass --allow-exec to run exec functions".to_string()),
        }),
        EngineError::CycleDetected { .. } => Some(CliError::failed(
            err,
            "a subpackage links back to one of its parents; remove the symlink",
        )),
        _ => None,
    }
}

fn resolve_repo(err: &KptError) -> Option<CliError> {
    match repo_error(err)? {
        RepoError::LocalDiverged { diff, .. } => Some(CliError::Failed {
            message: err.to_string(),
            help: Some(format!(
                "local changes:\n{}\nuse --strategy resource-merge to keep them",
                diff.trim_end()
            )),
        }),
        RepoError::MergeConflict { .. } => Some(CliError::failed(
            err,
            "rerun without --fail-on-conflict to take the upstream values",
        )),
        RepoError::InvalidUpstream { .. } => Some(CliError::Input {
            message: err.to_string(),
            help: Some(
                "use REPO_URL[.git]/DIR[@REF] for git or oci://IMAGE for OCI".to_string(),
            ),
        }),
        RepoError::RefNotFound { .. } => Some(CliError::failed(
            err,
            "check the branch, tag or commit name",
        )),
        _ => None,
    }
}

fn resolve_core(err: &KptError) -> Option<CliError> {
    match core_error(err)? {
        CoreError::ManifestNotFound { .. } => Some(CliError::failed(
            err,
            "run `kpt init` to turn the directory into a package",
        )),
        CoreError::ManifestInvalid { .. } => {
            Some(CliError::failed(err, "fix the Kptfile and run the command again"))
        }
        _ => None,
    }
}

fn class_help(class: Class) -> Option<&'static str> {
    match class {
        Class::Git => Some("check that git is installed and the repository is reachable"),
        Class::Oci => Some("check the image reference and registry access"),
        Class::Exist => Some("choose another destination"),
        Class::Yaml => Some("fix the YAML syntax and run the command again"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpt_core::ResultItem;

    #[test]
    fn test_validator_rejection_maps_to_validation_exit() {
        let err = KptError::from(EngineError::ValidatorRejected {
            id: "check".to_string(),
            results: vec![ResultItem {
                message: "replicas must be odd".to_string(),
                severity: Severity::Error,
                ..Default::default()
            }],
        })
        .op("fn.render");
        let cli = resolve(&err);
        assert_eq!(cli.exit_code(), exit_codes::VALIDATION_ERROR);
        assert!(matches!(
            cli,
            CliError::Validation { help: Some(ref h), .. } if h.contains("replicas must be odd")
        ));
    }

    #[test]
    fn test_cancellation_maps_to_cancelled_exit() {
        let err = KptError::from(RepoError::Cancelled).op("get");
        assert_eq!(resolve(&err).exit_code(), exit_codes::CANCELLED);
    }

    #[test]
    fn test_wrapped_core_error_is_found() {
        let err = KptError::from(EngineError::Core(CoreError::ManifestNotFound {
            path: "pkg".to_string(),
        }));
        let cli = resolve(&err);
        assert!(matches!(
            cli,
            CliError::Failed { help: Some(ref h), .. } if h.contains("kpt init")
        ));
    }

    #[test]
    fn test_unknown_errors_fall_back_to_class_help() {
        let err = KptError::from(RepoError::Git {
            args: "fetch".to_string(),
            stderr: "unreachable".to_string(),
        });
        let cli = resolve(&err);
        assert_eq!(cli.exit_code(), exit_codes::ERROR);
        assert!(cli.to_string().contains("unreachable"));
    }
}
