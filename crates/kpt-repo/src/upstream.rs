//! Parsing upstream arguments
//!
//! Git upstreams are written `REPO_URL[.git]/DIR[@REF]`: everything up to
//! and including `.git` is the repository, the rest the package directory.
//! Without `.git` the whole argument names the repository. OCI upstreams
//! are written `oci://IMAGE`.

use std::path::Path;

use kpt_core::{GitUpstream, OciUpstream, OriginType, Upstream, UpdateStrategy};

use crate::error::{RepoError, Result};

pub const OCI_SCHEME: &str = "oci://";
pub const DEFAULT_GIT_REF: &str = "main";
pub const DEFAULT_DIRECTORY: &str = "/";

/// Parse a `get` argument into an upstream
pub fn parse_upstream(arg: &str, strategy: Option<UpdateStrategy>) -> Result<Upstream> {
    let invalid = |reason: &str| RepoError::InvalidUpstream {
        arg: arg.to_string(),
        reason: reason.to_string(),
    };

    if let Some(image) = arg.strip_prefix(OCI_SCHEME) {
        if image.is_empty() {
            return Err(invalid("missing image"));
        }
        return Ok(Upstream {
            origin_type: OriginType::Oci,
            git: None,
            oci: Some(OciUpstream {
                image: image.to_string(),
            }),
            update_strategy: strategy,
        });
    }

    let (location, git_ref) = split_ref(arg);
    if git_ref.is_some_and(str::is_empty) {
        return Err(invalid("empty reference after '@'"));
    }
    let (repo, directory) = match location.find(".git") {
        Some(pos) if is_git_suffix(location, pos) => {
            let end = pos + ".git".len();
            (&location[..end], &location[end..])
        }
        _ => (location, ""),
    };
    if repo.is_empty() {
        return Err(invalid("missing repository"));
    }

    let directory = normalize_directory(directory);
    Ok(Upstream {
        origin_type: OriginType::Git,
        git: Some(GitUpstream {
            repo: repo.to_string(),
            directory,
            git_ref: git_ref.unwrap_or(DEFAULT_GIT_REF).to_string(),
        }),
        oci: None,
        update_strategy: strategy,
    })
}

/// Default destination directory name for an upstream
pub fn default_destination(upstream: &Upstream) -> Option<String> {
    let base = match (&upstream.git, &upstream.oci) {
        (Some(git), _) if git.directory.trim_matches('/').is_empty() => git
            .repo
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit(['/', ':'])
            .next()?
            .to_string(),
        (Some(git), _) => Path::new(git.directory.trim_matches('/'))
            .file_name()?
            .to_string_lossy()
            .into_owned(),
        (None, Some(oci)) => {
            let name = oci.image.split(['@']).next()?;
            let last = name.rsplit('/').next()?;
            last.split(':').next()?.to_string()
        }
        (None, None) => return None,
    };
    (!base.is_empty()).then_some(base)
}

/// Whether `repo` is something git can fetch from: a URL, an scp-like
/// address or a local path
pub fn is_fetchable_repo(repo: &str) -> bool {
    if let Ok(url) = url::Url::parse(repo) {
        // single letters are Windows drive prefixes
        if url.scheme().len() > 1 {
            return matches!(url.scheme(), "https" | "http" | "ssh" | "git" | "file");
        }
    }
    if let Some((host, _)) = repo.split_once(':') {
        if host.contains('@') && !host.contains('/') {
            return true;
        }
    }
    Path::new(repo).exists()
}

fn split_ref(arg: &str) -> (&str, Option<&str>) {
    // an '@' before the path belongs to an scp-like user, not a ref
    match arg.rfind('@') {
        Some(pos) if arg[pos..].contains(['/', ':']) => (arg, None),
        Some(pos) => (&arg[..pos], Some(&arg[pos + 1..])),
        None => (arg, None),
    }
}

fn is_git_suffix(location: &str, pos: usize) -> bool {
    matches!(location[pos + ".git".len()..].chars().next(), None | Some('/'))
}

fn normalize_directory(directory: &str) -> String {
    let trimmed = directory.trim_matches('/');
    if trimmed.is_empty() {
        DEFAULT_DIRECTORY.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
