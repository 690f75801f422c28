//! Git upstream fetcher
//!
//! Repositories are mirrored into a bare cache repository and materialized
//! with `git archive`, so no worktree is ever checked out. The ref is first
//! fetched shallowly; short SHAs and refs the server will not hand out
//! directly fall back to a single full fetch.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use kpt_core::{GitLock, GitUpstream};

use crate::cache::RepoCache;
use crate::error::{RepoError, Result};
use crate::fs::{copy_dir, extract_archive};
use crate::upstream::is_fetchable_repo;

#[derive(Debug, Clone)]
pub struct GitFetcher {
    repo: String,
    directory: String,
    git_ref: String,
    cache: RepoCache,
}

impl GitFetcher {
    pub fn new(upstream: &GitUpstream, cache: RepoCache) -> Self {
        Self {
            repo: upstream.repo.clone(),
            directory: upstream.directory.clone(),
            git_ref: upstream.git_ref.clone(),
            cache,
        }
    }

    /// Fetcher pinned to the commit recorded in a lock
    pub fn at_lock(lock: &GitLock, cache: RepoCache) -> Self {
        Self {
            repo: lock.repo.clone(),
            directory: lock.directory.clone(),
            git_ref: lock.commit.clone(),
            cache,
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn git_ref(&self) -> &str {
        &self.git_ref
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| RepoError::InvalidUpstream {
            arg: self.repo.clone(),
            reason: reason.to_string(),
        };
        if self.repo.is_empty() {
            return Err(invalid("missing repository"));
        }
        if self.git_ref.is_empty() {
            return Err(invalid("missing ref"));
        }
        if self.git_ref.starts_with('-') {
            return Err(invalid("ref must not start with '-'"));
        }
        if self.directory.split('/').any(|part| part == "..") {
            return Err(invalid("directory must stay inside the repository"));
        }
        if !is_fetchable_repo(&self.repo) {
            return Err(invalid("not a git URL or an existing local path"));
        }
        Ok(())
    }

    /// Fetch the package directory into `dest` and return the resolved lock
    pub async fn fetch(&self, cancel: &CancellationToken, dest: &Path) -> Result<GitLock> {
        self.validate()?;
        if cancel.is_cancelled() {
            return Err(RepoError::Cancelled);
        }
        let _lock = self.cache.lock(&self.repo).await?;

        let mirror = self.cache.repo_dir(&self.repo);
        if !mirror.join("HEAD").is_file() {
            std::fs::create_dir_all(&mirror)?;
            run_git(&mirror, &["init", "--bare", "--quiet"], cancel).await?;
        }

        let commit = self.resolve(&mirror, cancel).await?;
        tracing::info!(repo = %self.repo, git_ref = %self.git_ref, commit = %commit, "resolved upstream");

        let directory = self.directory.trim_matches('/');
        // a tree, not a commit, so the archive carries no commit header
        let treeish = if directory.is_empty() {
            format!("{}^{{tree}}", commit)
        } else {
            format!("{}:{}", commit, directory)
        };
        let exists = git_output(&mirror, &["cat-file", "-e", &treeish], cancel).await?;
        if !exists.status.success() {
            return Err(RepoError::DirectoryNotFound {
                repo: self.repo.clone(),
                directory: self.directory.clone(),
                git_ref: self.git_ref.clone(),
            });
        }

        let archive = run_git(&mirror, &["archive", "--format=tar", &treeish], cancel).await?;
        let staging = tempfile::tempdir()?;
        let unpacked: PathBuf = staging.path().to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&archive, &unpacked))
            .await
            .map_err(|e| RepoError::Io(std::io::Error::other(e)))??;
        copy_dir(staging.path(), dest)?;

        Ok(GitLock {
            repo: self.repo.clone(),
            directory: self.directory.clone(),
            git_ref: self.git_ref.clone(),
            commit,
        })
    }

    async fn resolve(&self, mirror: &Path, cancel: &CancellationToken) -> Result<String> {
        let shallow = git_output(
            mirror,
            &["fetch", "--quiet", "--depth", "1", "--no-tags", &self.repo, &self.git_ref],
            cancel,
        )
        .await?;
        if shallow.status.success() {
            if let Some(commit) = rev_parse(mirror, "FETCH_HEAD", cancel).await? {
                return Ok(commit);
            }
        }
        tracing::debug!(
            repo = %self.repo,
            git_ref = %self.git_ref,
            "shallow fetch failed, fetching all refs"
        );

        let mut args = vec!["fetch", "--quiet", "--force"];
        if mirror.join("shallow").exists() {
            args.push("--unshallow");
        }
        args.extend([
            self.repo.as_str(),
            "+refs/heads/*:refs/remotes/origin/*",
            "+refs/tags/*:refs/tags/*",
        ]);
        run_git(mirror, &args, cancel).await?;

        let candidates = [
            format!("refs/remotes/origin/{}", self.git_ref),
            format!("refs/tags/{}", self.git_ref),
            self.git_ref.clone(),
        ];
        for candidate in &candidates {
            if let Some(commit) = rev_parse(mirror, candidate, cancel).await? {
                return Ok(commit);
            }
        }
        Err(RepoError::RefNotFound {
            repo: self.repo.clone(),
            git_ref: self.git_ref.clone(),
        })
    }
}

async fn rev_parse(mirror: &Path, rev: &str, cancel: &CancellationToken) -> Result<Option<String>> {
    let spec = format!("{}^{{commit}}", rev);
    let output = git_output(mirror, &["rev-parse", "--verify", "--quiet", &spec], cancel).await?;
    if !output.status.success() {
        return Ok(None);
    }
    let commit = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!commit.is_empty()).then_some(commit))
}

/// Run git and return its stdout, failing on a non-zero exit
async fn run_git(cwd: &Path, args: &[&str], cancel: &CancellationToken) -> Result<Vec<u8>> {
    let output = git_output(cwd, args, cancel).await?;
    if !output.status.success() {
        return Err(RepoError::Git {
            args: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

async fn git_output(
    cwd: &Path,
    args: &[&str],
    cancel: &CancellationToken,
) -> Result<std::process::Output> {
    tracing::debug!(cwd = %cwd.display(), args = %args.join(" "), "running git");
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = command.output();

    tokio::select! {
        output = child => output.map_err(|e| RepoError::Git {
            args: args.join(" "),
            stderr: e.to_string(),
        }),
        _ = cancel.cancelled() => Err(RepoError::Cancelled),
    }
}
