//! `get`: copy an upstream package into a new local directory

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use kpt_core::{KptError, KptfileDocument, Upstream, UpstreamLock};

use crate::cache::RepoCache;
use crate::error::{RepoError, Result};
use crate::fetcher::Fetcher;

pub const GET_OP: &str = "get";

/// Outcome of a successful `get`
#[derive(Debug, Clone)]
pub struct GetOutput {
    pub dest: PathBuf,
    pub lock: UpstreamLock,
}

/// Fetch `upstream` into `dest`, which must not exist yet
///
/// The package is staged next to `dest` and renamed into place, so a
/// failed fetch leaves nothing behind.
pub async fn get(
    upstream: &Upstream,
    dest: &Path,
    cache: RepoCache,
    cancel: &CancellationToken,
) -> std::result::Result<GetOutput, KptError> {
    let scoped = |e: RepoError| KptError::from(e).op(GET_OP).path(dest);

    let fetcher = Fetcher::from_upstream(upstream, cache).map_err(scoped)?;
    fetcher.validate().map_err(scoped)?;
    let repo = fetcher.describe();

    get_with(&fetcher, upstream, dest, cancel)
        .await
        .map_err(|e| scoped(e).repo(repo))
}

async fn get_with(
    fetcher: &Fetcher,
    upstream: &Upstream,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<GetOutput> {
    if dest.symlink_metadata().is_ok() {
        return Err(RepoError::Exist {
            path: dest.display().to_string(),
        });
    }
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| RepoError::InvalidUpstream {
            arg: dest.display().to_string(),
            reason: "destination has no directory name".to_string(),
        })?;
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;

    let staging = tempfile::Builder::new()
        .prefix(&format!(".{}-", name))
        .tempdir_in(&parent)?;
    let pkg_dir = staging.path().join(&name);
    std::fs::create_dir_all(&pkg_dir)?;

    let lock = fetcher.fetch(cancel, &pkg_dir).await?;

    let mut doc = KptfileDocument::open_or_new(&pkg_dir, &name)?;
    doc.set_name(&name)?;
    doc.set_upstream(upstream)?;
    doc.set_upstream_lock(&lock)?;
    doc.save()?;

    if cancel.is_cancelled() {
        return Err(RepoError::Cancelled);
    }
    std::fs::rename(&pkg_dir, dest)?;
    tracing::info!(dest = %dest.display(), upstream = %fetcher.describe(), "fetched package");

    Ok(GetOutput {
        dest: dest.to_path_buf(),
        lock,
    })
}
