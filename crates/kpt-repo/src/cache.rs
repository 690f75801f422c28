//! Local cache of upstream repositories
//!
//! Each git repository is mirrored once into a bare repository under the
//! cache root, named by the SHA-256 of its URL. Fetches of the same
//! repository are serialized through an advisory lock file next to it.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{RepoError, Result};

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "KPT_CACHE_DIR";

#[derive(Debug, Clone)]
pub struct RepoCache {
    root: PathBuf,
}

impl RepoCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$KPT_CACHE_DIR`, else `~/.kpt/repos`
    pub fn from_env() -> Result<Self> {
        if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|d| !d.is_empty()) {
            return Ok(Self::new(dir));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            RepoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("could not determine home directory, set {}", CACHE_DIR_ENV),
            ))
        })?;
        Ok(Self::new(home.join(".kpt").join("repos")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bare mirror directory for `repo`
    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root.join(cache_key(repo))
    }

    /// Take the lock of `repo`, waiting for other holders
    pub async fn lock(&self, repo: &str) -> Result<RepoLock> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.root.join(format!("{}.lock", cache_key(repo)));
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        let file = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            acquire(&file)?;
            Ok(file)
        })
        .await
        .map_err(|e| RepoError::Io(std::io::Error::other(e)))??;

        tracing::debug!(lock = %path.display(), "acquired repository lock");
        Ok(RepoLock { _file: file, path })
    }
}

/// Stable key of a repository URL
pub fn cache_key(repo: &str) -> String {
    let normalized = repo.trim_end_matches('/');
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Held advisory lock; released when dropped
#[derive(Debug)]
pub struct RepoLock {
    _file: File,
    path: PathBuf,
}

impl RepoLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        tracing::debug!(lock = %self.path.display(), "released repository lock");
    }
}

#[cfg(unix)]
fn acquire(file: &File) -> std::io::Result<()> {
    use rustix::fs::{FlockOperation, flock};
    use std::os::fd::AsFd;

    flock(file.as_fd(), FlockOperation::LockExclusive).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn acquire(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cache_key_is_stable() {
        let a = cache_key("https://github.com/kptdev/kpt.git");
        let b = cache_key("https://github.com/kptdev/kpt.git/");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, cache_key("https://github.com/kptdev/other.git"));
    }

    #[test]
    fn test_repo_dir_under_root() {
        let cache = RepoCache::new("/tmp/cache");
        let dir = cache.repo_dir("https://example.com/repo.git");
        assert!(dir.starts_with("/tmp/cache"));
    }

    #[tokio::test]
    async fn test_lock_is_reacquirable_after_drop() {
        let temp = TempDir::new().unwrap();
        let cache = RepoCache::new(temp.path().join("repos"));
        let lock = cache.lock("https://example.com/repo.git").await.unwrap();
        assert!(lock.path().exists());
        drop(lock);
        let again = cache.lock("https://example.com/repo.git").await.unwrap();
        assert!(again.path().ends_with(format!("{}.lock", cache_key("https://example.com/repo.git"))));
    }
}
