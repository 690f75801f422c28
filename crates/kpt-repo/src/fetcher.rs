//! Uniform access to git and OCI upstreams

use std::path::Path;
use tokio_util::sync::CancellationToken;

use kpt_core::{OriginType, Upstream, UpstreamLock};

use crate::cache::RepoCache;
use crate::error::{RepoError, Result};
use crate::git::GitFetcher;
use crate::oci::OciFetcher;

#[derive(Debug, Clone)]
pub enum Fetcher {
    Git(GitFetcher),
    Oci(OciFetcher),
}

impl Fetcher {
    /// Fetcher for the ref named by an upstream
    pub fn from_upstream(upstream: &Upstream, cache: RepoCache) -> Result<Self> {
        match upstream.origin_type {
            OriginType::Git => {
                let git = upstream.git.as_ref().ok_or_else(|| missing("git"))?;
                Ok(Fetcher::Git(GitFetcher::new(git, cache)))
            }
            OriginType::Oci => {
                let oci = upstream.oci.as_ref().ok_or_else(|| missing("oci"))?;
                Ok(Fetcher::Oci(OciFetcher::new(oci)))
            }
        }
    }

    /// Fetcher for the exact revision recorded in a lock
    pub fn at_lock(lock: &UpstreamLock, cache: RepoCache) -> Result<Self> {
        match lock.origin_type {
            OriginType::Git => {
                let git = lock.git.as_ref().ok_or_else(|| missing("git"))?;
                Ok(Fetcher::Git(GitFetcher::at_lock(git, cache)))
            }
            OriginType::Oci => {
                let oci = lock.oci.as_ref().ok_or_else(|| missing("oci"))?;
                Ok(Fetcher::Oci(OciFetcher::at_lock(oci)))
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Fetcher::Git(git) => git.validate(),
            Fetcher::Oci(oci) => oci.validate(),
        }
    }

    /// Materialize the upstream package into `dest`
    pub async fn fetch(&self, cancel: &CancellationToken, dest: &Path) -> Result<UpstreamLock> {
        match self {
            Fetcher::Git(git) => {
                let lock = git.fetch(cancel, dest).await?;
                Ok(UpstreamLock {
                    origin_type: OriginType::Git,
                    git: Some(lock),
                    oci: None,
                })
            }
            Fetcher::Oci(oci) => {
                let lock = oci.fetch(cancel, dest).await?;
                Ok(UpstreamLock {
                    origin_type: OriginType::Oci,
                    git: None,
                    oci: Some(lock),
                })
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Fetcher::Git(git) => format!("{}@{}", git.repo(), git.git_ref()),
            Fetcher::Oci(oci) => format!("oci://{}", oci.image()),
        }
    }
}

fn missing(section: &str) -> RepoError {
    RepoError::InvalidUpstream {
        arg: section.to_string(),
        reason: format!("upstream of type {} has no {} section", section, section),
    }
}
