//! kpt Repo - upstream packages
//!
//! This crate moves packages between their upstream and the local disk:
//!
//! - **Fetchers**: git repositories (through a bare mirror cache) and OCI
//!   images, behind the [`Fetcher`] enum
//! - **`get`**: copy an upstream package into a new directory and record
//!   where it came from
//! - **`update`**: bring a local package to a new upstream revision with one
//!   of the update strategies
//!
//! ## Example
//!
//! ```rust,no_run
//! use kpt_repo::{RepoCache, get, parse_upstream};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let upstream = parse_upstream("https://github.com/kptdev/kpt.git/package-examples/nginx@v0.9", None)?;
//! let cache = RepoCache::from_env()?;
//! get(&upstream, "nginx".as_ref(), cache, &CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod fetcher;
pub mod fs;
pub mod get;
pub mod git;
pub mod oci;
pub mod update;
pub mod upstream;

pub use cache::{CACHE_DIR_ENV, RepoCache, RepoLock};
pub use error::{RepoError, Result};
pub use fetcher::Fetcher;
pub use get::{GET_OP, GetOutput, get};
pub use git::GitFetcher;
pub use oci::OciFetcher;
pub use update::{UPDATE_OP, UpdateOptions, UpdateSummary, split_package_ref, update};
pub use upstream::{default_destination, parse_upstream};
