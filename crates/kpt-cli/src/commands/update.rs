//! Update command - move a package to a new upstream revision

use std::path::Path;
use tokio_util::sync::CancellationToken;

use kpt_core::UpdateStrategy;
use kpt_repo::{UpdateOptions, split_package_ref};

use super::repo_cache;
use crate::display::{self, Reporter};
use crate::error::Result;

pub async fn run(
    pkg_ref: &str,
    strategy: Option<UpdateStrategy>,
    fail_on_conflict: bool,
    cache_dir: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (pkg, git_ref) = split_package_ref(pkg_ref);
    let options = UpdateOptions::new()
        .with_ref(git_ref)
        .with_strategy(strategy)
        .with_fail_on_conflict(fail_on_conflict);
    let cache = repo_cache(cache_dir)?;

    let spinner = display::spinner(format!("Updating {}", pkg.display()));
    let updated = kpt_repo::update(&pkg, &options, cache, cancel).await;
    spinner.finish_and_clear();
    let summary = updated?;

    Reporter::new().update_summary(&pkg.display().to_string(), &summary)?;
    Ok(())
}
