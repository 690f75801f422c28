//! Get command - fetch an upstream package into a new directory

use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use kpt_core::{KptError, UpdateStrategy};
use kpt_repo::{GET_OP, default_destination, parse_upstream};

use super::repo_cache;
use crate::display::{self, Reporter};
use crate::error::{CliError, Result};

pub async fn run(
    upstream: &str,
    dest: Option<&Path>,
    strategy: Option<UpdateStrategy>,
    cache_dir: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let parsed = parse_upstream(upstream, strategy)
        .map_err(|e| KptError::from(e).op(GET_OP))?;
    let dest = match dest {
        Some(dest) => dest.to_path_buf(),
        None => default_destination(&parsed).map(PathBuf::from).ok_or_else(|| {
            CliError::input_with_help(
                format!("cannot infer a destination from {}", upstream),
                "pass the destination directory as the second argument",
            )
        })?,
    };
    let cache = repo_cache(cache_dir)?;

    let spinner = display::spinner(format!("Fetching {}", upstream));
    let fetched = kpt_repo::get(&parsed, &dest, cache, cancel).await;
    spinner.finish_and_clear();
    let output = fetched?;

    Reporter::new().success(format!(
        "Fetched {} into {}",
        display::describe_lock(&output.lock),
        output.dest.display()
    ))?;
    Ok(())
}
