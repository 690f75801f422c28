//! Init command - turn a directory into a package

use std::fs;
use std::path::Path;

use kpt_core::{KPTFILE_NAME, KptError, KptfileDocument};

use crate::display::Reporter;
use crate::error::{CliError, Result};

pub fn run(dir: &Path, description: Option<&str>) -> Result<()> {
    if dir.join(KPTFILE_NAME).exists() {
        return Err(CliError::input_with_help(
            format!("{} already has a Kptfile", dir.display()),
            "edit the existing Kptfile instead",
        ));
    }
    fs::create_dir_all(dir)?;

    let name = package_name(dir)?;
    let scoped = |e: kpt_core::CoreError| KptError::from(e).op("init").path(dir);
    let mut doc = KptfileDocument::open_or_new(dir, &name).map_err(scoped)?;
    if let Some(description) = description {
        doc.set_description(description).map_err(scoped)?;
    }
    doc.save().map_err(scoped)?;

    Reporter::new().success(format!("Initialized package {} in {}", name, dir.display()))?;
    Ok(())
}

/// Directory name of `dir`, resolving `.` and friends
fn package_name(dir: &Path) -> Result<String> {
    let resolved = dir.canonicalize()?;
    resolved
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CliError::input(format!("cannot name a package at {}", dir.display())))
}
