//! Writing resources back to files

use indexmap::IndexMap;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::document::starts_with_separator;
use crate::error::{CoreError, Result};
use crate::format::format_resource;
use crate::package::clean_relative_path;
use crate::resource::{INTERNAL_PREFIX, Resource};

/// Outcome of a [`PackageWriter::write`]
#[derive(Debug, Clone, Default)]
pub struct WriteSummary {
    /// Files whose content changed
    pub written: Vec<String>,
    /// Files left untouched because their bytes did not change
    pub unchanged: Vec<String>,
    /// Input files removed because no resource maps to them anymore
    pub pruned: Vec<String>,
}

/// Writes resources to the files named by their path annotations
#[derive(Debug, Clone)]
pub struct PackageWriter {
    root: PathBuf,
    prune: bool,
}

impl PackageWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prune: true,
        }
    }

    /// Whether input files without output resources are deleted
    pub fn prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    /// Write `resources`, then prune `input_paths` that received no resource
    pub fn write(
        &self,
        resources: Vec<Resource>,
        input_paths: &BTreeSet<String>,
    ) -> Result<WriteSummary> {
        let files = group_by_file(resources)?;
        let mut summary = WriteSummary::default();

        for (rel, resources) in &files {
            let text = render_file(resources);
            let target = self.root.join(rel);
            if std::fs::read(&target).is_ok_and(|existing| existing == text.as_bytes()) {
                summary.unchanged.push(rel.clone());
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            write_atomic(&target, text.as_bytes())?;
            tracing::debug!(path = %rel, "wrote file");
            summary.written.push(rel.clone());
        }

        if self.prune {
            for rel in input_paths {
                if files.contains_key(rel) {
                    continue;
                }
                let clean = clean_relative_path(rel)?;
                match std::fs::remove_file(self.root.join(&clean)) {
                    Ok(()) => {
                        tracing::debug!(path = %rel, "pruned file");
                        summary.pruned.push(rel.clone());
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(summary)
    }
}

/// Group resources by cleaned relative path and sort each group by index
fn group_by_file(resources: Vec<Resource>) -> Result<IndexMap<String, Vec<Resource>>> {
    let mut files: IndexMap<String, Vec<(usize, Resource)>> = IndexMap::new();
    for resource in resources {
        let (path, index) = resource.require_path_index()?;
        let clean = clean_relative_path(&path)?;
        let key = clean
            .to_str()
            .ok_or_else(|| CoreError::InvalidPath {
                path: path.clone(),
                message: "path is not valid UTF-8".to_string(),
            })?
            .replace('\\', "/");
        files.entry(key).or_default().push((index, resource));
    }

    Ok(files
        .into_iter()
        .map(|(path, mut entries)| {
            entries.sort_by_key(|(index, _)| *index);
            (path, entries.into_iter().map(|(_, r)| r).collect())
        })
        .collect())
}

/// Text of one file holding `resources` in order
///
/// Unmodified resources are written from their source text.
pub fn render_file(resources: &[Resource]) -> String {
    let mut out = String::new();
    for (i, resource) in resources.iter().enumerate() {
        let mut resource = resource.clone();
        resource.strip_internal_annotations();

        if i > 0 && !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }

        match resource.original_text() {
            Some(raw) => {
                if i == 0 && !resource.first_in_file() && starts_with_separator(raw) {
                    out.push_str(raw.split_once('\n').map(|(_, rest)| rest).unwrap_or(""));
                } else {
                    if i > 0 && !starts_with_separator(raw) {
                        out.push_str("---\n");
                    }
                    out.push_str(raw);
                }
            }
            None => {
                format_resource(&mut resource);
                if i > 0 {
                    out.push_str("---\n");
                }
                out.push_str(&resource.to_yaml());
            }
        }
    }
    out
}

/// Multi-document YAML for resources, engine annotations removed except
/// the legacy path and index ones
pub fn write_unwrapped(resources: &[Resource]) -> String {
    let mut out = String::new();
    for (i, resource) in resources.iter().enumerate() {
        let mut resource = resource.clone();
        let internal: Vec<String> = resource
            .annotations()
            .into_keys()
            .filter(|k| k.starts_with(INTERNAL_PREFIX))
            .collect();
        for key in internal {
            resource.remove_annotation(&key);
        }
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&resource.to_yaml());
    }
    out
}

/// Replace `path` with `bytes` through a temporary file in the same directory
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| CoreError::Io(e.error))?;
    Ok(())
}
